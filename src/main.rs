use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use tilerender::cli::Cli;
use tilerender::config::Config;
use tilerender::fonts::FontLibrary;
use tilerender::render::markers::IconPolicy;
use tilerender::render::pipeline::{load_sans_font, RenderSettings};
use tilerender::routes::{router, AppState};
use tilerender::styles::{register_style, StyleRegistry};
use tilerender::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let otel_layer = telemetry::init_telemetry(&config.telemetry);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    let fonts = Arc::new(FontLibrary::scan(config.options.paths.fonts_dir()));
    let sans_font = load_sans_font(config.options.sans_font.as_deref());
    if sans_font.is_none() {
        tracing::warn!("No sans-serif face found; watermark and attribution are disabled");
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("tilerender/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let registry = Arc::new(StyleRegistry::default());
    for (id, style_cfg) in &config.styles {
        let binding = register_style(id, style_cfg, &config, Arc::clone(&fonts), http.clone())
            .await
            .with_context(|| format!("failed to register style {id:?}"))?;
        registry.insert(binding);
    }
    if config.styles.is_empty() {
        tracing::warn!("No styles configured; only /health will respond usefully");
    }

    let settings = RenderSettings {
        max_size: config.options.max_size,
        tile_margin: config.options.tile_margin,
        jpeg_quality: config.options.format_quality.jpeg,
        webp_quality: config.options.format_quality.webp,
        sans_font,
    };

    let icons_dir = config.options.paths.icons_dir();
    let icon_policy = IconPolicy {
        allow_inline: config.options.allow_inline_marker_images,
        allow_remote: config.options.allow_remote_marker_icons,
        available_icons: scan_icons(&icons_dir),
        icons_dir: Some(icons_dir),
    };

    let state = AppState {
        registry: Arc::clone(&registry),
        settings: Arc::new(settings),
        icon_policy: Arc::new(icon_policy),
        fonts,
        allowed_fonts: config
            .options
            .allowed_fonts
            .as_ref()
            .map(|list| Arc::new(list.iter().cloned().collect())),
        http,
        max_scale_factor: config.options.max_scale_factor,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    registry.close_all();
    telemetry::shutdown_telemetry();
    Ok(())
}

fn scan_icons(dir: &Path) -> BTreeSet<String> {
    let mut icons = BTreeSet::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    icons.insert(name);
                }
            }
        }
    }
    icons
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
