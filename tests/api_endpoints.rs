//! HTTP endpoint tests against the full router with the stub renderer and
//! fixture archives generated into a tempdir.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt as _;
use tower::util::ServiceExt as _;

use tilerender::config::{Config, DataConfig, StyleConfig};
use tilerender::fonts::FontLibrary;
use tilerender::render::markers::IconPolicy;
use tilerender::render::pipeline::RenderSettings;
use tilerender::routes::{router, AppState};
use tilerender::styles::{register_style, StyleRegistry};

fn create_mbtiles_fixture(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB);",
    )
    .unwrap();
    for (name, value) in [
        ("name", "fixture"),
        ("format", "pbf"),
        ("minzoom", "0"),
        ("maxzoom", "14"),
        ("bounds", "-180,-85,180,85"),
        ("attribution", "© Fixture Data"),
    ] {
        conn.execute("INSERT INTO metadata VALUES (?1, ?2)", (name, value))
            .unwrap();
    }
}

async fn test_app(tempdir: &Path) -> axum::Router {
    let styles_dir = tempdir.join("styles");
    std::fs::create_dir_all(&styles_dir).unwrap();
    create_mbtiles_fixture(&tempdir.join("fixture.mbtiles"));

    let style = serde_json::json!({
        "version": 8,
        "name": "Test Style",
        "center": [0.0, 0.0],
        "zoom": 2.0,
        "sources": {
            "omt": {"type": "vector", "url": "mbtiles://{omt}"}
        },
        "layers": [
            {"id": "bg", "type": "background", "paint": {"background-color": "#e0dfd8"}}
        ]
    });
    std::fs::write(
        styles_dir.join("test.json"),
        serde_json::to_vec(&style).unwrap(),
    )
    .unwrap();

    let mut config = Config::default();
    config.options.paths.root = tempdir.to_path_buf();
    config.data.insert(
        "omt".to_string(),
        DataConfig {
            mbtiles: Some("fixture.mbtiles".to_string()),
            pmtiles: None,
        },
    );
    let style_cfg = StyleConfig {
        style: "test.json".into(),
        public_url: None,
        tilejson: None,
        watermark: None,
        static_attribution: Some("Test Attribution".to_string()),
    };
    config.styles.insert("test".to_string(), style_cfg.clone());
    // Keep pools small; the stub renderer is cheap but plentiful pools add
    // noise to failures.
    config.options.pool.min = vec![1];
    config.options.pool.max = vec![2];

    let fonts = Arc::new(FontLibrary::scan(tempdir.join("fonts")));
    let http = reqwest::Client::new();

    let registry = Arc::new(StyleRegistry::default());
    let binding = register_style("test", &style_cfg, &config, Arc::clone(&fonts), http.clone())
        .await
        .unwrap();
    registry.insert(binding);

    router(AppState {
        registry,
        settings: Arc::new(RenderSettings::default()),
        icon_policy: Arc::new(IconPolicy::default()),
        fonts,
        allowed_fonts: None,
        http,
        max_scale_factor: config.options.max_scale_factor,
    })
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

fn decode_png(body: &[u8]) -> image::RgbaImage {
    image::load_from_memory(body).unwrap().to_rgba8()
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;
    let (status, _, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test(flavor = "multi_thread")]
async fn rendered_tile_is_a_256px_png() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, headers, body) = get(&app, "/styles/test/2/1/1.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    assert!(headers.contains_key(header::LAST_MODIFIED));

    let img = decode_png(&body);
    assert_eq!(img.dimensions(), (256, 256));
}

#[tokio::test(flavor = "multi_thread")]
async fn conditional_request_returns_304() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (_, headers, _) = get(&app, "/styles/test/2/1/1.png").await;
    let last_modified = headers.get(header::LAST_MODIFIED).unwrap().clone();

    let request = Request::builder()
        .uri("/styles/test/2/1/1.png")
        .header(header::IF_MODIFIED_SINCE, &last_modified)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());

    // Cache-Control: no-cache bypasses the conditional.
    let request = Request::builder()
        .uri("/styles/test/2/1/1.png")
        .header(header::IF_MODIFIED_SINCE, &last_modified)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn zoom_zero_tile_downscales_to_256() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, body) = get(&app, "/styles/test/0/0/0.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_png(&body).dimensions(), (256, 256));
}

#[tokio::test(flavor = "multi_thread")]
async fn scaled_tile_doubles_pixel_dimensions() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, body) = get(&app, "/styles/test/2/1/1@2x.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_png(&body).dimensions(), (512, 512));

    // Ratios above max_scale_factor do not exist as routes.
    let (status, _, _) = get(&app, "/styles/test/2/1/1@4x.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_range_tiles_are_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    for uri in [
        "/styles/test/2/4/0.png",
        "/styles/test/2/0/4.png",
        "/styles/test/23/0/0.png",
        "/styles/unknown/2/1/1.png",
    ] {
        let (status, _, _) = get(&app, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }

    let (status, _, _) = get(&app, "/styles/test/2/1/1.gif").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn static_center_image_has_requested_size() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, body) = get(&app, "/styles/test/static/raw/0,0,2/300x200.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_png(&body).dimensions(), (300, 200));
}

#[tokio::test(flavor = "multi_thread")]
async fn static_bounds_image_renders() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, body) =
        get(&app, "/styles/test/static/raw/-10,-10,10,10/512x512.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_png(&body).dimensions(), (512, 512));
}

#[tokio::test(flavor = "multi_thread")]
async fn path_overlay_changes_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let baseline = get(&app, "/styles/test/static/raw/0,0,2/128x128.png").await;
    let overlaid = get(
        &app,
        "/styles/test/static/raw/0,0,2/128x128.png?path=-10,-10%7C10,10&stroke=%23ff0000&width=4",
    )
    .await;

    assert_eq!(baseline.0, StatusCode::OK);
    assert_eq!(overlaid.0, StatusCode::OK);
    assert_ne!(baseline.2, overlaid.2);

    // The opaque red stroke crosses the center; the stub base has nearly
    // equal red and green there.
    let img = decode_png(&overlaid.2);
    let center = img.get_pixel(64, 64);
    assert!(
        i16::from(center.0[0]) - i16::from(center.0[1]) > 100,
        "expected a red stroke at the center, got {:?}",
        center.0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn marker_overlay_draws_above_location() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let baseline = get(&app, "/styles/test/static/raw/0,0,2/128x128.png").await;
    let marked = get(
        &app,
        "/styles/test/static/raw/0,0,2/128x128.png?marker=0,0%7Cdefault%7Ccolor:%23ff0000%7Cscale:2",
    )
    .await;
    assert_eq!(marked.0, StatusCode::OK);
    assert_ne!(baseline.2, marked.2);

    // Center-bottom anchoring: the pin body sits above (0,0). Red must
    // dominate green there, which the stub base never does on its own.
    let img = decode_png(&marked.2);
    let above = img.get_pixel(64, 44);
    assert!(
        i16::from(above.0[0]) - i16::from(above.0[1]) > 60,
        "expected a red pin above the center, got {:?}",
        above.0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn latlng_swaps_marker_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let swapped = get(
        &app,
        "/styles/test/static/raw/0,0,1/256x256.png?latlng=1&marker=0,10%7Cdefault",
    )
    .await;
    let plain = get(
        &app,
        "/styles/test/static/raw/0,0,1/256x256.png?marker=10,0%7Cdefault",
    )
    .await;
    assert_eq!(swapped.0, StatusCode::OK);
    // `0,10` read as lat,lng equals `10,0` read as lng,lat.
    assert_eq!(swapped.2, plain.2);
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_without_coordinates_is_a_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, body) = get(&app, "/styles/test/static/auto/256x256.png").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("No coordinates provided"));
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_fits_overlay_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, body) = get(
        &app,
        "/styles/test/static/auto/256x256.png?path=-5,-5%7C5,5",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_png(&body).dimensions(), (256, 256));
}

#[tokio::test(flavor = "multi_thread")]
async fn wms_front_door_rewrites_into_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, headers, body) = get(
        &app,
        "/styles/test/static/?BBOX=-10,-10,10,10&WIDTH=300&HEIGHT=200&FORMAT=image/png",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert_eq!(decode_png(&body).dimensions(), (300, 200));

    let (status, _, _) = get(&app, "/styles/test/static/?WIDTH=300").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn style_info_publishes_tilejson() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, headers, body) = get(&app, "/styles/test.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key(header::LAST_MODIFIED));

    let tilejson: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(tilejson["tilejson"], "2.0.0");
    assert_eq!(tilejson["name"], "Test Style");
    assert_eq!(tilejson["attribution"], "© Fixture Data");
    let tiles = tilejson["tiles"][0].as_str().unwrap();
    assert!(tiles.contains("/styles/test/{z}/{x}/{y}.png"), "{tiles}");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_static_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let (status, _, _) = get(&app, "/styles/test/static/raw/0,0,2/4096x64.png").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // 1500 logical px fits at 1x but not at 2x.
    let (status, _, _) = get(&app, "/styles/test/static/raw/0,0,2/1500x64.png").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&app, "/styles/test/static/raw/0,0,2/1500x64@2x.png").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_style_stops_serving() {
    let dir = tempfile::tempdir().unwrap();

    let styles_dir = dir.path().join("styles");
    std::fs::create_dir_all(&styles_dir).unwrap();
    create_mbtiles_fixture(&dir.path().join("fixture.mbtiles"));
    std::fs::write(
        styles_dir.join("test.json"),
        serde_json::to_vec(&serde_json::json!({
            "version": 8, "name": "T",
            "sources": {"omt": {"type": "vector", "url": "mbtiles://{omt}"}},
            "layers": []
        }))
        .unwrap(),
    )
    .unwrap();

    let mut config = Config::default();
    config.options.paths.root = dir.path().to_path_buf();
    config.options.pool.min = vec![1];
    config.options.pool.max = vec![1];
    config.data.insert(
        "omt".to_string(),
        DataConfig {
            mbtiles: Some("fixture.mbtiles".to_string()),
            pmtiles: None,
        },
    );
    let style_cfg = StyleConfig {
        style: "test.json".into(),
        public_url: None,
        tilejson: None,
        watermark: None,
        static_attribution: None,
    };

    let fonts = Arc::new(FontLibrary::scan(dir.path().join("fonts")));
    let http = reqwest::Client::new();
    let registry = Arc::new(StyleRegistry::default());
    let binding = register_style("test", &style_cfg, &config, Arc::clone(&fonts), http.clone())
        .await
        .unwrap();
    registry.insert(binding);

    let app = router(AppState {
        registry: Arc::clone(&registry),
        settings: Arc::new(RenderSettings::default()),
        icon_policy: Arc::new(IconPolicy::default()),
        fonts,
        allowed_fonts: None,
        http,
        max_scale_factor: 3,
    });

    let (status, _, _) = get(&app, "/styles/test/2/1/1.png").await;
    assert_eq!(status, StatusCode::OK);

    assert!(registry.remove("test"));
    let (status, _, _) = get(&app, "/styles/test/2/1/1.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn font_range_endpoint_serves_pbf() {
    let dir = tempfile::tempdir().unwrap();

    let face_dir = dir.path().join("fonts").join("Open Sans Regular");
    std::fs::create_dir_all(&face_dir).unwrap();
    std::fs::write(face_dir.join("0-255.pbf"), b"glyphs").unwrap();

    let app = test_app(dir.path()).await;

    let (status, headers, body) =
        get(&app, "/fonts/Open%20Sans%20Regular/0-255.pbf").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/x-protobuf"
    );
    assert_eq!(body, b"glyphs");

    let (status, _, _) = get(&app, "/fonts/Open%20Sans%20Regular/13-270.pbf").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
