//! TOML configuration.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [options]
//! max_scale_factor = 3
//!
//! [options.paths]
//! root = "~/maps"
//!
//! [styles.basic]
//! style = "basic/style.json"
//!
//! [data.openmaptiles]
//! mbtiles = "tiles/openmaptiles.mbtiles"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RenderServerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub styles: BTreeMap<String, StyleConfig>,
    #[serde(default)]
    pub data: BTreeMap<String, DataConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RenderServerError::FatalConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|e| {
            RenderServerError::FatalConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        config.options.paths.expand();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let scale = self.options.max_scale_factor;
        if !(1..=9).contains(&scale) {
            return Err(RenderServerError::FatalConfig(format!(
                "max_scale_factor must be within 1..=9, got {scale}"
            )));
        }
        for (id, data) in &self.data {
            if data.pmtiles.is_none() == data.mbtiles.is_none() {
                return Err(RenderServerError::FatalConfig(format!(
                    "data source {id:?} must set exactly one of `pmtiles` or `mbtiles`"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// OpenTelemetry export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Trace sampling rate in `0.0..=1.0`.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "tilerender".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            sample_rate: default_sample_rate(),
        }
    }
}

/// Rendering and asset options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    /// Highest `@Nx` pixel ratio served, 1..=9.
    #[serde(default = "default_max_scale_factor")]
    pub max_scale_factor: u8,
    /// Upper bound for `max(width, height) * scale`.
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    /// Extra border rendered around interactive tiles.
    #[serde(default)]
    pub tile_margin: u32,
    #[serde(default)]
    pub format_quality: FormatQuality,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub allow_remote_marker_icons: bool,
    #[serde(default = "default_true")]
    pub allow_inline_marker_images: bool,
    /// Restrict served faces; unset serves everything found on disk.
    #[serde(default)]
    pub allowed_fonts: Option<Vec<String>>,
    /// TrueType face for watermark and attribution text. Falls back to a
    /// scan of well-known system locations.
    #[serde(default)]
    pub sans_font: Option<PathBuf>,
    /// Watermark applied to every style without its own.
    #[serde(default)]
    pub watermark: Option<String>,
}

fn default_max_scale_factor() -> u8 {
    3
}

fn default_max_size() -> u32 {
    2048
}

fn default_true() -> bool {
    true
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            max_scale_factor: default_max_scale_factor(),
            max_size: default_max_size(),
            tile_margin: 0,
            format_quality: FormatQuality::default(),
            pool: PoolConfig::default(),
            allow_remote_marker_icons: false,
            allow_inline_marker_images: true,
            allowed_fonts: None,
            sans_font: None,
            watermark: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatQuality {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg: u8,
    #[serde(default = "default_webp_quality")]
    pub webp: u8,
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_webp_quality() -> u8 {
    90
}

impl Default for FormatQuality {
    fn default() -> Self {
        Self {
            jpeg: default_jpeg_quality(),
            webp: default_webp_quality(),
        }
    }
}

/// Renderer pool bounds, indexed by pixel ratio minus one and clamped to
/// the last entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min")]
    pub min: Vec<usize>,
    #[serde(default = "default_pool_max")]
    pub max: Vec<usize>,
}

fn default_pool_min() -> Vec<usize> {
    vec![8, 4, 2]
}

fn default_pool_max() -> Vec<usize> {
    vec![16, 8, 4]
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_styles_dir")]
    pub styles: PathBuf,
    #[serde(default = "default_fonts_dir")]
    pub fonts: PathBuf,
    #[serde(default = "default_sprites_dir")]
    pub sprites: PathBuf,
    #[serde(default = "default_icons_dir")]
    pub icons: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_styles_dir() -> PathBuf {
    PathBuf::from("styles")
}

fn default_fonts_dir() -> PathBuf {
    PathBuf::from("fonts")
}

fn default_sprites_dir() -> PathBuf {
    PathBuf::from("sprites")
}

fn default_icons_dir() -> PathBuf {
    PathBuf::from("icons")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            styles: default_styles_dir(),
            fonts: default_fonts_dir(),
            sprites: default_sprites_dir(),
            icons: default_icons_dir(),
        }
    }
}

impl PathsConfig {
    fn expand(&mut self) {
        for path in [
            &mut self.root,
            &mut self.styles,
            &mut self.fonts,
            &mut self.sprites,
            &mut self.icons,
        ] {
            if let Some(text) = path.to_str() {
                if let Ok(expanded) = shellexpand::full(text) {
                    *path = PathBuf::from(expanded.into_owned());
                }
            }
        }
    }

    fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        }
    }

    pub fn styles_dir(&self) -> PathBuf {
        self.resolve(&self.styles)
    }

    pub fn fonts_dir(&self) -> PathBuf {
        self.resolve(&self.fonts)
    }

    pub fn sprites_dir(&self) -> PathBuf {
        self.resolve(&self.sprites)
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.resolve(&self.icons)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleConfig {
    /// Style document path, relative to the styles directory.
    pub style: PathBuf,
    /// Overrides the host part of emitted tile URLs.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Shallow overrides merged into the published tileJSON.
    #[serde(default)]
    pub tilejson: Option<serde_json::Value>,
    #[serde(default)]
    pub watermark: Option<String>,
    /// Label stamped onto static images.
    #[serde(default)]
    pub static_attribution: Option<String>,
}

/// One archive the styles may reference by name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataConfig {
    #[serde(default)]
    pub pmtiles: Option<String>,
    #[serde(default)]
    pub mbtiles: Option<String>,
}
