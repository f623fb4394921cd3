//! tilerender library
//!
//! Core of the raster tile server: style bindings, renderer pools, the
//! resource resolver, overlay rasterization, and the HTTP surface.

pub mod cli;
pub mod config;
pub mod error;
pub mod fonts;
pub mod logging;
pub mod projection;
pub mod render;
pub mod resolver;
pub mod routes;
pub mod sources;
pub mod styles;
pub mod telemetry;

pub use config::Config;
pub use error::{RenderServerError, Result};
pub use render::{ImageFormat, RenderMode};
pub use routes::{router, AppState};
pub use styles::{register_style, StyleBinding, StyleRegistry};
