//! Server-side rendering: pooled native renderers, the request pipeline,
//! and overlay rasterization.

pub mod markers;
pub mod native;
pub mod overlay;
pub mod pipeline;
pub mod pool;
pub mod statics;

pub use native::{Camera, RawImage, RenderMode, Renderer};
pub use pipeline::{respond_image, RenderImageRequest, RenderOutput};
pub use pool::{Lease, Pool, PoolBounds};

/// Encodable output format of a rendered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    /// Parse a request extension; `jpg` folds into `jpeg`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}
