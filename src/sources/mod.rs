//! Tile archive access for style sources.
//!
//! A style source resolves to exactly one archive reader. The two container
//! formats share no code path, so the handle is a tagged variant with a
//! single `get_tile` dispatch instead of a parallel kind map.

use std::str::FromStr;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod mbtiles;
pub mod pmtiles;

pub use mbtiles::MbTilesSource;
pub use pmtiles::PmTilesSource;

use crate::error::{RenderServerError, Result};

/// Tile payload format, as declared by the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Pbf,
    Png,
    Jpeg,
    Webp,
    Avif,
    Unknown,
}

impl TileFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Pbf => "application/x-protobuf",
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
            TileFormat::Webp => "image/webp",
            TileFormat::Avif => "image/avif",
            TileFormat::Unknown => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Pbf => "pbf",
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpg",
            TileFormat::Webp => "webp",
            TileFormat::Avif => "avif",
            TileFormat::Unknown => "bin",
        }
    }

    /// True when tiles are vector data rather than raster images.
    pub fn is_vector(&self) -> bool {
        matches!(self, TileFormat::Pbf)
    }
}

impl FromStr for TileFormat {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "pbf" | "mvt" | "vector" => TileFormat::Pbf,
            "png" => TileFormat::Png,
            "jpg" | "jpeg" => TileFormat::Jpeg,
            "webp" => TileFormat::Webp,
            "avif" => TileFormat::Avif,
            _ => TileFormat::Unknown,
        })
    }
}

/// Compression applied to stored tile blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileCompression {
    None,
    Gzip,
    Brotli,
    Zstd,
}

/// One tile as read from an archive, before any decompression.
#[derive(Debug, Clone)]
pub struct ArchiveTile {
    pub data: Bytes,
    pub compression: TileCompression,
}

/// Archive-level metadata merged into the style source at registration.
#[derive(Debug, Clone, Default)]
pub struct ArchiveInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub attribution: Option<String>,
    pub format: Option<TileFormat>,
    pub minzoom: Option<u8>,
    pub maxzoom: Option<u8>,
    /// `[west, south, east, north]`
    pub bounds: Option<[f64; 4]>,
    /// `[lon, lat, zoom]`
    pub center: Option<[f64; 3]>,
    pub vector_layers: Option<serde_json::Value>,
    /// Custom projection definition carried in archive metadata.
    pub proj4: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl ArchiveInfo {
    pub fn format(&self) -> TileFormat {
        self.format.unwrap_or(TileFormat::Pbf)
    }
}

/// Tagged archive reader handle.
pub enum SourceHandle {
    PmTiles(PmTilesSource),
    MbTiles(MbTilesSource),
}

impl SourceHandle {
    /// The URL scheme this handle serves.
    pub fn scheme(&self) -> &'static str {
        match self {
            SourceHandle::PmTiles(_) => "pmtiles",
            SourceHandle::MbTiles(_) => "mbtiles",
        }
    }

    pub fn info(&self) -> &ArchiveInfo {
        match self {
            SourceHandle::PmTiles(s) => s.info(),
            SourceHandle::MbTiles(s) => s.info(),
        }
    }

    /// Read one tile. `Ok(None)` means the archive holds no data there.
    pub async fn get_tile(&self, z: u8, x: u32, y: u32) -> Result<Option<ArchiveTile>> {
        check_tile_coords(z, x, y)?;
        match self {
            SourceHandle::PmTiles(s) => s.get_tile(z, x, y).await,
            SourceHandle::MbTiles(s) => s.get_tile(z, x, y).await,
        }
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceHandle::{}", self.scheme())
    }
}

pub(crate) fn check_tile_coords(z: u8, x: u32, y: u32) -> Result<()> {
    if z > 30 {
        return Err(RenderServerError::TileOutOfBounds { z: z as u32, x, y });
    }
    let max = 1u32 << z.min(31);
    if x >= max || y >= max {
        return Err(RenderServerError::TileOutOfBounds { z: z as u32, x, y });
    }
    Ok(())
}

/// Verify a resolved archive path is a regular, nonzero file.
pub(crate) fn check_archive_file(path: &std::path::Path) -> Result<std::fs::Metadata> {
    let meta = std::fs::metadata(path).map_err(|e| {
        RenderServerError::FatalConfig(format!("cannot stat archive {}: {e}", path.display()))
    })?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(RenderServerError::FatalConfig(format!(
            "archive {} is not a regular nonzero file",
            path.display()
        )));
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_accepts_aliases() {
        assert_eq!("mvt".parse::<TileFormat>().unwrap(), TileFormat::Pbf);
        assert_eq!("jpeg".parse::<TileFormat>().unwrap(), TileFormat::Jpeg);
        assert_eq!("jpg".parse::<TileFormat>().unwrap(), TileFormat::Jpeg);
        assert_eq!("PNG".parse::<TileFormat>().unwrap(), TileFormat::Png);
        assert_eq!("tiff".parse::<TileFormat>().unwrap(), TileFormat::Unknown);
    }

    #[test]
    fn coordinate_bounds_follow_zoom() {
        assert!(check_tile_coords(0, 0, 0).is_ok());
        assert!(check_tile_coords(0, 1, 0).is_err());
        assert!(check_tile_coords(5, 31, 31).is_ok());
        assert!(check_tile_coords(5, 32, 0).is_err());
        assert!(check_tile_coords(5, 0, 32).is_err());
    }

    #[test]
    fn coordinate_bounds_hold_for_every_serving_zoom() {
        for z in 0u8..=22 {
            let max = 1u32 << z;
            assert!(check_tile_coords(z, 0, 0).is_ok());
            assert!(check_tile_coords(z, max - 1, max - 1).is_ok());
            assert!(check_tile_coords(z, max, 0).is_err(), "x at z={z}");
            assert!(check_tile_coords(z, 0, max).is_err(), "y at z={z}");
            // A value derived from the zoom itself, never in range.
            let outside = max.saturating_mul(2).saturating_add(u32::from(z));
            assert!(check_tile_coords(z, outside, 0).is_err());
        }
    }
}
