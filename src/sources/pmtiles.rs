//! PMTiles archive reader (sparse-indexed single-file container).
//!
//! Local files are memory-mapped; HTTP archives are read range-wise with a
//! directory cache. Tile format, compression, zoom range and bounds come
//! from the archive header; attribution and vector layers from the embedded
//! metadata JSON.

use std::path::Path;
use std::sync::Arc;

use pmtiles::{
    AsyncPmTilesReader, Compression as PmCompression, HashMapCache, Header, HttpBackend,
    MmapBackend, TileCoord, TileType,
};
use tokio::sync::RwLock;

use crate::error::{RenderServerError, Result};
use crate::sources::{check_archive_file, ArchiveInfo, ArchiveTile, TileCompression, TileFormat};

type LocalReader = AsyncPmTilesReader<MmapBackend>;
type HttpReader = AsyncPmTilesReader<HttpBackend, HashMapCache>;

enum Reader {
    Local(Arc<RwLock<LocalReader>>),
    Http(Arc<RwLock<HttpReader>>),
}

pub struct PmTilesSource {
    reader: Reader,
    info: ArchiveInfo,
    compression: TileCompression,
}

impl PmTilesSource {
    /// Open a local archive file.
    pub async fn open_file(path: &Path) -> Result<Self> {
        let file_meta = check_archive_file(path)?;

        let backend = MmapBackend::try_from(path).await.map_err(|e| {
            RenderServerError::FatalConfig(format!(
                "failed to open PMTiles archive {}: {e}",
                path.display()
            ))
        })?;
        let reader: LocalReader =
            AsyncPmTilesReader::try_from_source(backend)
                .await
                .map_err(|e| {
                    RenderServerError::FatalConfig(format!(
                        "failed to read PMTiles header {}: {e}",
                        path.display()
                    ))
                })?;

        let header = reader.get_header().clone();
        let metadata = reader.get_metadata().await.ok();
        let mut info = build_info(&header, metadata.as_deref());
        info.last_modified = file_meta.modified().ok();
        let compression = convert_compression(header.tile_compression);

        tracing::info!(
            "Opened PMTiles archive {} (zoom {}-{}, format {:?})",
            path.display(),
            header.min_zoom,
            header.max_zoom,
            info.format()
        );

        Ok(Self {
            reader: Reader::Local(Arc::new(RwLock::new(reader))),
            info,
            compression,
        })
    }

    /// Open an archive served over HTTP.
    pub async fn open_url(url: &str) -> Result<Self> {
        let client = pmtiles::reqwest::Client::builder()
            .user_agent(concat!("tilerender/", env!("CARGO_PKG_VERSION")))
            .use_rustls_tls()
            .build()
            .map_err(|e| {
                RenderServerError::FatalConfig(format!("failed to create HTTP client: {e}"))
            })?;

        let reader: HttpReader =
            AsyncPmTilesReader::new_with_cached_url(HashMapCache::default(), client, url)
                .await
                .map_err(|e| {
                    RenderServerError::FatalConfig(format!(
                        "failed to read PMTiles header from {url}: {e}"
                    ))
                })?;

        let header = reader.get_header().clone();
        let metadata = reader.get_metadata().await.ok();
        let info = build_info(&header, metadata.as_deref());
        let compression = convert_compression(header.tile_compression);

        tracing::info!(
            "Opened remote PMTiles archive {url} (zoom {}-{}, format {:?})",
            header.min_zoom,
            header.max_zoom,
            info.format()
        );

        Ok(Self {
            reader: Reader::Http(Arc::new(RwLock::new(reader))),
            info,
            compression,
        })
    }

    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    pub async fn get_tile(&self, z: u8, x: u32, y: u32) -> Result<Option<ArchiveTile>> {
        if let (Some(min), Some(max)) = (self.info.minzoom, self.info.maxzoom) {
            if z < min || z > max {
                return Ok(None);
            }
        }

        let coord = TileCoord::new(z, x, y).map_err(|_| RenderServerError::TileOutOfBounds {
            z: u32::from(z),
            x,
            y,
        })?;

        let tile = match &self.reader {
            Reader::Local(reader) => reader.read().await.get_tile(coord).await,
            Reader::Http(reader) => reader.read().await.get_tile(coord).await,
        };

        match tile {
            Ok(Some(data)) => Ok(Some(ArchiveTile {
                data,
                compression: self.compression,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(RenderServerError::Upstream(format!(
                "PMTiles read failed at z={z} x={x} y={y}: {e}"
            ))),
        }
    }
}

fn build_info(header: &Header, metadata_json: Option<&str>) -> ArchiveInfo {
    let mut info = ArchiveInfo {
        format: Some(convert_tile_type(header.tile_type)),
        minzoom: Some(header.min_zoom),
        maxzoom: Some(header.max_zoom),
        bounds: Some([
            header.min_longitude,
            header.min_latitude,
            header.max_longitude,
            header.max_latitude,
        ]),
        center: Some([
            header.center_longitude,
            header.center_latitude,
            f64::from(header.center_zoom),
        ]),
        ..ArchiveInfo::default()
    };

    if let Some(raw) = metadata_json {
        if let Ok(meta) = serde_json::from_str::<serde_json::Value>(raw) {
            let get_str =
                |key: &str| meta.get(key).and_then(|v| v.as_str()).map(str::to_string);
            info.name = get_str("name");
            info.description = get_str("description");
            info.attribution = get_str("attribution");
            info.proj4 = get_str("proj4");
            info.vector_layers = meta.get("vector_layers").cloned();
        }
    }

    info
}

fn convert_tile_type(tile_type: TileType) -> TileFormat {
    match tile_type {
        TileType::Mvt => TileFormat::Pbf,
        TileType::Png => TileFormat::Png,
        TileType::Jpeg => TileFormat::Jpeg,
        TileType::Webp => TileFormat::Webp,
        TileType::Avif => TileFormat::Avif,
        TileType::Unknown => TileFormat::Unknown,
    }
}

fn convert_compression(compression: PmCompression) -> TileCompression {
    match compression {
        PmCompression::Gzip => TileCompression::Gzip,
        PmCompression::Brotli => TileCompression::Brotli,
        PmCompression::Zstd => TileCompression::Zstd,
        PmCompression::None | PmCompression::Unknown => TileCompression::None,
    }
}
