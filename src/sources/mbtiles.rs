//! MBTiles archive reader (SQLite container, gzipped vector tiles).
//!
//! The SQLite connection is synchronous; every query runs on the blocking
//! pool behind a mutex. Metadata comes from the `metadata` table, with the
//! zoom range derived from the `tiles` table when absent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::error::{RenderServerError, Result};
use crate::sources::{check_archive_file, ArchiveInfo, ArchiveTile, TileCompression, TileFormat};

pub struct MbTilesSource {
    conn: Arc<Mutex<Connection>>,
    info: ArchiveInfo,
}

impl MbTilesSource {
    /// Open an archive file read-only and load its metadata.
    pub async fn open_file(path: &Path) -> Result<Self> {
        let file_meta = check_archive_file(path)?;
        let path_buf: PathBuf = path.to_path_buf();

        let (conn, mut info) = tokio::task::spawn_blocking(move || -> Result<_> {
            let conn = Connection::open_with_flags(
                &path_buf,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| {
                RenderServerError::FatalConfig(format!(
                    "failed to open MBTiles archive {}: {e}",
                    path_buf.display()
                ))
            })?;

            let info = read_metadata(&conn).map_err(|e| {
                RenderServerError::FatalConfig(format!(
                    "failed to read MBTiles metadata {}: {e}",
                    path_buf.display()
                ))
            })?;

            Ok((conn, info))
        })
        .await
        .map_err(|e| RenderServerError::Render(format!("blocking task failed: {e}")))??;

        info.last_modified = file_meta.modified().ok();

        tracing::info!(
            "Opened MBTiles archive {} (zoom {}-{}, format {:?})",
            path.display(),
            info.minzoom.unwrap_or(0),
            info.maxzoom.unwrap_or(0),
            info.format()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            info,
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

        let conn = Arc::clone(&self.conn);
        // MBTiles stores rows in TMS order.
        let tms_y = (1u32 << z) - 1 - y;
        let is_vector = self.info.format().is_vector();

        let data = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let conn = conn
                .lock()
                .map_err(|_| RenderServerError::Upstream("MBTiles connection poisoned".into()))?;
            conn.query_row(
                "SELECT tile_data FROM tiles \
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                (z, x, tms_y),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(|e| {
                RenderServerError::Upstream(format!(
                    "MBTiles read failed at z={z} x={x} y={tms_y}: {e}"
                ))
            })
        })
        .await
        .map_err(|e| RenderServerError::Render(format!("blocking task failed: {e}")))??;

        Ok(data.map(|bytes| ArchiveTile {
            data: Bytes::from(bytes),
            // Vector blobs in MBTiles are gzip-compressed by convention.
            compression: if is_vector {
                TileCompression::Gzip
            } else {
                TileCompression::None
            },
        }))
    }
}

fn read_metadata(conn: &Connection) -> rusqlite::Result<ArchiveInfo> {
    let mut rows: HashMap<String, String> = HashMap::new();
    let mut stmt = conn.prepare("SELECT name, value FROM metadata")?;
    let pairs = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for pair in pairs {
        let (name, value) = pair?;
        rows.insert(name, value);
    }

    let mut info = ArchiveInfo {
        name: rows.get("name").cloned(),
        description: rows.get("description").cloned(),
        attribution: rows.get("attribution").cloned(),
        proj4: rows.get("proj4").cloned(),
        format: rows.get("format").map(|f| f.parse().unwrap_or(TileFormat::Pbf)),
        minzoom: rows.get("minzoom").and_then(|v| v.parse().ok()),
        maxzoom: rows.get("maxzoom").and_then(|v| v.parse().ok()),
        bounds: rows.get("bounds").and_then(|v| parse_float_list::<4>(v)),
        center: rows.get("center").and_then(|v| parse_float_list::<3>(v)),
        ..ArchiveInfo::default()
    };

    if let Some(json) = rows.get("json") {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
            info.vector_layers = value.get("vector_layers").cloned();
        }
    }

    // Fall back to the tile index when the metadata table omits the range.
    if info.minzoom.is_none() || info.maxzoom.is_none() {
        let range: Option<(u8, u8)> = conn
            .query_row(
                "SELECT MIN(zoom_level), MAX(zoom_level) FROM tiles",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((min, max)) = range {
            info.minzoom.get_or_insert(min);
            info.maxzoom.get_or_insert(max);
        }
    }

    Ok(info)
}

fn parse_float_list<const N: usize>(raw: &str) -> Option<[f64; N]> {
    let values: Vec<f64> = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    values.try_into().ok()
}
