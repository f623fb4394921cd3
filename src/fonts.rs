//! Glyph range assembly for the renderer's `fonts://` requests.
//!
//! Each face directory under the fonts root holds 256-glyph ranges as
//! protobuf files (`<face>/<start>-<end>.pbf`). A fontstack request names
//! several faces; their range files are concatenated, which is a valid
//! protobuf merge of the repeated glyph stanzas.

use std::collections::BTreeSet;
use std::path::PathBuf;

use bytes::Bytes;

use crate::error::{RenderServerError, Result};

/// The set of installed faces, scanned once at startup and read-only after.
pub struct FontLibrary {
    dir: PathBuf,
    known: BTreeSet<String>,
}

impl FontLibrary {
    pub fn scan(dir: PathBuf) -> Self {
        let mut known = BTreeSet::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        known.insert(name.to_string());
                    }
                }
            }
        }
        if known.is_empty() {
            tracing::warn!("No font faces found under {}", dir.display());
        } else {
            tracing::info!("Found {} font faces under {}", known.len(), dir.display());
        }
        Self { dir, known }
    }

    pub fn faces(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    pub fn contains(&self, face: &str) -> bool {
        self.known.contains(face)
    }

    /// Combine the glyph range of every requested face into one buffer.
    ///
    /// Unknown faces are dropped; when none of the requested faces exist the
    /// first installed face stands in so text still renders.
    pub async fn assemble(
        &self,
        fontstack: &str,
        range: &str,
        allowed: Option<&BTreeSet<String>>,
    ) -> Result<Bytes> {
        check_range(range)?;

        let decoded = urlencoding::decode(fontstack)
            .map_err(|_| RenderServerError::bad_request("invalid fontstack encoding"))?;
        let mut faces: Vec<&str> = decoded
            .split(',')
            .map(str::trim)
            .filter(|f| sanitize_face(f))
            .filter(|f| self.known.contains(*f))
            .filter(|f| allowed.map_or(true, |a| a.contains(*f)))
            .collect();

        if faces.is_empty() {
            match self.known.iter().next() {
                Some(fallback) => {
                    tracing::debug!("Fontstack {fontstack:?} unknown, using {fallback:?}");
                    faces.push(fallback);
                }
                None => {
                    return Err(RenderServerError::NotFound(format!(
                        "font {fontstack}"
                    )))
                }
            }
        }

        let mut combined = Vec::new();
        for face in faces {
            let path = self.dir.join(face).join(format!("{range}.pbf"));
            match tokio::fs::read(&path).await {
                Ok(data) => combined.extend_from_slice(&data),
                Err(e) => {
                    tracing::warn!("Missing glyph range {}: {e}", path.display());
                }
            }
        }

        if combined.is_empty() {
            return Err(RenderServerError::NotFound(format!(
                "glyph range {fontstack}/{range}"
            )));
        }

        Ok(Bytes::from(combined))
    }
}

fn sanitize_face(face: &str) -> bool {
    !face.is_empty() && !face.contains("..") && !face.contains('/') && !face.contains('\\')
}

fn check_range(range: &str) -> Result<()> {
    let invalid = || RenderServerError::bad_request(format!("invalid glyph range {range:?}"));
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u32 = start.parse().map_err(|_| invalid())?;
    let end: u32 = end.parse().map_err(|_| invalid())?;
    if start % 256 != 0 || end != start + 255 || end > 65_535 {
        return Err(invalid());
    }
    Ok(())
}
