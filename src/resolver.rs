//! Resource resolution for renderer callbacks.
//!
//! The renderer fetches every external resource (tiles, glyph ranges,
//! sprites, remote URLs) through one `fetch(url)` entry point, dispatched
//! by URL scheme. Archive misses and upstream failures are swallowed here:
//! the renderer receives a synthesized empty resource so a missing tile
//! never aborts a render.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;
use flate2::read::GzDecoder;

use crate::error::{RenderServerError, Result};
use crate::fonts::FontLibrary;
use crate::sources::{SourceHandle, TileCompression, TileFormat};

/// Resource returned to the renderer.
#[derive(Debug, Clone, Default)]
pub struct ResolvedResource {
    pub data: Bytes,
    pub modified: Option<SystemTime>,
    pub expires: Option<SystemTime>,
    pub etag: Option<String>,
}

impl ResolvedResource {
    fn from_data(data: Bytes) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// Optional pass-through filter on vector tile data and source tileJSON.
pub type DataDecorator =
    Arc<dyn Fn(&str, &str, Bytes, Option<(u8, u32, u32)>) -> Bytes + Send + Sync>;

/// A style source bound to its archive reader.
pub struct BoundSource {
    pub handle: SourceHandle,
    /// Fill color used when synthesizing empty raster tiles.
    pub fill_color: Option<String>,
}

pub struct ResourceResolver {
    sprites_dir: PathBuf,
    fonts: Arc<FontLibrary>,
    allowed_fonts: Option<BTreeSet<String>>,
    sources: Arc<HashMap<String, BoundSource>>,
    http: reqwest::Client,
    decorator: Option<DataDecorator>,
}

impl ResourceResolver {
    pub fn new(
        sprites_dir: PathBuf,
        fonts: Arc<FontLibrary>,
        allowed_fonts: Option<BTreeSet<String>>,
        sources: Arc<HashMap<String, BoundSource>>,
        http: reqwest::Client,
        decorator: Option<DataDecorator>,
    ) -> Self {
        Self {
            sprites_dir,
            fonts,
            allowed_fonts,
            sources,
            http,
            decorator,
        }
    }

    /// Serve one renderer resource request. Invoked from renderer worker
    /// threads; must stay safe under parallel calls.
    pub async fn fetch(&self, url: &str) -> Result<ResolvedResource> {
        if let Some(rest) = url.strip_prefix("sprites://") {
            self.fetch_sprite(rest).await
        } else if let Some(rest) = url.strip_prefix("fonts://") {
            self.fetch_glyphs(rest).await
        } else if let Some(rest) = url.strip_prefix("pmtiles://") {
            self.fetch_archive_tile("pmtiles", rest).await
        } else if let Some(rest) = url.strip_prefix("mbtiles://") {
            self.fetch_archive_tile("mbtiles", rest).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url).await
        } else {
            Err(RenderServerError::bad_request(format!(
                "unsupported resource scheme: {url}"
            )))
        }
    }

    async fn fetch_sprite(&self, path: &str) -> Result<ResolvedResource> {
        let decoded = urlencoding::decode(path)
            .map_err(|_| RenderServerError::bad_request("invalid sprite path encoding"))?;
        let relative = decoded.trim_start_matches('/');
        if relative.contains("..") {
            return Err(RenderServerError::bad_request("invalid sprite path"));
        }

        let full = self.sprites_dir.join(relative);
        let data = tokio::fs::read(&full).await.map_err(|e| {
            RenderServerError::NotFound(format!("sprite {}: {e}", full.display()))
        })?;
        Ok(ResolvedResource::from_data(Bytes::from(data)))
    }

    async fn fetch_glyphs(&self, rest: &str) -> Result<ResolvedResource> {
        // fonts://<fontstack>/<range>.pbf
        let rest = rest.trim_start_matches('/');
        let (fontstack, range_file) = rest
            .rsplit_once('/')
            .ok_or_else(|| RenderServerError::bad_request("invalid glyph URL"))?;
        let range = range_file
            .strip_suffix(".pbf")
            .ok_or_else(|| RenderServerError::bad_request("invalid glyph URL"))?;

        let data = self
            .fonts
            .assemble(fontstack, range, self.allowed_fonts.as_ref())
            .await?;
        Ok(ResolvedResource::from_data(data))
    }

    async fn fetch_archive_tile(&self, scheme: &str, rest: &str) -> Result<ResolvedResource> {
        let parsed = parse_tile_url(rest);
        let Some((name, z, x, y, ext)) = parsed else {
            return Err(RenderServerError::bad_request(format!(
                "invalid tile URL: {scheme}://{rest}"
            )));
        };

        let Some(source) = self.sources.get(&name) else {
            tracing::warn!("render requested unknown source {name:?}");
            return Ok(ResolvedResource::from_data(Bytes::new()));
        };
        if source.handle.scheme() != scheme {
            tracing::warn!(
                "source {name:?} is {}, requested as {scheme}",
                source.handle.scheme()
            );
            return self.empty_tile(source, &ext);
        }

        let format = source.handle.info().format();
        match source.handle.get_tile(z, x, y).await {
            Ok(Some(tile)) => {
                let mut data = tile.data;
                if format.is_vector() && tile.compression == TileCompression::Gzip {
                    data = match gunzip(&data) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            tracing::warn!("tile {name}/{z}/{x}/{y} gunzip failed: {e}");
                            return self.empty_tile(source, &ext);
                        }
                    };
                }
                if format.is_vector() {
                    if let Some(decorate) = &self.decorator {
                        data = decorate(&name, "data", data, Some((z, x, y)));
                    }
                }
                Ok(ResolvedResource {
                    data,
                    modified: source.handle.info().last_modified,
                    ..ResolvedResource::default()
                })
            }
            Ok(None) => self.empty_tile(source, &ext),
            Err(e) => {
                tracing::warn!("tile read {name}/{z}/{x}/{y} failed: {e}");
                self.empty_tile(source, &ext)
            }
        }
    }

    fn empty_tile(&self, source: &BoundSource, ext: &str) -> Result<ResolvedResource> {
        let format: TileFormat = ext.parse().unwrap_or(TileFormat::Unknown);
        let data = synthesize_empty(format, source.fill_color.as_deref())?;
        Ok(ResolvedResource::from_data(data))
    }

    async fn fetch_http(&self, url: &str) -> Result<ResolvedResource> {
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("HTTP fetch {url} failed: {e}");
                return Ok(ResolvedResource::from_data(synthesize_empty(
                    format_from_url(url),
                    None,
                )?));
            }
        };

        if !response.status().is_success() {
            tracing::debug!("HTTP fetch {url} returned {}", response.status());
            return Ok(ResolvedResource::from_data(synthesize_empty(
                format_from_url(url),
                None,
            )?));
        }

        let header_time = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| httpdate::parse_http_date(v).ok())
        };
        let modified = header_time("last-modified");
        let expires = header_time("expires");
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.bytes().await {
            Ok(data) => Ok(ResolvedResource {
                data,
                modified,
                expires,
                etag,
            }),
            Err(e) => {
                tracing::warn!("HTTP body read {url} failed: {e}");
                Ok(ResolvedResource::from_data(synthesize_empty(
                    format_from_url(url),
                    None,
                )?))
            }
        }
    }
}

/// Parse `<name>/<z>/<x>/<y>.<ext>` from a tile URL tail.
fn parse_tile_url(rest: &str) -> Option<(String, u8, u32, u32, String)> {
    let mut segments = rest.split('/');
    let name = segments.next()?;
    let z: u8 = segments.next()?.parse().ok()?;
    let x: u32 = segments.next()?.parse().ok()?;
    let y_ext = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let (y, ext) = y_ext.split_once('.')?;
    let y: u32 = y.parse().ok()?;
    let name = urlencoding::decode(name).ok()?.into_owned();
    Some((name, z, x, y, ext.to_string()))
}

fn format_from_url(url: &str) -> TileFormat {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit_once('.')
        .map(|(_, ext)| ext.parse().unwrap_or(TileFormat::Unknown))
        .unwrap_or(TileFormat::Unknown)
}

fn gunzip(data: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

/// Synthesized empty resources, cached process-wide by `(format, color)`.
///
/// Vector and unknown formats get a zero-byte buffer; raster formats get a
/// 1x1 image of the source's declared fill color, defaulting to fully
/// transparent white.
pub fn synthesize_empty(format: TileFormat, fill_color: Option<&str>) -> Result<Bytes> {
    use image::{ImageFormat as ImgFormat, Rgba, RgbaImage};

    if !matches!(
        format,
        TileFormat::Png | TileFormat::Jpeg | TileFormat::Webp
    ) {
        return Ok(Bytes::new());
    }

    static CACHE: OnceLock<moka::sync::Cache<(TileFormat, String), Bytes>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| moka::sync::Cache::builder().max_capacity(256).build());

    let color_key = fill_color.unwrap_or("").to_string();
    if let Some(hit) = cache.get(&(format, color_key.clone())) {
        return Ok(hit);
    }

    let rgba = fill_color
        .and_then(|c| csscolorparser::parse(c).ok())
        .map(|c| c.to_rgba8())
        .unwrap_or([255, 255, 255, 0]);

    let img = RgbaImage::from_pixel(1, 1, Rgba(rgba));
    let mut cursor = std::io::Cursor::new(Vec::new());
    let target = match format {
        TileFormat::Png => ImgFormat::Png,
        TileFormat::Jpeg => ImgFormat::Jpeg,
        TileFormat::Webp => ImgFormat::WebP,
        _ => unreachable!(),
    };
    let dynamic = image::DynamicImage::ImageRgba8(img);
    let encodable = if format == TileFormat::Jpeg {
        image::DynamicImage::ImageRgb8(dynamic.to_rgb8())
    } else {
        dynamic
    };
    encodable
        .write_to(&mut cursor, target)
        .map_err(|e| RenderServerError::Render(format!("empty tile encoding failed: {e}")))?;

    let bytes = Bytes::from(cursor.into_inner());
    cache.insert((format, color_key), bytes.clone());
    Ok(bytes)
}
