//! HTTP surface: rendered tiles, static maps, style info, glyph ranges.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{RenderServerError, Result};
use crate::fonts::FontLibrary;
use crate::projection;
use crate::render::markers::{load_marker_icons, IconPolicy};
use crate::render::overlay::{rasterize_overlay, OverlayContext, OverlayQuery};
use crate::render::pipeline::{respond_image, RenderImageRequest, RenderSettings};
use crate::render::statics::{auto_fit, bbox_center, calc_z_for_bbox, StaticView};
use crate::render::{ImageFormat, RenderMode};
use crate::styles::{StyleBinding, StyleRegistry};

/// Pixel size of a served raster tile.
const TILE_SIZE: u32 = 256;
const MAX_TILE_ZOOM: u32 = 22;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StyleRegistry>,
    pub settings: Arc<RenderSettings>,
    pub icon_policy: Arc<IconPolicy>,
    pub fonts: Arc<FontLibrary>,
    pub allowed_fonts: Option<Arc<BTreeSet<String>>>,
    pub http: reqwest::Client,
    pub max_scale_factor: u8,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(health))
        .route("/styles/{id}", get(get_style_info))
        .route("/styles/{id}/{z}/{x}/{yfmt}", get(get_rendered_tile))
        .route("/styles/{id}/static", get(get_wms_static))
        .route("/styles/{id}/static/", get(get_wms_static))
        .route("/styles/{id}/static/{*view}", get(get_static_image))
        .route("/fonts/{fontstack}/{range_pbf}", get(get_font_range))
        .layer(cors)
        .layer(axum::middleware::from_fn(crate::logging::request_logger))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn get_style_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let id = id
        .strip_suffix(".json")
        .ok_or_else(|| RenderServerError::NotFound(id.clone()))?;
    let binding = lookup(&state, id)?;

    let mut tilejson = binding.tilejson.clone();
    tilejson["tiles"] = serde_json::json!([tile_url_template(&binding, &headers)]);

    let mut response = Json(tilejson).into_response();
    insert_last_modified(response.headers_mut(), binding.last_modified);
    Ok(response)
}

async fn get_rendered_tile(
    State(state): State<AppState>,
    Path((id, z, x, yfmt)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let binding = lookup(&state, &id)?;

    let z: u32 = z
        .parse()
        .map_err(|_| RenderServerError::bad_request("invalid zoom"))?;
    let x: u32 = x
        .parse()
        .map_err(|_| RenderServerError::bad_request("invalid column"))?;

    let (y_scale, ext) = yfmt
        .rsplit_once('.')
        .ok_or_else(|| RenderServerError::bad_request("missing format"))?;
    let (y_str, scale) = split_scale_suffix(y_scale, state.max_scale_factor)?;
    let y: u32 = y_str
        .parse()
        .map_err(|_| RenderServerError::bad_request("invalid row"))?;
    let format = ImageFormat::parse(ext)
        .ok_or_else(|| RenderServerError::bad_request(format!("invalid format {ext:?}")))?;

    if z > MAX_TILE_ZOOM || x >= (1u32 << z.min(31)) || y >= (1u32 << z.min(31)) {
        return Err(RenderServerError::TileOutOfBounds { z, x, y });
    }

    if not_modified(&headers, binding.last_modified) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let (lon, lat) = projection::ll(
        (
            (f64::from(x) + 0.5) * projection::TILE_GRID,
            (f64::from(y) + 0.5) * projection::TILE_GRID,
        ),
        f64::from(z),
    );

    let output = respond_image(
        &binding,
        &state.settings,
        RenderImageRequest {
            z: f64::from(z),
            lon,
            lat,
            bearing: 0.0,
            pitch: 0.0,
            width: TILE_SIZE,
            height: TILE_SIZE,
            scale,
            format,
            mode: RenderMode::Tile,
            overlay: None,
            attribution: None,
        },
    )
    .await?;

    Ok(image_response(output.data, format, binding.last_modified))
}

async fn get_static_image(
    State(state): State<AppState>,
    Path((id, view)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let binding = lookup(&state, &id)?;

    let mut segments = view.split('/');
    let mut first = segments
        .next()
        .ok_or_else(|| RenderServerError::bad_request("missing view"))?;
    let raw = first == "raw";
    if raw {
        first = segments
            .next()
            .ok_or_else(|| RenderServerError::bad_request("missing view"))?;
    }
    let size = segments
        .next()
        .ok_or_else(|| RenderServerError::bad_request("missing size"))?;
    if segments.next().is_some() {
        return Err(RenderServerError::bad_request("invalid static path"));
    }

    let view = StaticView::parse(first)?;
    let (width, height, scale, format) = parse_size_segment(size, state.max_scale_factor)?;
    let pairs = query_pairs(query.as_deref(), false);

    render_static(&state, &binding, raw, view, width, height, scale, format, &pairs).await
}

/// WMS-style front door: `?bbox=&width=&height=&format=image/png`. Query
/// keys are lowercased here (and only here); the request is rewritten into
/// the raw bounds form.
async fn get_wms_static(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let binding = lookup(&state, &id)?;
    let pairs = query_pairs(query.as_deref(), true);

    let get = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let bbox_raw = get("bbox")
        .ok_or_else(|| RenderServerError::bad_request("missing bbox"))?;
    let values: Vec<f64> = bbox_raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| RenderServerError::bad_request(format!("invalid bbox {bbox_raw:?}")))?;
    let [min_lon, min_lat, max_lon, max_lat]: [f64; 4] = values
        .try_into()
        .map_err(|_| RenderServerError::bad_request(format!("invalid bbox {bbox_raw:?}")))?;

    let parse_dim = |key: &str| -> Result<u32> {
        get(key)
            .unwrap_or("256")
            .parse()
            .map_err(|_| RenderServerError::bad_request(format!("invalid {key}")))
    };
    let width = parse_dim("width")?;
    let height = parse_dim("height")?;

    let scale: u8 = match get("scale") {
        None => 1,
        Some(raw) => raw
            .parse()
            .ok()
            .filter(|s| (1..=state.max_scale_factor).contains(s))
            .ok_or_else(|| RenderServerError::bad_request(format!("invalid scale {raw:?}")))?,
    };

    let format = match get("format") {
        None => ImageFormat::Png,
        Some(mime) => ImageFormat::parse(mime.strip_prefix("image/").unwrap_or(mime))
            .ok_or_else(|| RenderServerError::bad_request(format!("invalid format {mime:?}")))?,
    };

    let view = StaticView::Bounds {
        min_lon,
        min_lat,
        max_lon,
        max_lat,
    };

    render_static(&state, &binding, true, view, width, height, scale, format, &pairs).await
}

#[allow(clippy::too_many_arguments)]
async fn render_static(
    state: &AppState,
    binding: &Arc<StyleBinding>,
    raw: bool,
    view: StaticView,
    width: u32,
    height: u32,
    scale: u8,
    format: ImageFormat,
    pairs: &[(String, String)],
) -> Result<Response> {
    let overlay_query = OverlayQuery::from_pairs(pairs)?;

    let reproject = |lnglat: (f64, f64)| -> Result<(f64, f64)> {
        match (&binding.data_projection, raw) {
            (Some(projection), false) => projection.transform(lnglat),
            _ => Ok(lnglat),
        }
    };

    let (center, zoom, bearing, pitch) = match view {
        StaticView::Center {
            lon,
            lat,
            zoom,
            bearing,
            pitch,
        } => (reproject((lon, lat))?, zoom, bearing, pitch),
        StaticView::Bounds {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        } => {
            let min = reproject((min_lon, min_lat))?;
            let max = reproject((max_lon, max_lat))?;
            let bbox = [min.0, min.1, max.0, max.1];
            let zoom = calc_z_for_bbox(bbox, width, height, overlay_query.padding);
            (bbox_center(bbox), zoom, 0.0, 0.0)
        }
        StaticView::Auto => {
            let (center, zoom) = auto_fit(&overlay_query, width, height)?;
            (center, zoom, 0.0, 0.0)
        }
    };

    // Markers are fetched and joined before a renderer is reserved.
    let overlay = if overlay_query.has_overlays() {
        let markers =
            load_marker_icons(&overlay_query.markers, &state.icon_policy, &state.http, scale)
                .await?;
        rasterize_overlay(OverlayContext {
            query: &overlay_query,
            center,
            zoom,
            bearing,
            width,
            height,
            scale,
            markers,
        })?
    } else {
        None
    };

    let attribution = overlay_query
        .attribution_text
        .clone()
        .or_else(|| binding.static_attribution.clone());

    let output = respond_image(
        binding,
        &state.settings,
        RenderImageRequest {
            z: zoom,
            lon: center.0,
            lat: center.1,
            bearing,
            pitch,
            width,
            height,
            scale,
            format,
            mode: RenderMode::Static,
            overlay,
            attribution,
        },
    )
    .await?;

    Ok(image_response(output.data, format, binding.last_modified))
}

async fn get_font_range(
    State(state): State<AppState>,
    Path((fontstack, range_pbf)): Path<(String, String)>,
) -> Result<Response> {
    let range = range_pbf
        .strip_suffix(".pbf")
        .ok_or_else(|| RenderServerError::NotFound(range_pbf.clone()))?;

    let data = state
        .fonts
        .assemble(&fontstack, range, state.allowed_fonts.as_deref())
        .await?;

    Ok((
        [(header::CONTENT_TYPE, "application/x-protobuf")],
        data,
    )
        .into_response())
}

fn lookup(state: &AppState, id: &str) -> Result<Arc<StyleBinding>> {
    state
        .registry
        .get(id)
        .ok_or_else(|| RenderServerError::StyleNotFound(id.to_string()))
}

/// Parse an optional `@Nx` suffix. An unknown ratio means the route does
/// not exist, so the error is a 404 rather than a 400.
fn split_scale_suffix(raw: &str, max_scale: u8) -> Result<(&str, u8)> {
    match raw.split_once('@') {
        None => Ok((raw, 1)),
        Some((left, suffix)) => {
            let digits = suffix
                .strip_suffix('x')
                .ok_or_else(|| RenderServerError::NotFound(format!("scale {suffix:?}")))?;
            let scale: u8 = digits
                .parse()
                .map_err(|_| RenderServerError::NotFound(format!("scale {suffix:?}")))?;
            if digits.len() != 1 || !(2..=max_scale).contains(&scale) {
                return Err(RenderServerError::NotFound(format!("scale {suffix:?}")));
            }
            Ok((left, scale))
        }
    }
}

/// Parse `<W>x<H>[@Nx].<format>`.
fn parse_size_segment(raw: &str, max_scale: u8) -> Result<(u32, u32, u8, ImageFormat)> {
    let (dims, ext) = raw
        .rsplit_once('.')
        .ok_or_else(|| RenderServerError::bad_request("missing format"))?;
    let format = ImageFormat::parse(ext)
        .ok_or_else(|| RenderServerError::bad_request(format!("invalid format {ext:?}")))?;

    let (wh, scale) = split_scale_suffix(dims, max_scale)?;
    let (w, h) = wh
        .split_once('x')
        .ok_or_else(|| RenderServerError::bad_request(format!("invalid size {raw:?}")))?;
    let width: u32 = w
        .parse()
        .map_err(|_| RenderServerError::bad_request(format!("invalid width {w:?}")))?;
    let height: u32 = h
        .parse()
        .map_err(|_| RenderServerError::bad_request(format!("invalid height {h:?}")))?;

    Ok((width, height, scale, format))
}

fn query_pairs(query: Option<&str>, lowercase_keys: bool) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| {
            let key = if lowercase_keys {
                k.to_lowercase()
            } else {
                k.into_owned()
            };
            (key, v.into_owned())
        })
        .collect()
}

/// True when the client's cached copy is still valid.
fn not_modified(headers: &HeaderMap, last_modified: SystemTime) -> bool {
    let no_cache = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("no-cache"))
        .unwrap_or(false);
    if no_cache {
        return false;
    }

    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    else {
        return false;
    };

    // HTTP dates carry second precision.
    let elapsed = last_modified
        .duration_since(since)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    elapsed == 0
}

fn insert_last_modified(headers: &mut HeaderMap, last_modified: SystemTime) {
    if let Ok(value) = httpdate::fmt_http_date(last_modified).parse() {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn image_response(data: Vec<u8>, format: ImageFormat, last_modified: SystemTime) -> Response {
    let mut response = (
        [(header::CONTENT_TYPE, format.content_type())],
        data,
    )
        .into_response();
    insert_last_modified(response.headers_mut(), last_modified);
    response
}

fn tile_url_template(binding: &StyleBinding, headers: &HeaderMap) -> String {
    let base = binding.public_url.clone().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}")
    });
    format!(
        "{}/styles/{}/{{z}}/{{x}}/{{y}}.png",
        base.trim_end_matches('/'),
        binding.id
    )
}
