//! Style registration: loading and rewriting style documents, binding
//! archive sources, and building the per-style renderer pools.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde_json::{json, Value};

use crate::config::{Config, StyleConfig};
use crate::error::{RenderServerError, Result};
use crate::fonts::FontLibrary;
use crate::projection::DataProjection;
use crate::render::{Pool, PoolBounds, RenderMode, Renderer};
use crate::resolver::{BoundSource, ResourceResolver};
use crate::sources::{MbTilesSource, PmTilesSource, SourceHandle};

/// Everything one registered style owns: the rewritten document, bound
/// archive readers, and renderer pools per pixel ratio and mode.
pub struct StyleBinding {
    pub id: String,
    /// The rewritten style document handed to renderers.
    pub style_json: Arc<str>,
    /// Published at the style's info endpoint; `tiles` is rewritten with
    /// the request's base URL.
    pub tilejson: Value,
    pub public_url: Option<String>,
    pub sources: Arc<HashMap<String, BoundSource>>,
    tile_pools: Vec<Pool<Renderer>>,
    static_pools: Vec<Pool<Renderer>>,
    pub data_projection: Option<DataProjection>,
    pub last_modified: SystemTime,
    pub watermark: Option<String>,
    pub static_attribution: Option<String>,
    pub max_scale_factor: u8,
}

impl StyleBinding {
    /// Select the pool for a request. Interactive tiles without a margin
    /// use the tile-mode pools; everything else renders in static mode.
    pub fn pool(&self, scale: u8, mode: RenderMode, tile_margin: u32) -> &Pool<Renderer> {
        let idx = usize::from(scale.clamp(1, self.max_scale_factor)) - 1;
        if mode == RenderMode::Tile && tile_margin == 0 {
            &self.tile_pools[idx]
        } else {
            &self.static_pools[idx]
        }
    }

    /// Drain every pool; the binding must not serve requests afterwards.
    pub fn close(&self) {
        for pool in self.tile_pools.iter().chain(&self.static_pools) {
            pool.close();
        }
    }
}

/// The style map: written by register/remove, snapshot-read per request.
#[derive(Default)]
pub struct StyleRegistry {
    bindings: RwLock<HashMap<String, Arc<StyleBinding>>>,
}

impl StyleRegistry {
    pub fn get(&self, id: &str) -> Option<Arc<StyleBinding>> {
        self.bindings.read().ok()?.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bindings
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn insert(&self, binding: Arc<StyleBinding>) {
        let previous = self
            .bindings
            .write()
            .expect("style registry poisoned")
            .insert(binding.id.clone(), binding);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Remove a binding and drain its pools.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .bindings
            .write()
            .expect("style registry poisoned")
            .remove(id);
        match removed {
            Some(binding) => {
                binding.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        if let Ok(map) = self.bindings.read() {
            for binding in map.values() {
                binding.close();
            }
        }
    }
}

/// Load, rewrite and bind one style.
pub async fn register_style(
    id: &str,
    style_cfg: &StyleConfig,
    config: &Config,
    fonts: Arc<FontLibrary>,
    http: reqwest::Client,
) -> Result<Arc<StyleBinding>> {
    let paths = &config.options.paths;
    let style_path = paths.styles_dir().join(&style_cfg.style);
    let raw = std::fs::read_to_string(&style_path).map_err(|e| {
        RenderServerError::FatalConfig(format!("cannot read style {}: {e}", style_path.display()))
    })?;
    let mut style: Value = serde_json::from_str(&raw).map_err(|e| {
        RenderServerError::FatalConfig(format!("invalid style {}: {e}", style_path.display()))
    })?;

    let mut bound_sources: HashMap<String, BoundSource> = HashMap::new();
    let mut attributions: Vec<String> = Vec::new();
    let mut data_projection: Option<DataProjection> = None;

    if let Some(sources) = style.get_mut("sources").and_then(Value::as_object_mut) {
        for (name, source) in sources.iter_mut() {
            let Some(url) = source.get("url").and_then(Value::as_str) else {
                continue;
            };
            let Some((scheme, key)) = split_archive_url(url) else {
                continue;
            };

            let data_cfg = config.data.get(&key).ok_or_else(|| {
                RenderServerError::FatalConfig(format!(
                    "style {id:?} references unknown data source {key:?}"
                ))
            })?;

            let handle = match scheme {
                "pmtiles" => {
                    let input = data_cfg.pmtiles.as_deref().ok_or_else(|| {
                        RenderServerError::FatalConfig(format!(
                            "data source {key:?} is not a pmtiles archive"
                        ))
                    })?;
                    if input.starts_with("http://") || input.starts_with("https://") {
                        SourceHandle::PmTiles(PmTilesSource::open_url(input).await?)
                    } else {
                        let path = resolve_archive_path(paths.root.as_path(), input);
                        SourceHandle::PmTiles(PmTilesSource::open_file(&path).await?)
                    }
                }
                "mbtiles" => {
                    let input = data_cfg.mbtiles.as_deref().ok_or_else(|| {
                        RenderServerError::FatalConfig(format!(
                            "data source {key:?} is not an mbtiles archive"
                        ))
                    })?;
                    let path = resolve_archive_path(paths.root.as_path(), input);
                    SourceHandle::MbTiles(MbTilesSource::open_file(&path).await?)
                }
                _ => unreachable!("split_archive_url filters schemes"),
            };

            let info = handle.info().clone();
            merge_source_metadata(source, &info, scheme, name);

            if let Some(proj4) = &info.proj4 {
                match &data_projection {
                    None => data_projection = Some(DataProjection::from_proj4(proj4)?),
                    Some(existing) if existing.definition() == proj4 => {}
                    Some(existing) => {
                        return Err(RenderServerError::FatalConfig(format!(
                            "style {id:?} mixes projections {:?} and {proj4:?}",
                            existing.definition()
                        )));
                    }
                }
            }

            if let Some(attribution) = &info.attribution {
                if !attribution.is_empty() && !attributions.contains(attribution) {
                    attributions.push(attribution.clone());
                }
            }

            let fill_color = source
                .get("fillColor")
                .and_then(Value::as_str)
                .map(str::to_string);
            bound_sources.insert(
                name.clone(),
                BoundSource { handle, fill_color },
            );
        }
    }

    let style_folder = style_path
        .parent()
        .and_then(|dir| dir.strip_prefix(paths.styles_dir()).ok())
        .and_then(|rel| rel.to_str())
        .unwrap_or("")
        .to_string();
    rewrite_sprite_and_glyphs(&mut style, id, &style_folder);
    flatten_extrusions(&mut style);

    let tilejson = build_tilejson(id, &style, style_cfg, &attributions);

    let allowed_fonts = config
        .options
        .allowed_fonts
        .as_ref()
        .map(|list| list.iter().cloned().collect());
    let sources = Arc::new(bound_sources);
    let resolver = Arc::new(ResourceResolver::new(
        paths.sprites_dir(),
        fonts,
        allowed_fonts,
        Arc::clone(&sources),
        http,
        None,
    ));

    let style_json: Arc<str> = Arc::from(style.to_string());
    let max_scale_factor = config.options.max_scale_factor;
    let runtime = tokio::runtime::Handle::current();

    let mut tile_pools = Vec::with_capacity(usize::from(max_scale_factor));
    let mut static_pools = Vec::with_capacity(usize::from(max_scale_factor));
    for scale in 1..=max_scale_factor {
        let bounds = PoolBounds::for_scale(
            &config.options.pool.min,
            &config.options.pool.max,
            scale,
        );
        tile_pools.push(renderer_pool(
            bounds,
            scale,
            RenderMode::Tile,
            &style_json,
            &resolver,
            &runtime,
        )?);
        static_pools.push(renderer_pool(
            bounds,
            scale,
            RenderMode::Static,
            &style_json,
            &resolver,
            &runtime,
        )?);
    }

    tracing::info!(
        "Registered style {id:?} with {} sources, scales 1..={max_scale_factor}",
        sources.len()
    );

    Ok(Arc::new(StyleBinding {
        id: id.to_string(),
        style_json,
        tilejson,
        public_url: style_cfg.public_url.clone(),
        sources,
        tile_pools,
        static_pools,
        data_projection,
        last_modified: SystemTime::now(),
        watermark: style_cfg
            .watermark
            .clone()
            .or_else(|| config.options.watermark.clone()),
        static_attribution: style_cfg.static_attribution.clone(),
        max_scale_factor,
    }))
}

fn renderer_pool(
    bounds: PoolBounds,
    scale: u8,
    mode: RenderMode,
    style_json: &Arc<str>,
    resolver: &Arc<ResourceResolver>,
    runtime: &tokio::runtime::Handle,
) -> Result<Pool<Renderer>> {
    let style_json = Arc::clone(style_json);
    let resolver = Arc::clone(resolver);
    let runtime = runtime.clone();
    Pool::new(
        bounds,
        move || {
            let mut renderer = Renderer::new(
                512,
                512,
                f32::from(scale),
                mode,
                Arc::clone(&resolver),
                runtime.clone(),
            )?;
            renderer.load_style(&style_json)?;
            Ok(renderer)
        },
        drop,
    )
}

/// `pmtiles://name`, `mbtiles://{name}` → `(scheme, name)`.
fn split_archive_url(url: &str) -> Option<(&'static str, String)> {
    for scheme in ["pmtiles", "mbtiles"] {
        if let Some(rest) = url.strip_prefix(scheme).and_then(|r| r.strip_prefix("://")) {
            let name = rest
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .unwrap_or(rest);
            return Some((scheme, name.to_string()));
        }
    }
    None
}

fn resolve_archive_path(root: &Path, input: &str) -> std::path::PathBuf {
    let expanded = shellexpand::full(input)
        .map(|e| e.into_owned())
        .unwrap_or_else(|_| input.to_string());
    let path = Path::new(&expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Merge archive metadata into the style source, preserving its `type`,
/// and point `tiles` at the internal scheme.
fn merge_source_metadata(
    source: &mut Value,
    info: &crate::sources::ArchiveInfo,
    scheme: &str,
    name: &str,
) {
    let Some(obj) = source.as_object_mut() else {
        return;
    };
    obj.remove("url");

    if let Some(bounds) = info.bounds {
        obj.insert("bounds".into(), json!(bounds));
    }
    if let Some(center) = info.center {
        obj.insert("center".into(), json!(center));
    }
    if let Some(minzoom) = info.minzoom {
        obj.insert("minzoom".into(), json!(minzoom));
    }
    if let Some(maxzoom) = info.maxzoom {
        obj.insert("maxzoom".into(), json!(maxzoom));
    }
    if let Some(layers) = &info.vector_layers {
        obj.insert("vector_layers".into(), layers.clone());
    }
    if let Some(proj4) = &info.proj4 {
        obj.insert("proj4".into(), json!(proj4));
    }
    let ext = info
        .format
        .map(|f| f.extension())
        .unwrap_or("pbf");
    obj.insert("format".into(), json!(ext));
    obj.insert(
        "tiles".into(),
        json!([format!(
            "{scheme}://{}/{{z}}/{{x}}/{{y}}.{ext}",
            urlencoding::encode(name)
        )]),
    );
}

/// Relative sprite and glyph URIs become internal scheme URLs the resolver
/// understands.
fn rewrite_sprite_and_glyphs(style: &mut Value, id: &str, style_folder: &str) {
    if let Some(sprite) = style.get("sprite").and_then(Value::as_str) {
        if !sprite.contains("://") {
            let expanded = sprite
                .replace("{style}", id)
                .replace("{styleJsonFolder}", style_folder);
            let rewritten = format!("sprites://{}", expanded.trim_start_matches('/'));
            style["sprite"] = json!(rewritten);
        }
    }

    if let Some(glyphs) = style.get("glyphs").and_then(Value::as_str) {
        if !glyphs.contains("://") {
            style["glyphs"] = json!("fonts://{fontstack}/{range}.pbf");
        }
    }
}

/// Force 3D building extrusions flat; a raster render never shows them
/// correctly from a fixed camera.
fn flatten_extrusions(style: &mut Value) {
    let Some(layers) = style.get_mut("layers").and_then(Value::as_array_mut) else {
        return;
    };
    for layer in layers {
        let Some(paint) = layer.get_mut("paint").and_then(Value::as_object_mut) else {
            continue;
        };
        for key in ["fill-extrusion-height", "fill-extrusion-base"] {
            if paint.contains_key(key) {
                paint.insert(key.into(), json!(0));
            }
        }
    }
}

fn build_tilejson(
    id: &str,
    style: &Value,
    style_cfg: &StyleConfig,
    attributions: &[String],
) -> Value {
    let name = style
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(id);

    let mut tilejson = json!({
        "tilejson": "2.0.0",
        "name": name,
        "format": "png",
        "type": "baselayer",
        "minzoom": 0,
        "maxzoom": 22,
        "bounds": [-180.0, -85.0511, 180.0, 85.0511],
        "tiles": [format!("{id}/{{z}}/{{x}}/{{y}}.png")],
    });

    if let (Some(center), Some(zoom)) = (
        style.get("center").and_then(Value::as_array),
        style.get("zoom").and_then(Value::as_f64),
    ) {
        if center.len() >= 2 {
            tilejson["center"] = json!([
                center[0].as_f64().unwrap_or(0.0),
                center[1].as_f64().unwrap_or(0.0),
                zoom
            ]);
        }
    }

    if !attributions.is_empty() {
        tilejson["attribution"] = json!(attributions.join(" | "));
    }

    // Per-style overrides win over everything derived above.
    if let Some(Value::Object(overrides)) = &style_cfg.tilejson {
        if let Some(obj) = tilejson.as_object_mut() {
            for (key, value) in overrides {
                obj.insert(key.clone(), value.clone());
            }
        }
    }

    tilejson
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_urls_split_and_unwrap_placeholders() {
        assert_eq!(
            split_archive_url("mbtiles://{zurich}"),
            Some(("mbtiles", "zurich".to_string()))
        );
        assert_eq!(
            split_archive_url("pmtiles://planet"),
            Some(("pmtiles", "planet".to_string()))
        );
        assert_eq!(split_archive_url("https://tiles.test/t.json"), None);
        assert_eq!(split_archive_url("mbtiles:/broken"), None);
    }

    #[test]
    fn sprite_rewrite_expands_placeholders() {
        let mut style = json!({
            "sprite": "/{style}/sprite",
            "glyphs": "fonts/{fontstack}/{range}.pbf",
        });
        rewrite_sprite_and_glyphs(&mut style, "basic", "basic");
        assert_eq!(style["sprite"], json!("sprites://basic/sprite"));
        assert_eq!(style["glyphs"], json!("fonts://{fontstack}/{range}.pbf"));
    }

    #[test]
    fn absolute_sprite_urls_are_left_alone() {
        let mut style = json!({
            "sprite": "https://cdn.test/sprite",
            "glyphs": "https://cdn.test/{fontstack}/{range}.pbf",
        });
        rewrite_sprite_and_glyphs(&mut style, "basic", "");
        assert_eq!(style["sprite"], json!("https://cdn.test/sprite"));
        assert_eq!(
            style["glyphs"],
            json!("https://cdn.test/{fontstack}/{range}.pbf")
        );
    }

    #[test]
    fn extrusions_are_flattened() {
        let mut style = json!({
            "layers": [
                {"id": "buildings", "paint": {"fill-extrusion-height": 30, "fill-extrusion-base": 5}},
                {"id": "water", "paint": {"fill-color": "#00f"}},
                {"id": "labels"},
            ]
        });
        flatten_extrusions(&mut style);
        assert_eq!(style["layers"][0]["paint"]["fill-extrusion-height"], json!(0));
        assert_eq!(style["layers"][0]["paint"]["fill-extrusion-base"], json!(0));
        assert_eq!(style["layers"][1]["paint"]["fill-color"], json!("#00f"));
    }

    #[test]
    fn source_metadata_merge_builds_tile_template() {
        let mut source = json!({"type": "vector", "url": "mbtiles://{omt}"});
        let info = crate::sources::ArchiveInfo {
            bounds: Some([-10.0, -10.0, 10.0, 10.0]),
            minzoom: Some(0),
            maxzoom: Some(14),
            format: Some(crate::sources::TileFormat::Pbf),
            ..Default::default()
        };
        merge_source_metadata(&mut source, &info, "mbtiles", "omt");

        assert_eq!(source["type"], json!("vector"));
        assert!(source.get("url").is_none());
        assert_eq!(source["maxzoom"], json!(14));
        assert_eq!(
            source["tiles"],
            json!(["mbtiles://omt/{z}/{x}/{y}.pbf"])
        );
    }

    #[test]
    fn tilejson_joins_attributions_and_applies_overrides() {
        let style = json!({"name": "Test Style", "center": [8.5, 47.3], "zoom": 10.0});
        let cfg = StyleConfig {
            style: "x.json".into(),
            public_url: None,
            tilejson: Some(json!({"attribution": "Custom"})),
            watermark: None,
            static_attribution: None,
        };

        let plain = build_tilejson(
            "test",
            &style,
            &StyleConfig {
                tilejson: None,
                ..cfg.clone()
            },
            &["© A".to_string(), "© B".to_string()],
        );
        assert_eq!(plain["attribution"], json!("© A | © B"));
        assert_eq!(plain["name"], json!("Test Style"));
        assert_eq!(plain["center"], json!([8.5, 47.3, 10.0]));

        let overridden = build_tilejson("test", &style, &cfg, &["© A".to_string()]);
        assert_eq!(overridden["attribution"], json!("Custom"));
    }
}
