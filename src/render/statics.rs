//! Static map request parameterization: center/bbox/auto parsing and the
//! bounding-box zoom solver.

use crate::error::{RenderServerError, Result};
use crate::projection;
use crate::render::overlay::OverlayQuery;

/// Highest zoom the bbox solver works at; corner pixels are computed here.
const SOLVER_ZOOM: f64 = 25.0;

/// Parsed `<center>` path segment of a static request.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticView {
    /// `lon,lat,zoom[@bearing[,pitch]]`
    Center {
        lon: f64,
        lat: f64,
        zoom: f64,
        bearing: f64,
        pitch: f64,
    },
    /// `minx,miny,maxx,maxy`
    Bounds {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
    /// Fit to all overlay coordinates.
    Auto,
}

impl StaticView {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "auto" {
            return Ok(Self::Auto);
        }

        let invalid =
            || RenderServerError::bad_request(format!("invalid static view {raw:?}"));

        // Split the camera suffix first: `@bearing[,pitch]` applies to the
        // center form only.
        let (coords, camera) = match raw.split_once('@') {
            Some((coords, camera)) => (coords, Some(camera)),
            None => (raw, None),
        };

        let values: Vec<f64> = coords
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid())?;

        match (values.as_slice(), camera) {
            ([min_lon, min_lat, max_lon, max_lat], None) => Ok(Self::Bounds {
                min_lon: *min_lon,
                min_lat: *min_lat,
                max_lon: *max_lon,
                max_lat: *max_lat,
            }),
            ([lon, lat, zoom], camera) => {
                let (bearing, pitch) = match camera {
                    None => (0.0, 0.0),
                    Some(camera) => {
                        let mut parts = camera.split(',');
                        let bearing = parts
                            .next()
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(invalid)?;
                        let pitch = match parts.next() {
                            None => 0.0,
                            Some(v) => v.parse().map_err(|_| invalid())?,
                        };
                        if parts.next().is_some() {
                            return Err(invalid());
                        }
                        (bearing, pitch)
                    }
                };
                Ok(Self::Center {
                    lon: *lon,
                    lat: *lat,
                    zoom: *zoom,
                    bearing,
                    pitch,
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Zoom that fits `bbox` into a `width`x`height` window with relative
/// `padding` on every side, clamped to `[log2(max(W,H)/256), 25]`.
pub fn calc_z_for_bbox(
    bbox: [f64; 4],
    width: u32,
    height: u32,
    padding: Option<f64>,
) -> f64 {
    let padding = padding.unwrap_or(0.1);

    let min_corner = projection::px((bbox[0], bbox[3]), SOLVER_ZOOM);
    let max_corner = projection::px((bbox[2], bbox[1]), SOLVER_ZOOM);

    let usable_w = f64::from(width) / (1.0 + 2.0 * padding);
    let usable_h = f64::from(height) / (1.0 + 2.0 * padding);

    let dx = max_corner.0 - min_corner.0;
    let dy = max_corner.1 - min_corner.1;

    let mut z = SOLVER_ZOOM
        - f64::max((dx / usable_w).ln(), (dy / usable_h).ln()) / std::f64::consts::LN_2;

    let floor = (f64::from(width.max(height)) / projection::TILE_GRID).log2();
    z = z.min(SOLVER_ZOOM).max(floor);
    z
}

/// Center of a bbox through the forward-then-inverse projection, which
/// keeps antimeridian-crossing boxes consistent with the solver.
pub fn bbox_center(bbox: [f64; 4]) -> (f64, f64) {
    let min = projection::px((bbox[0], bbox[1]), SOLVER_ZOOM);
    let max = projection::px((bbox[2], bbox[3]), SOLVER_ZOOM);
    projection::ll(((min.0 + max.0) / 2.0, (min.1 + max.1) / 2.0), SOLVER_ZOOM)
}

/// Resolve the auto view: fit every overlay coordinate.
pub fn auto_fit(
    query: &OverlayQuery,
    width: u32,
    height: u32,
) -> Result<((f64, f64), f64)> {
    let mut bbox: Option<[f64; 4]> = None;
    for (lon, lat) in query.all_coordinates() {
        let entry = bbox.get_or_insert([lon, lat, lon, lat]);
        entry[0] = entry[0].min(lon);
        entry[1] = entry[1].min(lat);
        entry[2] = entry[2].max(lon);
        entry[3] = entry[3].max(lat);
    }

    let bbox =
        bbox.ok_or_else(|| RenderServerError::bad_request("No coordinates provided"))?;

    let mut zoom = calc_z_for_bbox(bbox, width, height, query.padding);
    if let Some(maxzoom) = query.maxzoom {
        if maxzoom > 0.0 {
            zoom = zoom.min(maxzoom);
        }
    }

    Ok((bbox_center(bbox), zoom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::overlay::parse_path_spec;

    #[test]
    fn parses_center_with_camera() {
        assert_eq!(
            StaticView::parse("8.54,47.37,12").unwrap(),
            StaticView::Center {
                lon: 8.54,
                lat: 47.37,
                zoom: 12.0,
                bearing: 0.0,
                pitch: 0.0
            }
        );
        assert_eq!(
            StaticView::parse("8.54,47.37,12@45").unwrap(),
            StaticView::Center {
                lon: 8.54,
                lat: 47.37,
                zoom: 12.0,
                bearing: 45.0,
                pitch: 0.0
            }
        );
        assert_eq!(
            StaticView::parse("8.54,47.37,12@45,60").unwrap(),
            StaticView::Center {
                lon: 8.54,
                lat: 47.37,
                zoom: 12.0,
                bearing: 45.0,
                pitch: 60.0
            }
        );
    }

    #[test]
    fn parses_bounds_and_auto() {
        assert_eq!(
            StaticView::parse("-10,-10,10,10").unwrap(),
            StaticView::Bounds {
                min_lon: -10.0,
                min_lat: -10.0,
                max_lon: 10.0,
                max_lat: 10.0
            }
        );
        assert_eq!(StaticView::parse("auto").unwrap(), StaticView::Auto);
    }

    #[test]
    fn rejects_malformed_views() {
        assert!(StaticView::parse("1,2").is_err());
        assert!(StaticView::parse("1,2,3,4,5").is_err());
        assert!(StaticView::parse("a,b,c").is_err());
        assert!(StaticView::parse("1,2,3@").is_err());
        assert!(StaticView::parse("1,2,3@4,5,6").is_err());
    }

    #[test]
    fn bbox_zoom_matches_expected_window() {
        // 20 degrees in a 512px window: roughly the figure from a
        // 256px world at z=log2(30).
        let z = calc_z_for_bbox([-10.0, -10.0, 10.0, 10.0], 512, 512, None);
        let floor = (512.0_f64 / 256.0 / (1.2 * 20.0 / 360.0)).log2();
        assert!(z >= floor && z <= 25.0, "z={z} floor={floor}");
        assert!((z - floor).abs() < 0.2, "z={z} expected near {floor}");
    }

    #[test]
    fn bbox_zoom_monotone_in_padding() {
        let bbox = [-10.0, -10.0, 10.0, 10.0];
        let mut last = f64::INFINITY;
        for padding in [0.0, 0.1, 0.5, 1.0] {
            let z = calc_z_for_bbox(bbox, 512, 512, Some(padding));
            assert!(z <= last, "zoom must not increase with padding");
            last = z;
        }
    }

    #[test]
    fn bbox_zoom_monotone_in_extent() {
        let mut last = f64::INFINITY;
        for half in [1.0, 5.0, 20.0, 60.0] {
            let z = calc_z_for_bbox([-half, -half, half, half], 512, 512, None);
            assert!(z <= last, "zoom must not increase as the bbox widens");
            last = z;
        }
    }

    #[test]
    fn bbox_zoom_clamps_to_floor() {
        let z = calc_z_for_bbox([-180.0, -85.0, 180.0, 85.0], 1024, 1024, None);
        assert!((z - (1024.0f64 / 256.0).log2()).abs() < 1e-9);
    }

    #[test]
    fn symmetric_bbox_centers_on_origin() {
        let (lon, lat) = bbox_center([-10.0, -10.0, 10.0, 10.0]);
        assert!(lon.abs() < 1e-9);
        assert!(lat.abs() < 1e-6);
    }

    #[test]
    fn auto_fit_requires_coordinates() {
        let query = OverlayQuery::default();
        let err = auto_fit(&query, 256, 256).unwrap_err();
        assert!(err.to_string().contains("No coordinates provided"));
    }

    #[test]
    fn auto_fit_caps_at_maxzoom() {
        let mut query = OverlayQuery::default();
        query.paths.push(parse_path_spec("0,0|0.001,0.001", false).unwrap());
        query.maxzoom = Some(10.0);
        let (_, zoom) = auto_fit(&query, 256, 256).unwrap();
        assert!(zoom <= 10.0);
    }

    #[test]
    fn auto_fit_centers_between_points() {
        let mut query = OverlayQuery::default();
        query.paths.push(parse_path_spec("-5,-5|5,5", false).unwrap());
        let ((lon, lat), _) = auto_fit(&query, 256, 256).unwrap();
        assert!(lon.abs() < 1e-9);
        assert!(lat.abs() < 1e-6);
    }
}
