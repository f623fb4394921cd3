//! Web-Mercator pixel projection and the optional per-style data projection.
//!
//! All pixel math uses the renderer-internal 256px tile grid: the world at
//! zoom `z` spans `[0, 256 * 2^z]` pixels in both axes. Overlay geometry is
//! projected at a fixed reference zoom of 20 and scaled to the target zoom,
//! which keeps sub-pixel accuracy stable across zoom levels.

use crate::error::{RenderServerError, Result};

/// Pixel size of one tile on the internal projection grid.
pub const TILE_GRID: f64 = 256.0;

/// Latitude bound of the square Web-Mercator world.
pub const MAX_LATITUDE: f64 = 85.0511287798066;

const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Reference zoom for [`precise_px`].
const PRECISION_ZOOM: f64 = 20.0;

/// World size in pixels at a (possibly fractional) zoom.
pub fn world_size(zoom: f64) -> f64 {
    TILE_GRID * 2_f64.powf(zoom)
}

/// Forward projection: `(lon, lat)` degrees to pixel coordinates at `zoom`.
pub fn px(lnglat: (f64, f64), zoom: f64) -> (f64, f64) {
    let size = world_size(zoom);
    let (lon, lat) = lnglat;
    let x = (lon + 180.0) / 360.0 * size;
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let y = (1.0 - ((std::f64::consts::FRAC_PI_4 + lat_rad / 2.0).tan().ln())
        / std::f64::consts::PI)
        / 2.0
        * size;
    (x, y)
}

/// Inverse projection: pixel coordinates at `zoom` back to `(lon, lat)`.
pub fn ll(pixel: (f64, f64), zoom: f64) -> (f64, f64) {
    let size = world_size(zoom);
    let lon = pixel.0 / size * 360.0 - 180.0;
    let n = std::f64::consts::PI * (1.0 - 2.0 * pixel.1 / size);
    let lat = n.sinh().atan().to_degrees();
    (lon, lat)
}

/// Projection at the fixed reference zoom, scaled to `zoom` by a power of
/// two. Exact scaling preserves the identity
/// `precise_px(ll, z) == precise_px(ll, 20) * 2^(z-20)`.
pub fn precise_px(lnglat: (f64, f64), zoom: f64) -> (f64, f64) {
    let p = px(lnglat, PRECISION_ZOOM);
    let scale = 2_f64.powf(zoom - PRECISION_ZOOM);
    (p.0 * scale, p.1 * scale)
}

/// Forward transform from WGS84 into a style's internal coordinate system.
///
/// Styles whose sources declare a `proj4` definition expect static-map
/// centers in that system. The transform projects WGS84 degrees into the
/// data projection, then reads the result back through the spherical
/// Mercator inverse, yielding pseudo-coordinates the renderer places
/// correctly on its EPSG:3857 plane.
pub struct DataProjection {
    definition: String,
    wgs84: proj4rs::Proj,
    data: proj4rs::Proj,
}

impl std::fmt::Debug for DataProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProjection")
            .field("definition", &self.definition)
            .finish()
    }
}

impl DataProjection {
    pub fn from_proj4(definition: &str) -> Result<Self> {
        let wgs84 = proj4rs::Proj::from_proj_string("+proj=longlat +datum=WGS84 +no_defs")
            .map_err(|e| RenderServerError::FatalConfig(format!("WGS84 setup failed: {e}")))?;
        let data = proj4rs::Proj::from_proj_string(definition).map_err(|e| {
            RenderServerError::FatalConfig(format!("invalid proj4 definition {definition:?}: {e}"))
        })?;
        Ok(Self {
            definition: definition.to_string(),
            wgs84,
            data,
        })
    }

    /// The proj4 string this transform was built from.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Apply the composed transform to `(lon, lat)` degrees.
    pub fn transform(&self, lnglat: (f64, f64)) -> Result<(f64, f64)> {
        let mut point = (lnglat.0.to_radians(), lnglat.1.to_radians(), 0.0);
        proj4rs::transform::transform(&self.wgs84, &self.data, &mut point)
            .map_err(|e| RenderServerError::BadRequest(format!("projection failed: {e}")))?;

        // Treat the projected meters as EPSG:3857 and invert analytically.
        let lon = (point.0 / EARTH_RADIUS_M).to_degrees();
        let lat = (point.1 / EARTH_RADIUS_M).sinh().atan().to_degrees();
        Ok((lon, lat))
    }
}
