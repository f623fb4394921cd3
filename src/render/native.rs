//! Safe wrapper around the headless renderer FFI.
//!
//! Each [`Renderer`] owns one native map pre-bound to a pixel ratio and
//! mode, with its resource loading wired to a [`ResourceResolver`]. The
//! native renderer calls back from its own worker thread; the trampoline
//! re-enters the async runtime through a stored handle, so a renderer must
//! only be driven from blocking contexts (the pipeline uses
//! `spawn_blocking`).

use std::ffi::{c_void, CStr, CString};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use mbgl_headless_sys as ffi;

use crate::error::{RenderServerError, Result};
use crate::resolver::ResourceResolver;

static RUNTIME_INIT: OnceLock<bool> = OnceLock::new();

fn init_runtime() -> Result<()> {
    let ok =
        *RUNTIME_INIT.get_or_init(|| unsafe { ffi::mbgl_runtime_init() } == ffi::MbglStatus::Ok);
    if !ok {
        return Err(RenderServerError::Render(format!(
            "renderer runtime init failed: {}",
            last_error().unwrap_or_else(|| "unknown".into())
        )));
    }
    Ok(())
}

fn last_error() -> Option<String> {
    unsafe {
        let ptr = ffi::mbgl_last_error();
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}

/// Rendering mode a pool's instances are created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Tile,
    Static,
}

impl From<RenderMode> for ffi::MbglMode {
    fn from(mode: RenderMode) -> Self {
        match mode {
            RenderMode::Tile => ffi::MbglMode::Tile,
            RenderMode::Static => ffi::MbglMode::Static,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Camera {
    pub lon: f64,
    pub lat: f64,
    pub zoom: f64,
    pub bearing: f64,
    pub pitch: f64,
}

/// Raw render output: RGBA with premultiplied alpha.
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

struct FetchContext {
    resolver: Arc<ResourceResolver>,
    runtime: tokio::runtime::Handle,
}

pub struct Renderer {
    ptr: *mut ffi::MbglMap,
    // Kept alive for the trampoline's user_data pointer.
    _fetch: Box<FetchContext>,
    pixel_ratio: f32,
}

// The native map is confined to one caller at a time via &mut.
unsafe impl Send for Renderer {}

impl Renderer {
    pub fn new(
        width: u32,
        height: u32,
        pixel_ratio: f32,
        mode: RenderMode,
        resolver: Arc<ResourceResolver>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        init_runtime()?;

        let fetch = Box::new(FetchContext { resolver, runtime });
        let user_data = &*fetch as *const FetchContext as *mut c_void;

        let ptr = unsafe {
            ffi::mbgl_map_new(
                ffi::MbglSize { width, height },
                pixel_ratio,
                mode.into(),
                Some(fetch_trampoline),
                user_data,
            )
        };

        if ptr.is_null() {
            return Err(RenderServerError::Render(format!(
                "failed to create renderer: {}",
                last_error().unwrap_or_else(|| "unknown".into())
            )));
        }

        Ok(Self {
            ptr,
            _fetch: fetch,
            pixel_ratio,
        })
    }

    pub fn pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    pub fn load_style(&mut self, style_json: &str) -> Result<()> {
        let c_style = CString::new(style_json)
            .map_err(|_| RenderServerError::Render("style JSON contains NUL bytes".into()))?;

        let status = unsafe { ffi::mbgl_map_set_style(self.ptr, c_style.as_ptr()) };
        if status != ffi::MbglStatus::Ok {
            return Err(RenderServerError::Render(format!(
                "failed to load style: {}",
                last_error().unwrap_or_else(|| format!("{status:?}"))
            )));
        }
        Ok(())
    }

    /// Render one frame of `width`x`height` logical pixels; the output is
    /// scaled by the instance's pixel ratio.
    pub fn render(&mut self, camera: Camera, width: u32, height: u32) -> Result<RawImage> {
        let c_camera = ffi::MbglCamera {
            lon: camera.lon,
            lat: camera.lat,
            zoom: camera.zoom,
            bearing: camera.bearing,
            pitch: camera.pitch,
        };
        let mut image = ffi::MbglImage::default();

        let status = unsafe {
            ffi::mbgl_map_render(
                self.ptr,
                &c_camera,
                ffi::MbglSize { width, height },
                &mut image,
            )
        };

        if status != ffi::MbglStatus::Ok {
            return Err(RenderServerError::Render(format!(
                "render failed: {}",
                last_error().unwrap_or_else(|| format!("{status:?}"))
            )));
        }

        let data = if image.data.is_null() || image.len == 0 {
            Vec::new()
        } else {
            let slice = unsafe { std::slice::from_raw_parts(image.data, image.len) };
            slice.to_vec()
        };
        let (width, height) = (image.width, image.height);
        unsafe { ffi::mbgl_image_free(&mut image) };

        if data.len() != (width as usize) * (height as usize) * 4 {
            return Err(RenderServerError::Render(format!(
                "renderer returned {} bytes for {width}x{height}",
                data.len()
            )));
        }

        Ok(RawImage {
            data,
            width,
            height,
        })
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { ffi::mbgl_map_free(self.ptr) };
        }
    }
}

/// Copy a byte buffer into renderer-owned memory (released with `free`).
unsafe fn malloc_copy(data: &[u8]) -> *mut u8 {
    if data.is_empty() {
        return std::ptr::null_mut();
    }
    let ptr = libc::malloc(data.len()) as *mut u8;
    if !ptr.is_null() {
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    }
    ptr
}

unsafe fn malloc_cstring(text: &str) -> *mut libc::c_char {
    let bytes = text.as_bytes();
    let ptr = libc::malloc(bytes.len() + 1) as *mut u8;
    if ptr.is_null() {
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
    *ptr.add(bytes.len()) = 0;
    ptr as *mut libc::c_char
}

fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

unsafe extern "C" fn fetch_trampoline(
    request: *const ffi::MbglRequest,
    response: *mut ffi::MbglResponse,
    user_data: *mut c_void,
) {
    let outcome = std::panic::catch_unwind(|| {
        if request.is_null() || response.is_null() || user_data.is_null() {
            return;
        }
        let ctx = &*(user_data as *const FetchContext);
        let request = &*request;
        let response = &mut *response;
        *response = ffi::MbglResponse::default();

        let url = match CStr::from_ptr(request.url).to_str() {
            Ok(url) => url,
            Err(_) => {
                response.no_content = true;
                return;
            }
        };

        match ctx.runtime.block_on(ctx.resolver.fetch(url)) {
            Ok(resource) => {
                response.data = malloc_copy(&resource.data);
                response.len = if response.data.is_null() {
                    0
                } else {
                    resource.data.len()
                };
                if let Some(modified) = resource.modified {
                    response.modified = unix_seconds(modified);
                }
                if let Some(expires) = resource.expires {
                    response.expires = unix_seconds(expires);
                }
                if let Some(etag) = &resource.etag {
                    response.etag = malloc_cstring(etag);
                }
                response.no_content = resource.data.is_empty();
            }
            Err(e) => {
                // Resource failures never abort a render; the renderer gets
                // an empty resource instead.
                tracing::warn!("resource fetch failed for {url}: {e}");
                response.no_content = true;
            }
        }
    });

    if outcome.is_err() && !response.is_null() {
        (*response) = ffi::MbglResponse::default();
        (*response).no_content = true;
    }
}
