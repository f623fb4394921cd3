//! Low-level FFI bindings to a headless MapLibre GL Native renderer.
//!
//! The C surface wraps a `HeadlessFrontend` + `Map` pair behind an opaque
//! handle. Every external resource the renderer needs (tiles, glyph ranges,
//! sprites, arbitrary URLs) is requested through the [`MbglFetchFn`]
//! callback supplied at map creation, which makes the renderer usable
//! without any built-in networking or file access.
//!
//! # Safety
//!
//! All functions here are unsafe. Callers own pointer validity and must
//! uphold the buffer ownership rules documented on [`MbglResponse`] and
//! [`MbglImage`]. Use the safe wrapper in the `tilerender` crate instead of
//! calling these directly.

#![allow(non_camel_case_types)]

use libc::{c_char, c_double, c_float, c_void, size_t};

/// Opaque renderer handle. One handle owns one headless frontend and one map.
#[repr(C)]
pub struct MbglMap {
    _private: [u8; 0],
}

/// Status codes shared by every fallible entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbglStatus {
    Ok = 0,
    InvalidArgument = 1,
    StyleParse = 2,
    RenderFailed = 3,
    NotLoaded = 4,
    Unknown = 99,
}

/// Rendering mode the map is created in.
///
/// `Tile` relaxes placement so adjacent tiles line up; `Static` produces a
/// self-contained image with full symbol placement.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbglMode {
    Static = 0,
    Tile = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MbglSize {
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MbglCamera {
    pub lon: c_double,
    pub lat: c_double,
    pub zoom: c_double,
    pub bearing: c_double,
    pub pitch: c_double,
}

/// Rendered output. `data` is `width * height * 4` bytes of RGBA with
/// premultiplied alpha, allocated by the renderer; release it with
/// [`mbgl_image_free`].
#[repr(C)]
#[derive(Debug)]
pub struct MbglImage {
    pub data: *mut u8,
    pub len: size_t,
    pub width: u32,
    pub height: u32,
}

impl Default for MbglImage {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
            width: 0,
            height: 0,
        }
    }
}

/// A single resource request issued by the renderer.
///
/// `kind` is one of the [`resource_kind`] constants.
#[repr(C)]
#[derive(Debug)]
pub struct MbglRequest {
    pub url: *const c_char,
    pub kind: u8,
}

/// Callback-filled response.
///
/// Ownership contract: `data` and `etag` must be allocated with
/// `libc::malloc` (the renderer releases them with `free`). `modified` and
/// `expires` are unix seconds, `0` meaning unset. `no_content` marks a
/// deliberate empty (not-found) resource; `error` may point at a static
/// string describing a hard failure.
#[repr(C)]
#[derive(Debug)]
pub struct MbglResponse {
    pub data: *mut u8,
    pub len: size_t,
    pub modified: i64,
    pub expires: i64,
    pub etag: *mut c_char,
    pub error: *const c_char,
    pub no_content: bool,
}

impl Default for MbglResponse {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
            modified: 0,
            expires: 0,
            etag: std::ptr::null_mut(),
            error: std::ptr::null(),
            no_content: false,
        }
    }
}

/// Resource loader callback. Invoked from the renderer's worker thread; the
/// implementation must be thread-safe.
pub type MbglFetchFn = Option<
    unsafe extern "C" fn(
        request: *const MbglRequest,
        response: *mut MbglResponse,
        user_data: *mut c_void,
    ),
>;

extern "C" {
    /// Initialize the shared renderer runtime. Idempotent.
    pub fn mbgl_runtime_init() -> MbglStatus;

    /// Tear down the shared renderer runtime.
    pub fn mbgl_runtime_shutdown();

    /// Create a renderer bound to a pixel ratio and mode. `fetch` services
    /// every external resource request; `user_data` is passed back verbatim.
    pub fn mbgl_map_new(
        size: MbglSize,
        pixel_ratio: c_float,
        mode: MbglMode,
        fetch: MbglFetchFn,
        user_data: *mut c_void,
    ) -> *mut MbglMap;

    /// Destroy a renderer and its frontend.
    pub fn mbgl_map_free(map: *mut MbglMap);

    /// Load a style document (JSON text) into the map.
    pub fn mbgl_map_set_style(map: *mut MbglMap, style_json: *const c_char) -> MbglStatus;

    /// Render one still frame at `size` logical pixels. The output image is
    /// `size * pixel_ratio` device pixels.
    pub fn mbgl_map_render(
        map: *mut MbglMap,
        camera: *const MbglCamera,
        size: MbglSize,
        out: *mut MbglImage,
    ) -> MbglStatus;

    /// Release an image produced by [`mbgl_map_render`].
    pub fn mbgl_image_free(image: *mut MbglImage);

    /// Last error message for the calling thread, or NULL.
    pub fn mbgl_last_error() -> *const c_char;
}

/// `MbglRequest::kind` values.
pub mod resource_kind {
    pub const UNKNOWN: u8 = 0;
    pub const STYLE: u8 = 1;
    pub const SOURCE: u8 = 2;
    pub const TILE: u8 = 3;
    pub const GLYPHS: u8 = 4;
    pub const SPRITE_IMAGE: u8 = 5;
    pub const SPRITE_JSON: u8 = 6;
}
