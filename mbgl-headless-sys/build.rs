//! Links the headless MapLibre Native wrapper, or compiles the bundled C
//! stub when the native build is unavailable.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=cpp/mbgl_headless.h");
    println!("cargo:rerun-if-changed=cpp/mbgl_headless_stub.c");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=MBGL_HEADLESS_LIB_DIR");

    // An explicit library directory wins over everything else.
    if let Ok(dir) = env::var("MBGL_HEADLESS_LIB_DIR") {
        let dir = PathBuf::from(dir);
        println!("cargo:rustc-link-search=native={}", dir.display());
        println!("cargo:rustc-link-lib=static=mbgl-headless");
        link_native_support_libs();
        return;
    }

    // Then a system-wide install announced through pkg-config.
    if pkg_config::Config::new()
        .atleast_version("0.3")
        .probe("mbgl-headless")
        .is_ok()
    {
        return;
    }

    if env::var_os("CARGO_FEATURE_NATIVE").is_some() {
        panic!(
            "the `native` feature requires MapLibre Native; set MBGL_HEADLESS_LIB_DIR \
             or install the mbgl-headless pkg-config package"
        );
    }

    println!("cargo:warning=MapLibre Native not found - building the stub renderer");

    cc::Build::new()
        .file("cpp/mbgl_headless_stub.c")
        .include("cpp")
        .warnings(true)
        .opt_level(2)
        .flag_if_supported("-std=c11")
        .compile("mbgl_headless_stub");
}

fn link_native_support_libs() {
    #[cfg(target_os = "linux")]
    {
        println!("cargo:rustc-link-lib=stdc++");
        println!("cargo:rustc-link-lib=z");
        println!("cargo:rustc-link-lib=sqlite3");
        println!("cargo:rustc-link-lib=uv");
        println!("cargo:rustc-link-lib=GL");
        println!("cargo:rustc-link-lib=EGL");
    }

    #[cfg(target_os = "macos")]
    {
        println!("cargo:rustc-link-lib=c++");
        println!("cargo:rustc-link-lib=z");
        println!("cargo:rustc-link-lib=sqlite3");
        println!("cargo:rustc-link-lib=framework=Metal");
        println!("cargo:rustc-link-lib=framework=MetalKit");
        println!("cargo:rustc-link-lib=framework=CoreFoundation");
        println!("cargo:rustc-link-lib=framework=CoreGraphics");
        println!("cargo:rustc-link-lib=framework=CoreText");
        println!("cargo:rustc-link-lib=framework=Foundation");
        println!("cargo:rustc-link-lib=framework=ImageIO");
        println!("cargo:rustc-link-lib=framework=Security");
        println!("cargo:rustc-link-lib=framework=SystemConfiguration");
    }
}
