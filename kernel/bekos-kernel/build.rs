//! Passes the kernel linker script when building for the bare-metal
//! target. Host builds (unit tests) link normally.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=kernel.ld");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "none" {
        let script = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap()).join("kernel.ld");
        println!("cargo:rustc-link-arg=-T{}", script.display());
        println!("cargo:rustc-link-arg=--no-pie");
    }
}
