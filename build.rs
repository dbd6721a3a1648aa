// build.rs

use std::env;
use std::process::Command;

/// First rustc release with stable `label` operands in `asm!`.
const LABEL_OPERANDS_MINOR: u32 = 87;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=DR_ANNOTATIONS_DIALECT");
    println!("cargo:rustc-check-cfg=cfg(dr_annotations_goto)");
    println!("cargo:rustc-check-cfg=cfg(dr_annotations_sites)");

    if target_carries_sites() {
        println!("cargo:rustc-cfg=dr_annotations_sites");
    }

    let forced_raw = env::var_os("CARGO_FEATURE_RAW_SITES").is_some();
    let requested = env::var("DR_ANNOTATIONS_DIALECT").ok();

    let use_label_operands = match requested.as_deref() {
        Some("raw") => false,
        Some("goto") => !forced_raw,
        Some(other) => {
            println!("cargo:warning=unknown DR_ANNOTATIONS_DIALECT `{other}`, detecting from rustc");
            !forced_raw && rustc_supports_label_operands()
        }
        None => !forced_raw && rustc_supports_label_operands(),
    };

    if use_label_operands {
        println!("cargo:rustc-cfg=dr_annotations_goto");
    }
}

// x86 or x86-64 with ELF-style GOT addressing.
fn target_carries_sites() -> bool {
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let vendor = env::var("CARGO_CFG_TARGET_VENDOR").unwrap_or_default();
    matches!(arch.as_str(), "x86" | "x86_64") && os != "windows" && vendor != "apple"
}

fn rustc_supports_label_operands() -> bool {
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let output = match Command::new(rustc).arg("--version").output() {
        Ok(output) if output.status.success() => output,
        _ => return false,
    };
    let version = String::from_utf8_lossy(&output.stdout);
    parse_minor(&version).is_some_and(|minor| minor >= LABEL_OPERANDS_MINOR)
}

// "rustc 1.87.0 (17067e9ac 2025-05-09)" -> 87
fn parse_minor(version: &str) -> Option<u32> {
    let release = version.split_whitespace().nth(1)?;
    let mut parts = release.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    if major > 1 {
        return Some(u32::MAX);
    }
    Some(minor)
}
