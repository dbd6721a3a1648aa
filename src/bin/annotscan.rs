//! Annotation site audit tool.
//!
//! Scans ELF objects and binaries (or raw code blobs with `--raw`) for
//! annotation call sites and function tags, prints what each one names, and
//! exits non-zero if any candidate fails verification.

use clap::Parser;
use dynamorio_annotations::elf::scan_object;
use dynamorio_annotations::{PointerWidth, ScanReport, SiteLayout, SiteScanner};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "annotscan", about = "Find and verify DynamoRIO annotation sites")]
struct Args {
    /// Files to scan.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Treat inputs as raw machine code instead of ELF.
    #[arg(long)]
    raw: bool,

    /// Pointer width of raw code.
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(32..=64))]
    bits: u32,

    /// Load address of raw code.
    #[arg(long, default_value = "0", value_parser = parse_address)]
    base: u64,

    /// Print the skip rewrite that redirects each site.
    #[arg(long)]
    patches: bool,
}

fn parse_address(text: &str) -> Result<u64, std::num::ParseIntError> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

fn print_layout(layout: &SiteLayout, base: u64, patches: bool) {
    print!(
        "  {:#010x} {:?} skip={:#04x} jumps=[{:#x}, {:#x}]",
        base + layout.offset as u64,
        layout.kind,
        layout.skip_length,
        layout.jumps[0].target,
        layout.jumps[1].target,
    );
    if patches {
        match layout.redirect_patch() {
            Ok(patch) => print!(
                " patch=[{}]{}",
                patch,
                if patch.is_atomic(base) { "" } else { " (unaligned)" }
            ),
            Err(err) => print!(" patch unavailable: {err}"),
        }
    }
    println!();
}

fn report_raw(args: &Args, code: &[u8]) -> Result<usize, Box<dyn std::error::Error>> {
    let width = PointerWidth::from_bitness(args.bits)?;
    let report: ScanReport = SiteScanner::new(width).scan(code, args.base);
    for layout in &report.sites {
        print_layout(layout, args.base, args.patches);
    }
    for defect in &report.defects {
        println!("  defect: {defect}");
    }
    Ok(report.defects.len())
}

fn report_object(args: &Args, bytes: &[u8]) -> Result<usize, Box<dyn std::error::Error>> {
    let scan = scan_object(bytes)?;
    println!("  {}-bit", scan.width.bitness());
    for site in &scan.sites {
        print!("  [{}]", site.section);
        print_layout(&site.layout, 0, args.patches);
        println!(
            "      label={} annotation={} callee={}",
            site.label.as_deref().unwrap_or("?"),
            site.annotation.as_deref().unwrap_or("?"),
            site.callee.as_deref().unwrap_or("?"),
        );
    }
    for defect in &scan.defects {
        println!("  defect: {defect}");
    }
    Ok(scan.defects.len())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut defects = 0;
    for path in &args.files {
        println!("{}:", path.display());
        let bytes = fs::read(path)?;
        defects += if args.raw {
            report_raw(&args, &bytes)?
        } else {
            report_object(&args, &bytes)?
        };
    }

    if defects > 0 {
        eprintln!("Error: {defects} malformed annotation sites");
        std::process::exit(1);
    }
    Ok(())
}
