// This module groups everything that treats annotation sites as x86 machine code rather than as
// Rust source: the fixed byte signatures of the protocol, a decoder-based scanner that finds and
// verifies sites in arbitrary code and computes the redirect patch an engine applies, and a
// code_asm-based assembler that builds reference sites for object emission. None of it runs on
// the native fast path; it exists for tooling, audits and tests.

//! x86 / x86-64 signature handling.

pub mod assembler;
pub mod scanner;
pub mod signature;

pub use assembler::{AssembledSite, SiteAssembler};
pub use scanner::{RedirectPatch, ScanConfig, ScanReport, SiteJump, SiteLayout, SiteScanner};
pub use signature::{Signature, SiteKind};
