//! DynamoRIO annotations for Rust.
//!
//! An annotation is a call that costs one unconditional short jump when the
//! program runs natively, but that a binary instrumentation engine attached to
//! the process can recognize and redirect. Every call site carries a fixed
//! x86 byte signature naming the annotation through a GOT-relative reference
//! to its label string `"dynamorio-annotation:<name>"`.
//!
//! # Primary Usage
//!
//! ```ignore
//! use dynamorio_annotations::{annotation, annotation_or_native, declare_annotation, define_annotation};
//!
//! declare_annotation! {
//!     /// Handled entirely by the engine.
//!     pub fn phase_marker(phase: u32);
//! }
//!
//! define_annotation! {
//!     pub fn log_event(code: u32) {
//!         log::info!("event {code}");
//!     }
//! }
//!
//! annotation_or_native!(log_event(42), record_locally(42));
//! annotation!(phase_marker(1));
//!
//! // Elsewhere, a component that knows better than the default:
//! override_annotation! {
//!     crate::phase_marker => fn record_phase(phase: u32) {
//!         log::debug!("phase {phase}");
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`site`], [`tag`], [`annotation`] - Call-site encoder, function tagger and macro front-end
//! - [`label`], [`registry`] - Label strings and the link-time annotation table
//! - [`x86`] - Byte signatures, disassembly verification and reference assembly
//! - [`elf`] - Relocatable ELF emission and label recovery
//! - [`target`] - Pointer width and inline-asm dialect of the build

// Site encoding
pub mod annotation;
pub mod site;
pub mod tag;

// Identity
pub mod label;
pub mod registry;

// Tooling
pub mod elf;
pub mod x86;

pub mod error;
pub mod target;

pub use error::{AnnotationError, AnnotationResult};
pub use label::{format_label, parse_label, Label, LabelKind, LABEL_PREFIX};
pub use registry::{
    annotations, find_by_entry, find_by_label, find_override, lookup, lookup_all,
    AnnotationDescriptor, AnnotationOverride, Definition, EntryPoint,
};
pub use target::{Dialect, PointerWidth, TargetInfo};
pub use x86::{RedirectPatch, ScanConfig, ScanReport, SiteKind, SiteLayout, SiteScanner};

#[doc(hidden)]
pub mod __private {
    pub use linkme::{self, distributed_slice};
}
