// This module provides the process-wide, read-only registry of annotations. Every
// declare_annotation!/define_annotation! expansion contributes one AnnotationDescriptor to a
// linkme distributed slice, so the complete table exists at link time: nothing registers at
// runtime and nothing is ever torn down. A descriptor ties together the annotation's name,
// the module that declared it, its static Label and the address of its tagged entry point,
// plus whether the entry falls back to the harmless default (Declared) or to a real body
// (Defined). override_annotation! contributes to a second slice: an AnnotationOverride names
// the Label of an existing annotation and the function that replaces its body, which is how a
// strong definition wins over a weak one here. Overrides are matched by Label address, so an
// equal name declared in another module is never affected. Name lookups go through a hashbrown
// index that is built once on first use; the same name may legitimately appear more than once
// when different modules declare it, so lookup_all exists next to lookup.

//! Link-time registry of declared annotations.

use crate::label::Label;
use hashbrown::HashMap;
use linkme::distributed_slice;
use std::fmt;
use std::sync::OnceLock;

/// Whether an annotation was declared with the default body or defined with its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    Declared,
    Defined,
}

/// Address of an annotation function.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint(*const ());

// Only the address is ever read.
unsafe impl Sync for EntryPoint {}
unsafe impl Send for EntryPoint {}

impl EntryPoint {
    pub const fn new(address: *const ()) -> Self {
        Self(address)
    }

    pub fn address(self) -> usize {
        self.0 as usize
    }

    pub const fn as_ptr(self) -> *const () {
        self.0
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPoint({:#x})", self.address())
    }
}

/// Everything the process knows about one declared annotation.
#[derive(Debug)]
pub struct AnnotationDescriptor {
    pub name: &'static str,
    /// Path of the module generated for the annotation (`<parent>::<name>`).
    pub module_path: &'static str,
    pub label: &'static Label,
    pub entry: EntryPoint,
    pub definition: Definition,
}

impl AnnotationDescriptor {
    /// Override registered for this annotation, if any.
    pub fn overridden_by(&self) -> Option<&'static AnnotationOverride> {
        find_override(self.label)
    }
}

/// A replacement body for an annotation declared elsewhere.
#[derive(Debug)]
pub struct AnnotationOverride {
    /// Label of the annotation being replaced.
    pub label: &'static Label,
    /// Module that provided the override.
    pub module_path: &'static str,
    pub entry: EntryPoint,
}

#[distributed_slice]
pub static ANNOTATIONS: [AnnotationDescriptor];

#[distributed_slice]
pub static OVERRIDES: [AnnotationOverride];

static NAME_INDEX: OnceLock<HashMap<&'static str, Vec<&'static AnnotationDescriptor>>> =
    OnceLock::new();

fn name_index() -> &'static HashMap<&'static str, Vec<&'static AnnotationDescriptor>> {
    NAME_INDEX.get_or_init(|| {
        let mut index: HashMap<&'static str, Vec<&'static AnnotationDescriptor>> = HashMap::new();
        for descriptor in ANNOTATIONS.iter() {
            index.entry(descriptor.name).or_default().push(descriptor);
        }
        log::debug!(
            "annotation registry: {} descriptors, {} names",
            ANNOTATIONS.len(),
            index.len()
        );
        index
    })
}

/// All annotations linked into the process.
pub fn annotations() -> &'static [AnnotationDescriptor] {
    &ANNOTATIONS
}

/// First annotation registered under `name`.
pub fn lookup(name: &str) -> Option<&'static AnnotationDescriptor> {
    name_index().get(name).and_then(|all| all.first().copied())
}

pub fn lookup_all(name: &str) -> &'static [&'static AnnotationDescriptor] {
    name_index().get(name).map_or(&[], |all| all.as_slice())
}

pub fn find_by_label(text: &str) -> Option<&'static AnnotationDescriptor> {
    let name = crate::label::annotation_name(text)?;
    lookup_all(name)
        .iter()
        .copied()
        .find(|descriptor| descriptor.label.as_str() == text)
}

/// Override registered against exactly this label static.
///
/// When several components override the same annotation the first one
/// linked wins.
pub fn find_override(label: &'static Label) -> Option<&'static AnnotationOverride> {
    let mut matching = OVERRIDES
        .iter()
        .filter(|candidate| std::ptr::eq(candidate.label, label));
    let first = matching.next()?;
    let ignored = matching.count();
    if ignored > 0 {
        log::warn!(
            "{}: {ignored} more overrides ignored, using {}",
            label.as_str(),
            first.module_path
        );
    }
    Some(first)
}

pub fn find_by_entry(address: usize) -> Option<&'static AnnotationDescriptor> {
    ANNOTATIONS
        .iter()
        .find(|descriptor| descriptor.entry.address() == address)
}

#[cfg(all(test, dr_annotations_sites))]
mod tests {
    use super::*;

    crate::declare_annotation! {
        fn registry_probe(value: u32) -> u32;
    }

    crate::define_annotation! {
        fn registry_defined() {
            log::trace!("registry_defined body");
        }
    }

    #[test]
    fn test_declared_annotation_is_registered() {
        let descriptor = lookup("registry_probe").unwrap();
        assert_eq!(descriptor.definition, Definition::Declared);
        assert_eq!(descriptor.label.as_str(), "dynamorio-annotation:registry_probe");
        assert!(descriptor.module_path.ends_with("registry_probe"));
        assert_eq!(descriptor.entry.address(), registry_probe as usize);
    }

    #[test]
    fn test_defined_annotation_lookups() {
        let descriptor = lookup("registry_defined").unwrap();
        assert_eq!(descriptor.definition, Definition::Defined);
        let by_label = find_by_label("dynamorio-annotation:registry_defined").unwrap();
        assert!(std::ptr::eq(by_label, descriptor));
        let by_entry = find_by_entry(registry_defined as usize).unwrap();
        assert!(std::ptr::eq(by_entry, descriptor));
    }

    #[test]
    fn test_unknown_names() {
        assert!(lookup("not_an_annotation").is_none());
        assert!(lookup_all("not_an_annotation").is_empty());
        assert!(find_by_label("dynamorio-annotation:not_an_annotation").is_none());
    }

    #[test]
    fn test_default_body_is_harmless() {
        assert_eq!(registry_probe(7), 0);
        registry_defined();
    }
}
