//! Native execution of annotation sites: with no engine attached the skip is
//! always taken, so only the fallback ever runs.

#![cfg(dr_annotations_sites)]

use dynamorio_annotations::{
    annotation, annotation_or_native, declare_annotation, define_annotation, find_by_label,
    find_override, lookup, lookup_all, Definition,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

static LOG_EVENT_BODY: AtomicUsize = AtomicUsize::new(0);
static RECORDED: Mutex<Vec<u32>> = Mutex::new(Vec::new());

define_annotation! {
    /// Logs an event when an engine is attached.
    pub fn log_event(code: u32) {
        LOG_EVENT_BODY.fetch_add(code as usize, Ordering::SeqCst);
    }
}

declare_annotation! {
    fn engine_hook(a: u64, b: u64) -> u64;
    fn phase_marker(phase: u32);
    fn unhooked(a: u64) -> u64;
}

mod hooks {
    dynamorio_annotations::override_annotation! {
        super::engine_hook => pub fn add_operands(a: u64, b: u64) -> u64 {
            a + b
        }

        super::second::twin => pub fn twin_tenfold(x: u32) -> u32 {
            x * 10
        }
    }
}

fn record_locally(code: u32) {
    RECORDED.lock().unwrap().push(code);
}

mod first {
    dynamorio_annotations::define_annotation! {
        pub fn twin(x: u32) -> u32 {
            x + 1
        }
    }
}

mod second {
    dynamorio_annotations::define_annotation! {
        pub fn twin(x: u32) -> u32 {
            x + 2
        }
    }
}

#[test]
fn fallback_runs_once_and_annotation_never_runs() {
    annotation_or_native!(log_event(42), record_locally(42));
    assert_eq!(*RECORDED.lock().unwrap(), vec![42]);
    assert_eq!(LOG_EVENT_BODY.load(Ordering::SeqCst), 0);
}

#[test]
fn annotation_arguments_are_not_evaluated() {
    static EVALUATED: AtomicUsize = AtomicUsize::new(0);
    fn argument() -> u64 {
        EVALUATED.fetch_add(1, Ordering::SeqCst);
        7
    }

    annotation!(engine_hook(argument(), argument()));
    annotation_or_native!(engine_hook(argument(), 1), ());
    assert_eq!(EVALUATED.load(Ordering::SeqCst), 0);
}

#[test]
fn loop_of_sites_runs_every_fallback() {
    static FALLBACKS: AtomicUsize = AtomicUsize::new(0);
    for phase in 0..1000 {
        annotation_or_native!(
            phase_marker(phase),
            FALLBACKS.fetch_add(1, Ordering::SeqCst)
        );
    }
    assert_eq!(FALLBACKS.load(Ordering::SeqCst), 1000);
}

#[test]
fn declared_annotation_has_harmless_default() {
    assert_eq!(unhooked(3), 0);
    phase_marker(1);

    let descriptor = lookup("unhooked").unwrap();
    assert_eq!(descriptor.definition, Definition::Declared);
    assert_eq!(descriptor.label.as_str(), "dynamorio-annotation:unhooked");
    assert_eq!(descriptor.entry.address(), unhooked as usize);
    assert!(descriptor.overridden_by().is_none());
}

#[test]
fn override_replaces_declared_default() {
    assert_eq!(engine_hook(3, 4), 7);
    assert_eq!(engine_hook::body(3, 4), 7);
    assert_eq!(engine_hook::default_return(3, 4), 0);

    let descriptor = lookup("engine_hook").unwrap();
    assert_eq!(descriptor.definition, Definition::Declared);
    let replacement = descriptor.overridden_by().unwrap();
    assert!(replacement.module_path.ends_with("hooks"));
    assert_eq!(replacement.entry.address(), hooks::add_operands as usize);
    assert!(std::ptr::eq(find_override(&engine_hook::LABEL).unwrap(), replacement));
}

#[test]
fn override_only_reaches_its_own_declaration() {
    assert_eq!(first::twin(1), 2);
    assert_eq!(second::twin(1), 10);
    assert!(find_override(&first::twin::LABEL).is_none());
    assert!(find_override(&second::twin::LABEL).is_some());
}

#[test]
fn same_name_in_two_modules_does_not_collide() {
    assert_eq!(first::twin::LABEL.as_str(), second::twin::LABEL.as_str());
    assert!(!std::ptr::eq(&first::twin::LABEL, &second::twin::LABEL));
    assert_ne!(first::twin as usize, second::twin as usize);

    let all = lookup_all("twin");
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|d| d.definition == Definition::Defined));
    assert!(all.iter().any(|d| d.entry.address() == first::twin as usize));
    assert!(all.iter().any(|d| d.entry.address() == second::twin as usize));

    let found = find_by_label("dynamorio-annotation:twin").unwrap();
    assert_eq!(found.name, "twin");
}

#[test]
fn label_round_trip() {
    let descriptor = lookup("log_event").unwrap();
    let text = descriptor.label.as_str();
    assert_eq!(text, "dynamorio-annotation:log_event");
    assert_eq!(dynamorio_annotations::label::annotation_name(text), Some("log_event"));
    assert_eq!(descriptor.label.annotation_name(), "log_event");
}
