// This module is the declaration/definition front-end that application code actually uses.
// declare_annotation! introduces an annotation whose own body is the harmless default (its
// arguments are ignored and it returns Default::default()), which is how this crate expresses
// the weak declaration of the C protocol: a missing implementation is never a link or load
// failure. define_annotation! supplies a real body, and override_annotation! lets another
// component replace either one, the way a strong definition replaces a weak one. Both
// declaring macros expand to a module named after the annotation, holding its static Label,
// its registry descriptor, the pointer type of its signature and two fixed-convention
// functions (the body, which defers to a registered override, and the default return), plus
// the annotation itself: a naked entry that starts with the function tag and tail-jumps to
// one of the two. The calling convention is fastcall on x86 and the C convention on x86-64.
// Annotation functions are ordinary mangled Rust items, so they are never exported from a
// cdylib. annotation_or_native! and annotation! encode a call site and dispatch on the taken
// path: natively the fallback runs and the annotation arguments are never evaluated.

//! Declare/define/invoke macros.

/// Declare annotations whose implementation is left to the engine.
///
/// ```ignore
/// declare_annotation! {
///     /// Marks a phase boundary.
///     pub fn phase_marker(phase: u32);
/// }
/// ```
#[macro_export]
macro_rules! declare_annotation {
    ($(
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),* $(,)?) $(-> $ret:ty)?;
    )+) => {
        $(
            $crate::__dr_annotation_item! {
                Declared;
                $(#[$meta])*
                $vis fn $name ($($arg : $ty),*) $(-> $ret)? {
                    let _ = ($($arg,)*);
                    ::core::default::Default::default()
                }
            }
        )+
    };
}

/// Define annotations together with their implementation.
///
/// The return type must implement `Default`: it is what the function tag
/// returns when an engine redirects entry into the immediate-return path.
#[macro_export]
macro_rules! define_annotation {
    ($(
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block
    )+) => {
        $(
            $crate::__dr_annotation_item! {
                Defined;
                $(#[$meta])*
                $vis fn $name ($($arg : $ty),*) $(-> $ret)? $body
            }
        )+
    };
}

/// Replace the body of an annotation declared or defined elsewhere.
///
/// ```ignore
/// override_annotation! {
///     crate::hooks::engine_hook => fn add_operands(a: u64, b: u64) -> u64 {
///         a + b
///     }
/// }
/// ```
///
/// The replacement must have exactly the annotation's signature. It is
/// registered at link time and runs whenever the annotation's entry continues
/// into its body, whether called directly or from a redirected site.
#[macro_export]
macro_rules! override_annotation {
    ($(
        $(#[$meta:meta])*
        $($target:ident)::+ => $vis:vis fn $name:ident ($($arg:ident : $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block
    )+) => {
        $(
            $crate::__dr_annotation_fn! {
                $(#[$meta])*
                $vis fn $name ($($arg : $ty),*) $(-> $ret)? $body
            }

            const _: () = {
                #[$crate::__private::distributed_slice($crate::registry::OVERRIDES)]
                #[linkme(crate = $crate::__private::linkme)]
                static OVERRIDE: $crate::registry::AnnotationOverride =
                    $crate::registry::AnnotationOverride {
                        label: &$($target::)+ LABEL,
                        module_path: ::core::module_path!(),
                        entry: $crate::registry::EntryPoint::new(
                            $name as $($target::)+ Signature as *const (),
                        ),
                    };
            };
        )+
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __dr_annotation_item {
    (
        $definition:ident;
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),*) $(-> $ret:ty)? $body:block
    ) => {
        #[doc(hidden)]
        #[allow(private_interfaces)]
        $vis mod $name {
            #[allow(unused_imports)]
            use super::*;

            /// Pointer type of the entry, its body and any override.
            pub type Signature = $crate::__dr_signature!(($($ty),*) $(-> $ret)?);

            pub static LABEL: $crate::label::Label =
                $crate::label::Label::new($crate::__dr_label_text!($name));

            #[$crate::__private::distributed_slice($crate::registry::ANNOTATIONS)]
            #[linkme(crate = $crate::__private::linkme)]
            static DESCRIPTOR: $crate::registry::AnnotationDescriptor =
                $crate::registry::AnnotationDescriptor {
                    name: ::core::stringify!($name),
                    module_path: ::core::module_path!(),
                    label: &LABEL,
                    entry: $crate::registry::EntryPoint::new(super::$name as *const ()),
                    definition: $crate::registry::Definition::$definition,
                };

            static OVERRIDE: ::std::sync::OnceLock<::core::option::Option<Signature>> =
                ::std::sync::OnceLock::new();

            pub fn implementation() -> ::core::option::Option<Signature> {
                *OVERRIDE.get_or_init(|| {
                    $crate::registry::find_override(&LABEL).map(|found| {
                        // SAFETY: override_annotation! only registers functions that
                        // were coerced to this annotation's Signature.
                        unsafe { ::core::mem::transmute::<*const (), Signature>(found.entry.as_ptr()) }
                    })
                })
            }

            $crate::__dr_annotation_fn! {
                pub(super) fn body($($arg : $ty),*) $(-> $ret)? {
                    match implementation() {
                        ::core::option::Option::Some(replacement) => replacement($($arg),*),
                        ::core::option::Option::None => own_body($($arg),*),
                    }
                }
            }

            $crate::__dr_annotation_fn! {
                pub(super) fn default_return($($arg : $ty),*) $(-> $ret)? {
                    let _ = ($($arg,)*);
                    ::core::default::Default::default()
                }
            }

            #[inline(always)]
            fn own_body($($arg : $ty),*) $(-> $ret)? $body
        }

        $crate::__dr_tagged_entry! {
            $(#[$meta])*
            $vis fn $name ($($arg : $ty),*) $(-> $ret)?
        }
    };
}

#[cfg(target_arch = "x86")]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_signature {
    (($($ty:ty),*) $(-> $ret:ty)?) => {
        extern "fastcall" fn($($ty),*) $(-> $ret)?
    };
}

#[cfg(not(target_arch = "x86"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_signature {
    (($($ty:ty),*) $(-> $ret:ty)?) => {
        extern "C" fn($($ty),*) $(-> $ret)?
    };
}

#[cfg(target_arch = "x86")]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_annotation_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),*) $(-> $ret:ty)? $body:block
    ) => {
        $(#[$meta])*
        #[inline(never)]
        #[allow(improper_ctypes_definitions)]
        $vis extern "fastcall" fn $name($($arg: $ty),*) $(-> $ret)? $body
    };
}

#[cfg(not(target_arch = "x86"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_annotation_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),*) $(-> $ret:ty)? $body:block
    ) => {
        $(#[$meta])*
        #[inline(never)]
        #[allow(improper_ctypes_definitions)]
        $vis extern "C" fn $name($($arg: $ty),*) $(-> $ret)? $body
    };
}

/// Invoke an annotation, running `native` when no engine is attached.
///
/// ```ignore
/// annotation_or_native!(events::log_event(code), record_locally(code));
/// ```
///
/// The annotation arguments are only evaluated if an engine redirects the
/// site. The fallback is evaluated as a statement.
#[macro_export]
macro_rules! annotation_or_native {
    ($($segment:ident)::+ ($($arg:expr),* $(,)?), $native:expr $(,)?) => {
        match $crate::__dr_site!($($segment::)+ LABEL) {
            $crate::site::NATIVE_RUN => {
                $native;
            }
            $crate::site::ANNOTATION_CALL => {
                let _ = $($segment)::+($($arg),*);
            }
            _ => {}
        }
    };
}

/// Invoke an annotation that does nothing natively.
#[macro_export]
macro_rules! annotation {
    ($($segment:ident)::+ ($($arg:expr),* $(,)?)) => {
        $crate::annotation_or_native!($($segment)::+ ($($arg),*), ())
    };
}

#[cfg(all(test, dr_annotations_sites))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static BODY_RUNS: AtomicUsize = AtomicUsize::new(0);
    static FALLBACK_RUNS: AtomicUsize = AtomicUsize::new(0);

    crate::define_annotation! {
        fn counted(step: usize) {
            BODY_RUNS.fetch_add(step, Ordering::SeqCst);
        }

        fn scaled(value: u64, factor: u64) -> u64 {
            value * factor
        }
    }

    crate::declare_annotation! {
        fn engine_only(a: u8, b: u8,) -> bool;
    }

    #[test]
    fn test_fallback_runs_and_body_does_not() {
        crate::annotation_or_native!(counted(1), FALLBACK_RUNS.fetch_add(1, Ordering::SeqCst));
        assert_eq!(FALLBACK_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tagged_function_runs_body_when_called_directly() {
        assert_eq!(scaled(6, 7), 42);
        assert!(!engine_only(1, 2));
    }

    #[test]
    fn test_empty_fallback_form() {
        crate::annotation!(engine_only(3, 4));
        crate::annotation!(scaled(1, 2));
    }
}
