// This module implements the function tagger: the same signature family as a call site, but
// placed at the entry of an annotation's own implementation so an engine that reaches the
// function indirectly (or through a caller it never decoded) still recognizes it. The dead
// label reference uses `bsr` instead of `bsf`, which is how the two kinds are told apart. The
// exported entry of every annotation is a naked function whose first instruction is the skip,
// so no prologue, argument spill or return-value setup precedes the tag. The skip lands on the
// first of two tail jumps: the first continues into the compiled body, the second into a
// function that returns the return type's default value. Both targets share the entry's
// signature and calling convention, so the arguments and the return address are still exactly
// where the caller left them. Natively the skip is always taken; an engine that redirects the
// skip onto the second jump makes the whole function body disappear behind its own handler.

//! Function-entry tagger.

/// Emit the tagged entry of an annotation.
///
/// `$name` must be a module holding `LABEL`, `body` and `default_return`,
/// the latter two with the same signature as the entry.
#[cfg(all(dr_annotations_sites, target_arch = "x86_64"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_tagged_entry {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),*) $(-> $ret:ty)?
    ) => {
        $(#[$meta])*
        #[unsafe(naked)]
        #[allow(improper_ctypes_definitions)]
        $vis extern "C" fn $name($($arg: $ty),*) $(-> $ret)? {
            ::core::arch::naked_asm!(
                ".byte 0xeb, {skip}",
                "mov _GLOBAL_OFFSET_TABLE_, %rax",
                "bsr {label}@GOT, %rax",
                "jmp {body}",
                "jmp {default_return}",
                skip = const $crate::target::LABEL_REFERENCE_LENGTH,
                label = sym $name::LABEL,
                body = sym $name::body,
                default_return = sym $name::default_return,
                options(att_syntax),
            )
        }
    };
}

#[cfg(all(dr_annotations_sites, target_arch = "x86"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_tagged_entry {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident ($($arg:ident : $ty:ty),*) $(-> $ret:ty)?
    ) => {
        $(#[$meta])*
        #[unsafe(naked)]
        #[allow(improper_ctypes_definitions)]
        $vis extern "fastcall" fn $name($($arg: $ty),*) $(-> $ret)? {
            ::core::arch::naked_asm!(
                ".byte 0xeb, {skip}",
                "mov _GLOBAL_OFFSET_TABLE_, %eax",
                "bsr {label}@GOT, %eax",
                "jmp {body}",
                "jmp {default_return}",
                skip = const $crate::target::LABEL_REFERENCE_LENGTH,
                label = sym $name::LABEL,
                body = sym $name::body,
                default_return = sym $name::default_return,
                options(att_syntax),
            )
        }
    };
}

#[cfg(not(dr_annotations_sites))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_tagged_entry {
    ($($item:tt)*) => {
        ::core::compile_error!("annotation tags require an x86 or x86-64 ELF target");
    };
}
