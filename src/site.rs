// This module is the site encoder, the structural heart of the protocol. Each annotation call
// site is one inline-asm block with a fixed layout:
//
//   .p2align 1                         ; skip is 2-byte aligned, so patchable atomically
//   eb LEN                             ; short skip over the dead label reference
//   mov _GLOBAL_OFFSET_TABLE_, %reg    ; dead: GOT base, never executed
//   bsf <label>@GOT, %reg              ; dead: GOT slot of the annotation's Label
//   jmp native_run                     ; the skip lands exactly here
//   jmp native_end_marker
//   <annotation call>                  ; fallthrough, only reachable through redirection
//
// LEN is 0x11 on x86-64 and 0x0c on x86; the dead instructions carry relocations but their
// encodings never change, so LEN is a protocol constant. Two dialects produce the same bytes:
// with label operands the jumps target the continuations directly, and with raw byte emission
// the jumps target numbered local labels that load a path selector which ordinary Rust control
// flow dispatches on. asm! blocks without `pure` are never eliminated or merged, which keeps
// the dead label reference in the binary. The selected path is one of the constants below;
// annotation_or_native! turns it into the fallback, the annotation call or nothing.

//! Call-site encoder.

/// Skip taken: run the native fallback.
pub const NATIVE_RUN: u8 = 0;
/// Resume after the site without running the fallback.
pub const NATIVE_END: u8 = 1;
/// Fallthrough after the two jumps: call the annotation.
pub const ANNOTATION_CALL: u8 = 2;

#[cfg(all(dr_annotations_sites, target_arch = "x86_64"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site_goto {
    ($label:path) => {
        'site: {
            // SAFETY: control always leaves through a label operand; the label
            // reference between the skip and the jumps is never executed.
            unsafe {
                ::core::arch::asm!(
                    ".p2align 1",
                    ".byte 0xeb, {skip}",
                    "mov _GLOBAL_OFFSET_TABLE_, %rax",
                    "bsf {label}@GOT, %rax",
                    "jmp {native_run}",
                    "jmp {native_end_marker}",
                    skip = const $crate::target::LABEL_REFERENCE_LENGTH,
                    label = sym $label,
                    native_run = label { break 'site $crate::site::NATIVE_RUN },
                    native_end_marker = label { break 'site $crate::site::NATIVE_END },
                    options(att_syntax, nostack),
                );
            }
            $crate::site::ANNOTATION_CALL
        }
    };
}

#[cfg(all(dr_annotations_sites, target_arch = "x86"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site_goto {
    ($label:path) => {
        'site: {
            // SAFETY: control always leaves through a label operand; the label
            // reference between the skip and the jumps is never executed.
            unsafe {
                ::core::arch::asm!(
                    ".p2align 1",
                    ".byte 0xeb, {skip}",
                    "mov _GLOBAL_OFFSET_TABLE_, %eax",
                    "bsf {label}@GOT, %eax",
                    "jmp {native_run}",
                    "jmp {native_end_marker}",
                    skip = const $crate::target::LABEL_REFERENCE_LENGTH,
                    label = sym $label,
                    native_run = label { break 'site $crate::site::NATIVE_RUN },
                    native_end_marker = label { break 'site $crate::site::NATIVE_END },
                    options(att_syntax, nostack),
                );
            }
            $crate::site::ANNOTATION_CALL
        }
    };
}

#[cfg(all(dr_annotations_sites, target_arch = "x86_64"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site_raw {
    ($label:path) => {{
        let path: u8;
        // SAFETY: only the selector register is written; the label reference
        // between the skip and the jumps is never executed.
        unsafe {
            ::core::arch::asm!(
                ".p2align 1",
                ".byte 0xeb, {skip}",
                "mov _GLOBAL_OFFSET_TABLE_, %rax",
                "bsf {label}@GOT, %rax",
                "jmp 2f",
                "jmp 3f",
                "movb ${call}, {path}",
                "jmp 4f",
                "2:",
                "movb ${run}, {path}",
                "jmp 4f",
                "3:",
                "movb ${end}, {path}",
                "4:",
                skip = const $crate::target::LABEL_REFERENCE_LENGTH,
                label = sym $label,
                call = const $crate::site::ANNOTATION_CALL,
                run = const $crate::site::NATIVE_RUN,
                end = const $crate::site::NATIVE_END,
                path = out(reg_byte) path,
                options(att_syntax, nostack, nomem, preserves_flags),
            );
        }
        path
    }};
}

#[cfg(all(dr_annotations_sites, target_arch = "x86"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site_raw {
    ($label:path) => {{
        let path: u8;
        // SAFETY: only the selector register is written; the label reference
        // between the skip and the jumps is never executed.
        unsafe {
            ::core::arch::asm!(
                ".p2align 1",
                ".byte 0xeb, {skip}",
                "mov _GLOBAL_OFFSET_TABLE_, %eax",
                "bsf {label}@GOT, %eax",
                "jmp 2f",
                "jmp 3f",
                "movb ${call}, {path}",
                "jmp 4f",
                "2:",
                "movb ${run}, {path}",
                "jmp 4f",
                "3:",
                "movb ${end}, {path}",
                "4:",
                skip = const $crate::target::LABEL_REFERENCE_LENGTH,
                label = sym $label,
                call = const $crate::site::ANNOTATION_CALL,
                run = const $crate::site::NATIVE_RUN,
                end = const $crate::site::NATIVE_END,
                path = out(reg_byte) path,
                options(att_syntax, nostack, nomem, preserves_flags),
            );
        }
        path
    }};
}

/// Encode a call site for the given label static and yield the taken path.
#[cfg(all(dr_annotations_sites, dr_annotations_goto))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site {
    ($label:path) => {
        $crate::__dr_site_goto!($label)
    };
}

#[cfg(all(dr_annotations_sites, not(dr_annotations_goto)))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site {
    ($label:path) => {
        $crate::__dr_site_raw!($label)
    };
}

#[cfg(not(dr_annotations_sites))]
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_site {
    ($label:path) => {
        ::core::compile_error!("annotation sites require an x86 or x86-64 ELF target")
    };
}
