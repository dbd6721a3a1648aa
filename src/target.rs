// This module answers the only configuration questions the annotation protocol has: how wide
// pointers are on the target and which inline-asm dialect the compiler offers. The pointer
// width fixes the two magic numbers of the wire format, namely the length of the dead label
// reference that the short skip must jump over (0x0c bytes with EAX on x86, 0x11 bytes with RAX
// on x86-64) and the register that reference writes. The dialect is chosen by build.rs:
// rustc 1.87+ supports label operands in asm!, which map directly onto the two continuation
// labels of a call site; older compilers (or the raw-sites feature) fall back to raw byte
// emission with numbered local labels and a selector register. Site encoding only exists for
// x86 and x86-64 ELF targets; everything else in the crate is portable.

//! Target pointer width and inline-asm dialect detection.

use crate::error::{AnnotationError, AnnotationResult};

/// Opcode of the 2-byte `jmp rel8` that opens every signature.
pub const SKIP_OPCODE: u8 = 0xEB;

/// Length of the skip instruction itself.
pub const SKIP_LENGTH: usize = 2;

/// Pointer width of an annotation encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    pub const fn bitness(self) -> u32 {
        match self {
            PointerWidth::Bits32 => 32,
            PointerWidth::Bits64 => 64,
        }
    }

    pub const fn pointer_bytes(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    /// Byte length of `mov _GLOBAL_OFFSET_TABLE_, %reg` plus `bsf/bsr label@GOT, %reg`.
    ///
    /// This is the skip displacement. It is a protocol constant: a skip of any
    /// other length lands inside the dead code and corrupts native execution.
    pub const fn label_reference_length(self) -> u8 {
        match self {
            PointerWidth::Bits32 => 0x0c,
            PointerWidth::Bits64 => 0x11,
        }
    }

    pub const fn label_reference_register(self) -> &'static str {
        match self {
            PointerWidth::Bits32 => "eax",
            PointerWidth::Bits64 => "rax",
        }
    }

    pub fn from_bitness(bits: u32) -> AnnotationResult<Self> {
        match bits {
            32 => Ok(PointerWidth::Bits32),
            64 => Ok(PointerWidth::Bits64),
            bits => Err(AnnotationError::UnsupportedWidth { bits }),
        }
    }
}

/// How call sites are expressed in inline assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `asm!` label operands name the two continuations directly.
    LabelOperands,
    /// Raw `.byte` emission, numbered local labels and a selector register.
    RawBytes,
}

#[cfg(target_arch = "x86_64")]
pub const HOST_WIDTH: Option<PointerWidth> = Some(PointerWidth::Bits64);
#[cfg(target_arch = "x86")]
pub const HOST_WIDTH: Option<PointerWidth> = Some(PointerWidth::Bits32);
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub const HOST_WIDTH: Option<PointerWidth> = None;

#[cfg(dr_annotations_goto)]
pub const HOST_DIALECT: Dialect = Dialect::LabelOperands;
#[cfg(not(dr_annotations_goto))]
pub const HOST_DIALECT: Dialect = Dialect::RawBytes;

/// Skip displacement used by sites compiled for this target.
#[cfg(target_arch = "x86_64")]
pub const LABEL_REFERENCE_LENGTH: u8 = PointerWidth::Bits64.label_reference_length();
#[cfg(target_arch = "x86")]
pub const LABEL_REFERENCE_LENGTH: u8 = PointerWidth::Bits32.label_reference_length();

/// Whether the target can carry annotation sites at all.
pub const SITES_SUPPORTED: bool = cfg!(dr_annotations_sites);

/// Summary of the compilation target as seen by the site encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub width: Option<PointerWidth>,
    pub dialect: Dialect,
    pub sites_supported: bool,
}

impl TargetInfo {
    pub const fn host() -> Self {
        Self {
            width: HOST_WIDTH,
            dialect: HOST_DIALECT,
            sites_supported: SITES_SUPPORTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths_have_distinct_constants() {
        assert_eq!(PointerWidth::Bits32.label_reference_length(), 12);
        assert_eq!(PointerWidth::Bits64.label_reference_length(), 17);
        assert_eq!(PointerWidth::Bits32.label_reference_register(), "eax");
        assert_eq!(PointerWidth::Bits64.label_reference_register(), "rax");
    }

    #[test]
    fn test_from_bitness() {
        assert_eq!(PointerWidth::from_bitness(64).unwrap(), PointerWidth::Bits64);
        assert_eq!(PointerWidth::from_bitness(32).unwrap(), PointerWidth::Bits32);
        assert!(matches!(
            PointerWidth::from_bitness(16),
            Err(AnnotationError::UnsupportedWidth { bits: 16 })
        ));
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn test_host_info() {
        let info = TargetInfo::host();
        assert_eq!(info.width, Some(PointerWidth::Bits64));
        assert!(info.sites_supported);
        assert_eq!(LABEL_REFERENCE_LENGTH, 0x11);
    }
}
