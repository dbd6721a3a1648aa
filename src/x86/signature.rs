// This module pins down the wire format of the protocol: the exact bytes an external analyzer
// matches. A signature is the 2-byte short skip followed by the dead label reference, with the
// two 32-bit displacement fields left as wildcards because the linker fills them in. On x86-64
// the reference is `mov _GLOBAL_OFFSET_TABLE_, %rax` (48 8B 04 25 disp32, absolute SIB form)
// plus `bsf/bsr label@GOT, %rax` (48 0F BC/BD 04 25 disp32) for 0x11 bytes; on x86 it is
// `mov _GLOBAL_OFFSET_TABLE_, %eax` (A1 disp32) plus `bsf/bsr label@GOT, %eax` (0F BC/BD 05
// disp32) for 0x0c bytes. Call sites use BSF (0xBC), function tags use BSR (0xBD). The jumps
// that follow are not part of the fixed pattern since their encodings depend on layout.
// Signature::fill produces concrete bytes for emitters.

//! Byte signatures of call sites and function tags.

use crate::target::{PointerWidth, SKIP_LENGTH, SKIP_OPCODE};

/// What a signature marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// A call site (`bsf`).
    CallSite,
    /// An annotation function entry (`bsr`).
    FunctionTag,
}

impl SiteKind {
    pub(crate) const fn scan_opcode(self) -> u8 {
        match self {
            SiteKind::CallSite => 0xBC,
            SiteKind::FunctionTag => 0xBD,
        }
    }
}

const BSF: u8 = SiteKind::CallSite.scan_opcode();
const BSR: u8 = SiteKind::FunctionTag.scan_opcode();

// eb 11 | mov rax, [_GLOBAL_OFFSET_TABLE_] | bsf rax, [label@GOT]
const X64_CALL_SITE: [Option<u8>; 19] = [
    Some(SKIP_OPCODE), Some(0x11),
    Some(0x48), Some(0x8B), Some(0x04), Some(0x25), None, None, None, None,
    Some(0x48), Some(0x0F), Some(BSF), Some(0x04), Some(0x25), None, None, None, None,
];

const X64_FUNCTION_TAG: [Option<u8>; 19] = [
    Some(SKIP_OPCODE), Some(0x11),
    Some(0x48), Some(0x8B), Some(0x04), Some(0x25), None, None, None, None,
    Some(0x48), Some(0x0F), Some(BSR), Some(0x04), Some(0x25), None, None, None, None,
];

// eb 0c | mov eax, [_GLOBAL_OFFSET_TABLE_] | bsf eax, [label@GOT]
const X86_CALL_SITE: [Option<u8>; 14] = [
    Some(SKIP_OPCODE), Some(0x0C),
    Some(0xA1), None, None, None, None,
    Some(0x0F), Some(BSF), Some(0x05), None, None, None, None,
];

const X86_FUNCTION_TAG: [Option<u8>; 14] = [
    Some(SKIP_OPCODE), Some(0x0C),
    Some(0xA1), None, None, None, None,
    Some(0x0F), Some(BSR), Some(0x05), None, None, None, None,
];

/// Fixed byte pattern for one (width, kind) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub width: PointerWidth,
    pub kind: SiteKind,
}

impl Signature {
    pub const fn new(width: PointerWidth, kind: SiteKind) -> Self {
        Self { width, kind }
    }

    /// Masked pattern; `None` bytes are relocated displacement bytes.
    pub fn pattern(&self) -> &'static [Option<u8>] {
        match (self.width, self.kind) {
            (PointerWidth::Bits64, SiteKind::CallSite) => &X64_CALL_SITE,
            (PointerWidth::Bits64, SiteKind::FunctionTag) => &X64_FUNCTION_TAG,
            (PointerWidth::Bits32, SiteKind::CallSite) => &X86_CALL_SITE,
            (PointerWidth::Bits32, SiteKind::FunctionTag) => &X86_FUNCTION_TAG,
        }
    }

    pub fn len(&self) -> usize {
        self.pattern().len()
    }

    /// Offset of the GOT-base displacement, from the skip opcode.
    pub fn got_field(&self) -> usize {
        match self.width {
            PointerWidth::Bits64 => 6,
            PointerWidth::Bits32 => 3,
        }
    }

    /// Offset of the GOT-slot displacement, from the skip opcode.
    pub fn label_field(&self) -> usize {
        match self.width {
            PointerWidth::Bits64 => 15,
            PointerWidth::Bits32 => 10,
        }
    }

    /// Offset of the label-reference instruction, from the skip opcode.
    pub fn label_reference(&self) -> usize {
        match self.width {
            PointerWidth::Bits64 => 10,
            PointerWidth::Bits32 => 7,
        }
    }

    pub fn matches(&self, code: &[u8]) -> bool {
        let pattern = self.pattern();
        code.len() >= pattern.len()
            && pattern
                .iter()
                .zip(code)
                .all(|(expected, byte)| expected.map_or(true, |expected| expected == *byte))
    }

    /// Whether `code` starts like any site of this width, ignoring the skip
    /// displacement and the kind. Used to catch mismatched skips.
    pub fn dead_code_prefix(width: PointerWidth, code: &[u8]) -> bool {
        let prefix: &[u8] = match width {
            PointerWidth::Bits64 => &[0x48, 0x8B, 0x04, 0x25],
            PointerWidth::Bits32 => &[0xA1],
        };
        code.len() > SKIP_LENGTH && code[0] == SKIP_OPCODE && code[SKIP_LENGTH..].starts_with(prefix)
    }

    /// Concrete bytes with both displacement fields filled in.
    pub fn fill(&self, got_displacement: i32, label_displacement: i32) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.pattern().iter().map(|b| b.unwrap_or(0)).collect();
        let got = self.got_field();
        let label = self.label_field();
        bytes[got..got + 4].copy_from_slice(&got_displacement.to_le_bytes());
        bytes[label..label + 4].copy_from_slice(&label_displacement.to_le_bytes());
        bytes
    }
}
