// This module connects annotation sites to the relocatable ELF objects they live in. Natively
// the dead label reference is just two 32-bit fields filled by the linker: the GOT base load
// carries a GOT-relative PC relocation against _GLOBAL_OFFSET_TABLE_ and the bsf/bsr carries a
// GOT32 relocation against the annotation's label pointer, which itself points at the label
// string. The emit side builds such objects from scratch (labels, weak hidden annotation
// functions with their tags, callers with complete sites), and the read side scans executable
// sections and follows the same relocations backwards to recover which annotation every site
// names. Labels are named `<annotation>_label`, matching what C toolchains emit for the protocol.

//! Relocatable ELF emission and label recovery.

mod emit;
mod read;

pub use emit::AnnotationObject;
pub use read::{scan_object, ObjectScan, ObjectSite};

use crate::error::{AnnotationError, AnnotationResult};
use crate::target::PointerWidth;
use object::{elf, Architecture};

/// Suffix of the symbol holding an annotation's label pointer.
pub const LABEL_SYMBOL_SUFFIX: &str = "_label";

/// Name of the symbol the GOT base load is relocated against.
pub const GOT_BASE_SYMBOL: &str = "_GLOBAL_OFFSET_TABLE_";

pub fn label_symbol_name(annotation: &str) -> String {
    format!("{annotation}{LABEL_SYMBOL_SUFFIX}")
}

pub fn width_for_architecture(architecture: Architecture) -> AnnotationResult<PointerWidth> {
    match architecture {
        Architecture::X86_64 => Ok(PointerWidth::Bits64),
        Architecture::I386 => Ok(PointerWidth::Bits32),
        architecture => Err(AnnotationError::UnsupportedArchitecture { architecture }),
    }
}

pub fn architecture_for_width(width: PointerWidth) -> Architecture {
    match width {
        PointerWidth::Bits64 => Architecture::X86_64,
        PointerWidth::Bits32 => Architecture::I386,
    }
}

/// ELF relocation types used by sites of one width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelocationTypes {
    /// `mov _GLOBAL_OFFSET_TABLE_, %reg`
    pub got_base: u32,
    /// `bsf/bsr label@GOT, %reg`
    pub label_slot: u32,
    /// `call annotation`
    pub call: u32,
    /// Label pointer to label string.
    pub pointer: u32,
    /// i386 objects use REL, so addends live in the relocated field.
    pub implicit_addends: bool,
}

impl RelocationTypes {
    pub(crate) fn for_width(width: PointerWidth) -> Self {
        match width {
            PointerWidth::Bits64 => Self {
                got_base: elf::R_X86_64_GOTPC32,
                label_slot: elf::R_X86_64_GOT32,
                call: elf::R_X86_64_PLT32,
                pointer: elf::R_X86_64_64,
                implicit_addends: false,
            },
            PointerWidth::Bits32 => Self {
                got_base: elf::R_386_GOTPC,
                label_slot: elf::R_386_GOT32,
                call: elf::R_386_PLT32,
                pointer: elf::R_386_32,
                implicit_addends: true,
            },
        }
    }
}
