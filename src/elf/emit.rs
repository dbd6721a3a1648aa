// AnnotationObject builds a relocatable ELF object laid out the way a C compiler lays out an
// annotated translation unit. Each label is a NUL-terminated string in .rodata plus a pointer
// slot `<name>_label` in .data.rel.ro that points at it; the slot is what the bsf/bsr GOT
// reference resolves to. Declared annotations are undefined weak hidden function symbols, so
// the final link tolerates their absence. Defined annotations are weak hidden functions whose
// first bytes are the function tag. Callers are global functions holding one complete call
// site assembled by SiteAssembler, with relocations on the GOT base load, the label slot load
// and the annotation call. For i386 (REL) the addends are stored in the relocated fields.

use super::{architecture_for_width, label_symbol_name, RelocationTypes, GOT_BASE_SYMBOL};
use crate::error::AnnotationResult;
use crate::label::{format_label, LabelKind};
use crate::target::{PointerWidth, SKIP_LENGTH};
use crate::x86::{AssembledSite, SiteAssembler};
use hashbrown::HashMap;
use object::write::{
    Object, Relocation, SectionId, StandardSection, Symbol, SymbolId, SymbolSection,
};
use object::{BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope};

const FUNCTION_ALIGNMENT: u64 = 16;

struct PendingRelocation {
    field: usize,
    symbol: SymbolId,
    r_type: u32,
    addend: i64,
}

/// Relocatable object under construction.
pub struct AnnotationObject {
    width: PointerWidth,
    relocations: RelocationTypes,
    assembler: SiteAssembler,
    object: Object<'static>,
    got_base: Option<SymbolId>,
    labels: HashMap<String, SymbolId>,
    annotations: HashMap<String, SymbolId>,
}

impl AnnotationObject {
    pub fn new(width: PointerWidth) -> Self {
        let object = Object::new(
            BinaryFormat::Elf,
            architecture_for_width(width),
            Endianness::Little,
        );
        Self {
            width,
            relocations: RelocationTypes::for_width(width),
            assembler: SiteAssembler::new(width),
            object,
            got_base: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    /// Emit `<name>_label` pointing at `"dynamorio-annotation:<name>"`.
    ///
    /// Repeated calls return the same symbol.
    pub fn define_label(&mut self, name: &str) -> AnnotationResult<SymbolId> {
        if let Some(&symbol) = self.labels.get(name) {
            return Ok(symbol);
        }

        let strings = self.object.section_id(StandardSection::ReadOnlyData);
        let mut text = format_label(LabelKind::Plain, name).into_bytes();
        text.push(0);
        let string_offset = self.object.append_section_data(strings, &text, 1);

        let slots = self.object.section_id(StandardSection::ReadOnlyDataWithRel);
        let pointer_bytes = self.width.pointer_bytes();
        let mut slot = vec![0u8; pointer_bytes];
        let mut addend = string_offset as i64;
        if self.relocations.implicit_addends {
            slot[..4].copy_from_slice(&(string_offset as u32).to_le_bytes());
            addend = 0;
        }
        let slot_offset = self.object.append_section_data(slots, &slot, pointer_bytes as u64);

        let symbol = self.object.add_symbol(Symbol {
            name: label_symbol_name(name).into_bytes(),
            value: slot_offset,
            size: pointer_bytes as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Section(slots),
            flags: SymbolFlags::None,
        });
        let strings_symbol = self.object.section_symbol(strings);
        self.object.add_relocation(
            slots,
            Relocation {
                offset: slot_offset,
                symbol: strings_symbol,
                addend,
                flags: RelocationFlags::Elf {
                    r_type: self.relocations.pointer,
                },
            },
        )?;

        log::debug!("label {name} at .data.rel.ro+{slot_offset:#x}");
        self.labels.insert(name.to_string(), symbol);
        Ok(symbol)
    }

    /// Declare an annotation without a body: an undefined weak hidden symbol.
    pub fn declare_annotation(&mut self, name: &str) -> AnnotationResult<SymbolId> {
        self.define_label(name)?;
        if let Some(&symbol) = self.annotations.get(name) {
            return Ok(symbol);
        }
        let symbol = self.object.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: true,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.annotations.insert(name.to_string(), symbol);
        Ok(symbol)
    }

    /// Define an annotation function: the tag followed by `body`, which
    /// must end in a return. An empty body returns immediately.
    pub fn define_annotation(&mut self, name: &str, body: &[u8]) -> AnnotationResult<SymbolId> {
        let label = self.define_label(name)?;
        let symbol = self.declare_annotation(name)?;
        let site = self.assembler.tagged_function(body)?;
        let relocations = self.site_relocations(&site, label);
        let size = site.code.len() as u64;
        let (text, offset) = self.append_function(site.code, relocations)?;
        self.object.set_symbol_data(symbol, text, offset, size);
        log::debug!("annotation {name} defined at .text+{offset:#x}");
        Ok(symbol)
    }

    /// Emit a global function `caller` whose only statement invokes
    /// `annotation` with `fallback` as the native path.
    pub fn emit_call_site(
        &mut self,
        caller: &str,
        annotation: &str,
        fallback: &[u8],
    ) -> AnnotationResult<SymbolId> {
        let label = self.define_label(annotation)?;
        let callee = self.declare_annotation(annotation)?;
        let site = self.assembler.call_site(fallback)?;
        let mut relocations = self.site_relocations(&site, label);
        if let Some(field) = site.call_field {
            relocations.push(PendingRelocation {
                field,
                symbol: callee,
                r_type: self.relocations.call,
                addend: -4,
            });
        }
        let size = site.code.len() as u64;
        let (text, offset) = self.append_function(site.code, relocations)?;
        let symbol = self.object.add_symbol(Symbol {
            name: caller.as_bytes().to_vec(),
            value: offset,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        log::debug!("caller {caller} -> {annotation} at .text+{offset:#x}");
        Ok(symbol)
    }

    pub fn finish(self) -> AnnotationResult<Vec<u8>> {
        Ok(self.object.write()?)
    }

    fn got_base(&mut self) -> SymbolId {
        if let Some(symbol) = self.got_base {
            return symbol;
        }
        let symbol = self.object.add_symbol(Symbol {
            name: GOT_BASE_SYMBOL.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.got_base = Some(symbol);
        symbol
    }

    fn site_relocations(
        &mut self,
        site: &AssembledSite,
        label: SymbolId,
    ) -> Vec<PendingRelocation> {
        let layout = &site.layout;
        let load_start = layout.offset + SKIP_LENGTH;
        vec![
            PendingRelocation {
                field: layout.got_field,
                symbol: self.got_base(),
                r_type: self.relocations.got_base,
                addend: (layout.got_field - load_start) as i64,
            },
            PendingRelocation {
                field: layout.label_field,
                symbol: label,
                r_type: self.relocations.label_slot,
                addend: 0,
            },
        ]
    }

    fn append_function(
        &mut self,
        mut code: Vec<u8>,
        relocations: Vec<PendingRelocation>,
    ) -> AnnotationResult<(SectionId, u64)> {
        if self.relocations.implicit_addends {
            for relocation in &relocations {
                let field = &mut code[relocation.field..relocation.field + 4];
                field.copy_from_slice(&(relocation.addend as i32).to_le_bytes());
            }
        }
        let text = self.object.section_id(StandardSection::Text);
        let offset = self
            .object
            .append_section_data(text, &code, FUNCTION_ALIGNMENT);
        for relocation in relocations {
            let addend = if self.relocations.implicit_addends {
                0
            } else {
                relocation.addend
            };
            self.object.add_relocation(
                text,
                Relocation {
                    offset: offset + relocation.field as u64,
                    symbol: relocation.symbol,
                    addend,
                    flags: RelocationFlags::Elf {
                        r_type: relocation.r_type,
                    },
                },
            )?;
        }
        Ok((text, offset))
    }
}
