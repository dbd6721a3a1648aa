// scan_object runs the site scanner over every executable section of an ELF file and, where the
// file still carries relocations, recovers what each site refers to. The label field of a site
// is relocated against the annotation's label pointer symbol; that symbol's own relocation
// leads to the label string, from which the annotation name is sliced off the fixed prefix. For
// call sites the `call rel32` on the fallthrough path names the annotation function, and for
// function tags the enclosing function symbol does. Linked images without relocations still
// yield verified layouts, just without names.

use super::{width_for_architecture, LABEL_SYMBOL_SUFFIX};
use crate::error::{AnnotationError, AnnotationResult};
use crate::label::annotation_name;
use crate::target::PointerWidth;
use crate::x86::{SiteKind, SiteLayout, SiteScanner};
use hashbrown::HashMap;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex, SectionKind,
    SymbolIndex, SymbolKind,
};
use std::ffi::CStr;

const CALL_REL32: u8 = 0xE8;

/// One verified site together with what its relocations name.
#[derive(Debug, Clone)]
pub struct ObjectSite {
    pub section: String,
    pub layout: SiteLayout,
    /// Symbol the label slot load is relocated against (`<name>_label`).
    pub label_symbol: Option<String>,
    /// Recovered label string.
    pub label: Option<String>,
    pub annotation: Option<String>,
    /// Called annotation (call sites) or tagged function (function tags).
    pub callee: Option<String>,
}

/// Sites and defects of one object file.
#[derive(Debug)]
pub struct ObjectScan {
    pub width: PointerWidth,
    pub sites: Vec<ObjectSite>,
    pub defects: Vec<AnnotationError>,
}

impl ObjectScan {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Target {
    symbol: Option<SymbolIndex>,
    section: Option<SectionIndex>,
    addend: i64,
}

type Targets = HashMap<u64, Target>;

struct Resolver<'data, 'file> {
    file: &'file object::File<'data>,
    targets: HashMap<SectionIndex, Targets>,
}

impl<'data, 'file> Resolver<'data, 'file> {
    fn new(file: &'file object::File<'data>) -> Self {
        Self {
            file,
            targets: HashMap::new(),
        }
    }

    fn targets(&mut self, index: SectionIndex) -> AnnotationResult<&Targets> {
        if !self.targets.contains_key(&index) {
            let section = self.file.section_by_index(index)?;
            let targets = collect_targets(self.file, &section)?;
            self.targets.insert(index, targets);
        }
        Ok(&self.targets[&index])
    }

    fn target(&mut self, section: SectionIndex, offset: u64) -> AnnotationResult<Option<Target>> {
        Ok(self.targets(section)?.get(&offset).copied())
    }

    fn symbol_name(&self, index: SymbolIndex) -> Option<String> {
        let symbol = self.file.symbol_by_index(index).ok()?;
        symbol.name().ok().map(str::to_string)
    }

    /// Follow the target of a label slot load to the label string.
    fn label_text(&mut self, slot: Target) -> AnnotationResult<Option<String>> {
        let (slot_section, offset) = match slot.symbol {
            Some(index) => {
                let symbol = self.file.symbol_by_index(index)?;
                let Some(section_index) = symbol.section_index() else {
                    return Ok(None);
                };
                let section = self.file.section_by_index(section_index)?;
                match symbol.address().checked_sub(section.address()) {
                    Some(offset) => (section_index, offset),
                    None => return Ok(None),
                }
            }
            None => match (slot.section, u64::try_from(slot.addend)) {
                (Some(section_index), Ok(offset)) => (section_index, offset),
                _ => return Ok(None),
            },
        };
        let Some(target) = self.target(slot_section, offset)? else {
            return Ok(None);
        };
        let Some(string_section) = target.section else {
            return Ok(None);
        };
        let strings = self.file.section_by_index(string_section)?;
        let base = match target.symbol {
            Some(index) => {
                let symbol = self.file.symbol_by_index(index)?;
                symbol.address().saturating_sub(strings.address()) as i64
            }
            None => 0,
        };
        let data = strings.data()?;
        let text = base
            .checked_add(target.addend)
            .and_then(|start| usize::try_from(start).ok())
            .and_then(|start| data.get(start..))
            .and_then(|tail| CStr::from_bytes_until_nul(tail).ok())
            .and_then(|text| text.to_str().ok())
            .map(str::to_string);
        Ok(text)
    }
}

fn collect_targets<'data>(
    file: &object::File<'data>,
    section: &object::Section<'data, '_>,
) -> AnnotationResult<Targets> {
    let data = section.data()?;
    let mut targets = Targets::new();
    for (offset, relocation) in section.relocations() {
        let addend = if relocation.has_implicit_addend() {
            implicit_addend(data, offset).unwrap_or_default()
        } else {
            relocation.addend()
        };
        let target = match relocation.target() {
            RelocationTarget::Symbol(index) => {
                let symbol = file.symbol_by_index(index)?;
                Target {
                    symbol: (symbol.kind() != SymbolKind::Section).then_some(index),
                    section: symbol.section_index(),
                    addend,
                }
            }
            RelocationTarget::Section(index) => Target {
                symbol: None,
                section: Some(index),
                addend,
            },
            _ => continue,
        };
        targets.insert(offset, target);
    }
    Ok(targets)
}

fn implicit_addend(data: &[u8], offset: u64) -> Option<i64> {
    let start = usize::try_from(offset).ok()?;
    let field: [u8; 4] = data.get(start..start.checked_add(4)?)?.try_into().ok()?;
    Some(i32::from_le_bytes(field) as i64)
}

/// Find and resolve every annotation site in an ELF file.
pub fn scan_object(bytes: &[u8]) -> AnnotationResult<ObjectScan> {
    let file = object::File::parse(bytes)?;
    let width = width_for_architecture(file.architecture())?;
    let scanner = SiteScanner::new(width);
    let mut resolver = Resolver::new(&file);
    let mut scan = ObjectScan {
        width,
        sites: Vec::new(),
        defects: Vec::new(),
    };

    for section in file.sections().filter(|s| s.kind() == SectionKind::Text) {
        let name = section.name()?.to_string();
        let data = section.data()?;
        let report = scanner.scan(data, section.address());
        log::debug!("{name}: {} sites, {} defects", report.sites.len(), report.defects.len());
        scan.defects.extend(report.defects);

        for layout in report.sites {
            let label_target = resolver.target(section.index(), layout.label_field as u64)?;
            let label_symbol = label_target
                .and_then(|target| target.symbol)
                .and_then(|index| resolver.symbol_name(index));
            let label = match label_target {
                Some(target) => resolver.label_text(target)?,
                None => None,
            };
            let annotation = label
                .as_deref()
                .and_then(annotation_name)
                .or_else(|| label_symbol.as_deref()?.strip_suffix(LABEL_SYMBOL_SUFFIX))
                .map(str::to_string);

            let callee = match layout.kind {
                SiteKind::CallSite if data.get(layout.fallthrough) == Some(&CALL_REL32) => resolver
                    .target(section.index(), layout.fallthrough as u64 + 1)?
                    .and_then(|target| target.symbol)
                    .and_then(|index| resolver.symbol_name(index)),
                SiteKind::CallSite => None,
                SiteKind::FunctionTag => {
                    enclosing_function(&file, section.index(), section.address() + layout.offset as u64)
                }
            };

            if label.is_none() {
                log::warn!("{name}+{:#x}: label not recoverable", layout.offset);
            }
            scan.sites.push(ObjectSite {
                section: name.clone(),
                layout,
                label_symbol,
                label,
                annotation,
                callee,
            });
        }
    }
    Ok(scan)
}

fn enclosing_function(file: &object::File<'_>, section: SectionIndex, address: u64) -> Option<String> {
    file.symbols()
        .find(|symbol| {
            symbol.kind() == SymbolKind::Text
                && symbol.section_index() == Some(section)
                && symbol.address() == address
        })
        .and_then(|symbol| symbol.name().ok().map(str::to_string))
}
