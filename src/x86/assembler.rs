// This module assembles reference machine code for annotation sites with the iced-x86 code
// assembler. It is used by the ELF emitter to produce relocatable objects in the exact shape a
// C toolchain produces for the protocol, and by tests that need a known-good site without
// relying on inline asm. The fixed signature bytes are emitted verbatim (their displacement
// fields stay zero, to be filled by relocations), while the jumps, the fallback and the
// immediate-return path go through assembler labels so the block encoder picks the shortest
// jump forms. Every assembled buffer is re-verified with the scanner before it is returned,
// so emitted code and scanned code can never disagree about the layout.

//! Reference site assembly using iced-x86's `code_asm`.

use super::scanner::{SiteLayout, SiteScanner};
use super::signature::{Signature, SiteKind};
use crate::error::{AnnotationError, AnnotationResult};
use crate::target::PointerWidth;
use iced_x86::code_asm::*;

/// `call rel32` with a zero displacement, relocated against the annotation.
const CALL_REL32: [u8; 5] = [0xE8, 0x00, 0x00, 0x00, 0x00];

/// Machine code for one function carrying a site.
#[derive(Debug, Clone)]
pub struct AssembledSite {
    pub code: Vec<u8>,
    pub layout: SiteLayout,
    /// Offset of the `call rel32` displacement on the annotation path.
    pub call_field: Option<usize>,
}

/// Builds complete functions around call sites and function tags.
#[derive(Debug, Clone, Copy)]
pub struct SiteAssembler {
    width: PointerWidth,
}

impl SiteAssembler {
    pub fn new(width: PointerWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    fn assembler(&self) -> AnnotationResult<CodeAssembler> {
        CodeAssembler::new(self.width.bitness()).map_err(AnnotationError::encoding)
    }

    /// A caller whose only statement is `annotation_or_native(annotation(), fallback)`.
    ///
    /// Layout: the site, then the annotation call (fallthrough), then the
    /// fallback at `native_run`, then `ret` at `native_end_marker`.
    pub fn call_site(&self, fallback: &[u8]) -> AnnotationResult<AssembledSite> {
        let mut a = self.assembler()?;
        let mut native_run = a.create_label();
        let mut native_end = a.create_label();

        a.db(&Signature::new(self.width, SiteKind::CallSite).fill(0, 0))
            .map_err(AnnotationError::encoding)?;
        a.jmp(native_run).map_err(AnnotationError::encoding)?;
        a.jmp(native_end).map_err(AnnotationError::encoding)?;
        a.db(&CALL_REL32).map_err(AnnotationError::encoding)?;
        a.jmp(native_end).map_err(AnnotationError::encoding)?;

        a.set_label(&mut native_run).map_err(AnnotationError::encoding)?;
        if fallback.is_empty() {
            a.nop().map_err(AnnotationError::encoding)?;
        } else {
            a.db(fallback).map_err(AnnotationError::encoding)?;
        }

        a.set_label(&mut native_end).map_err(AnnotationError::encoding)?;
        a.ret().map_err(AnnotationError::encoding)?;

        let code = a.assemble(0).map_err(AnnotationError::encoding)?;
        let layout = SiteScanner::new(self.width).verify_at(&code, 0, 0)?;
        let call_field = Some(layout.fallthrough + 1);
        Ok(AssembledSite {
            code,
            layout,
            call_field,
        })
    }

    /// An annotation function: the tag, then `body` (which must end in a
    /// return), then the immediate-return path yielding zero.
    pub fn tagged_function(&self, body: &[u8]) -> AnnotationResult<AssembledSite> {
        let mut a = self.assembler()?;
        let mut body_label = a.create_label();
        let mut return_label = a.create_label();

        a.db(&Signature::new(self.width, SiteKind::FunctionTag).fill(0, 0))
            .map_err(AnnotationError::encoding)?;
        a.jmp(body_label).map_err(AnnotationError::encoding)?;
        a.jmp(return_label).map_err(AnnotationError::encoding)?;

        a.set_label(&mut body_label).map_err(AnnotationError::encoding)?;
        if body.is_empty() {
            a.ret().map_err(AnnotationError::encoding)?;
        } else {
            a.db(body).map_err(AnnotationError::encoding)?;
        }

        a.set_label(&mut return_label).map_err(AnnotationError::encoding)?;
        a.xor(eax, eax).map_err(AnnotationError::encoding)?;
        a.ret().map_err(AnnotationError::encoding)?;

        let code = a.assemble(0).map_err(AnnotationError::encoding)?;
        let layout = SiteScanner::new(self.width).verify_at(&code, 0, 0)?;
        Ok(AssembledSite {
            code,
            layout,
            call_field: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_site_jumps_reach_their_targets() {
        for width in [PointerWidth::Bits32, PointerWidth::Bits64] {
            let fallback = [0x90, 0x90, 0x90];
            let site = SiteAssembler::new(width).call_site(&fallback).unwrap();
            let layout = &site.layout;
            assert_eq!(layout.kind, SiteKind::CallSite);
            assert_eq!(layout.skip_length, width.label_reference_length());

            let call = site.call_field.unwrap() - 1;
            assert_eq!(site.code[call], 0xE8);
            assert_eq!(call, layout.fallthrough);

            let native_run = layout.jumps[0].target as usize;
            assert_eq!(&site.code[native_run..native_run + 3], &fallback);
            let native_end = layout.jumps[1].target as usize;
            assert_eq!(native_end, native_run + 3);
            assert_eq!(site.code[native_end], 0xC3);
        }
    }

    #[test]
    fn test_tagged_function_paths() {
        let site = SiteAssembler::new(PointerWidth::Bits64)
            .tagged_function(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])
            .unwrap();
        let layout = &site.layout;
        assert_eq!(layout.kind, SiteKind::FunctionTag);
        assert_eq!(layout.jumps[0].target as usize, layout.fallthrough);
        let ret = layout.jumps[1].target as usize;
        assert_eq!(&site.code[ret..], &[0x31, 0xC0, 0xC3]);
        assert!(site.call_field.is_none());
    }

    #[test]
    fn test_empty_fallback_still_assembles() {
        let site = SiteAssembler::new(PointerWidth::Bits64).call_site(&[]).unwrap();
        let native_run = site.layout.jumps[0].target as usize;
        assert_eq!(site.code[native_run], 0x90);
    }
}
