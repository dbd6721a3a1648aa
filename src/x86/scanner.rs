// This module finds and verifies annotation signatures in machine code, which is what an
// instrumentation engine does when it decodes a basic block, and what this crate does to prove
// that compiled sites have exactly the expected bytes. Candidates are found by looking for the
// short skip followed by the start of the dead GOT-base load. Each candidate is then decoded
// with iced-x86: the two dead instructions must be `mov` and `bsf`/`bsr` into the width's
// register with absolute 32-bit displacements, their combined length must equal the skip
// displacement, and the skip must land on two consecutive direct jumps. A verified site is
// described by a SiteLayout holding the field offsets of both relocated displacements and both
// jump targets; a candidate that fails verification becomes a defect in the ScanReport rather
// than aborting the scan. SiteLayout::redirect_patch computes the 2-byte rewrite of the skip that an
// engine applies to take the annotation path.

//! Signature scanner built on the iced-x86 decoder.

use super::signature::{Signature, SiteKind};
use crate::error::{AnnotationError, AnnotationResult};
use crate::target::{PointerWidth, SKIP_LENGTH, SKIP_OPCODE};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use std::fmt;

/// One of the two direct jumps that follow the dead label reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteJump {
    /// Offset of the jump from the start of the scanned code.
    pub offset: usize,
    pub length: usize,
    /// Absolute branch target (scan base applied).
    pub target: u64,
}

/// Verified shape of one call site or function tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    pub kind: SiteKind,
    /// Offset of the skip opcode.
    pub offset: usize,
    pub skip_length: u8,
    pub register: Register,
    /// Offset of the GOT-base displacement field.
    pub got_field: usize,
    pub got_displacement: i32,
    /// Offset of the label GOT-slot displacement field.
    pub label_field: usize,
    pub label_displacement: i32,
    /// `[native_run, native_end_marker]` for call sites, `[body, return]` for tags.
    pub jumps: [SiteJump; 2],
    /// Offset just past the second jump.
    pub fallthrough: usize,
}

impl SiteLayout {
    /// Total bytes from the skip through the second jump.
    pub fn len(&self) -> usize {
        self.fallthrough - self.offset
    }

    /// The skip rewrite that diverts control to the annotation path.
    ///
    /// A call site is redirected onto its fallthrough (the annotation call),
    /// a function tag onto its second jump (the immediate return).
    pub fn redirect_patch(&self) -> AnnotationResult<RedirectPatch> {
        let start = self.offset + SKIP_LENGTH;
        let landing = match self.kind {
            SiteKind::CallSite => self.fallthrough,
            SiteKind::FunctionTag => self.jumps[1].offset,
        };
        let displacement = landing
            .checked_sub(start)
            .and_then(|distance| u8::try_from(distance).ok())
            .filter(|displacement| *displacement <= i8::MAX as u8)
            .ok_or_else(|| {
                AnnotationError::malformed(self.offset, "redirect target out of rel8 range")
            })?;
        Ok(RedirectPatch {
            offset: self.offset,
            original: [SKIP_OPCODE, self.skip_length],
            patched: [SKIP_OPCODE, displacement],
        })
    }
}

/// Two-byte rewrite of a site's skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPatch {
    pub offset: usize,
    pub original: [u8; 2],
    pub patched: [u8; 2],
}

impl RedirectPatch {
    /// A 2-byte store is atomic on x86 when it does not straddle a word boundary.
    pub fn is_atomic(&self, base: u64) -> bool {
        base.wrapping_add(self.offset as u64) % 2 == 0
    }

    pub fn apply(&self, code: &mut [u8]) -> AnnotationResult<()> {
        let bytes = self
            .offset
            .checked_add(SKIP_LENGTH)
            .and_then(|end| code.get_mut(self.offset..end))
            .ok_or_else(|| AnnotationError::malformed(self.offset, "patch outside code"))?;
        if *bytes != self.original {
            return Err(AnnotationError::malformed(
                self.offset,
                format!("expected {:02x?} before patching, found {:02x?}", self.original, bytes),
            ));
        }
        bytes.copy_from_slice(&self.patched);
        Ok(())
    }
}

impl fmt::Display for RedirectPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}: {:02x} {:02x} -> {:02x} {:02x}",
            self.offset, self.original[0], self.original[1], self.patched[0], self.patched[1]
        )
    }
}

/// Result of scanning a code buffer.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub sites: Vec<SiteLayout>,
    /// Candidates that look like sites but fail verification.
    pub defects: Vec<AnnotationError>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    pub fn call_sites(&self) -> impl Iterator<Item = &SiteLayout> {
        self.sites.iter().filter(|site| site.kind == SiteKind::CallSite)
    }

    pub fn function_tags(&self) -> impl Iterator<Item = &SiteLayout> {
        self.sites.iter().filter(|site| site.kind == SiteKind::FunctionTag)
    }
}

/// Scanner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub width: PointerWidth,
    /// Report function tags as well as call sites.
    pub function_tags: bool,
    /// Report candidates that fail verification.
    pub defects: bool,
}

impl ScanConfig {
    pub fn new(width: PointerWidth) -> Self {
        Self {
            width,
            function_tags: true,
            defects: true,
        }
    }
}

/// Finds annotation signatures of one pointer width.
#[derive(Debug, Clone, Copy)]
pub struct SiteScanner {
    width: PointerWidth,
    config: ScanConfig,
}

impl SiteScanner {
    pub fn new(width: PointerWidth) -> Self {
        Self::with_config(ScanConfig::new(width))
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self {
            width: config.width,
            config,
        }
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    /// Scan `code`, loaded at address `base`, for every site.
    pub fn scan(&self, code: &[u8], base: u64) -> ScanReport {
        let mut report = ScanReport::default();
        let mut offset = 0;
        while offset + SKIP_LENGTH < code.len() {
            if !Signature::dead_code_prefix(self.width, &code[offset..]) {
                offset += 1;
                continue;
            }
            match self.verify_at(code, offset, base) {
                Ok(layout) => {
                    log::trace!("{:?} at {:#x}", layout.kind, base + offset as u64);
                    offset = layout.fallthrough;
                    if layout.kind == SiteKind::CallSite || self.config.function_tags {
                        report.sites.push(layout);
                    }
                }
                Err(err) => {
                    log::debug!("rejected candidate at {:#x}: {}", base + offset as u64, err);
                    if self.config.defects {
                        report.defects.push(err);
                    }
                    offset += 1;
                }
            }
        }
        log::debug!(
            "scanned {} bytes: {} sites, {} defects",
            code.len(),
            report.sites.len(),
            report.defects.len()
        );
        report
    }

    /// Verify that a complete site starts at `offset`.
    pub fn verify_at(&self, code: &[u8], offset: usize, base: u64) -> AnnotationResult<SiteLayout> {
        let bytes = code
            .get(offset..offset + SKIP_LENGTH)
            .ok_or_else(|| AnnotationError::malformed(offset, "truncated skip"))?;
        if bytes[0] != SKIP_OPCODE {
            return Err(AnnotationError::malformed(offset, "no short skip"));
        }
        let declared = bytes[1];

        let start = offset + SKIP_LENGTH;
        let register = match self.width {
            PointerWidth::Bits32 => Register::EAX,
            PointerWidth::Bits64 => Register::RAX,
        };

        let (load, got_field) = self.decode_reference(code, start, base, offset)?;
        if load.mnemonic() != Mnemonic::Mov || load.op0_register() != register {
            return Err(AnnotationError::malformed(offset, "GOT base load expected"));
        }

        let scan_start = start + load.len();
        let (scan, label_field) = self.decode_reference(code, scan_start, base, offset)?;
        let kind = match scan.mnemonic() {
            Mnemonic::Bsf => SiteKind::CallSite,
            Mnemonic::Bsr => SiteKind::FunctionTag,
            _ => return Err(AnnotationError::malformed(offset, "bsf or bsr expected")),
        };
        if scan.op0_register() != register {
            return Err(AnnotationError::malformed(offset, "label reference register"));
        }

        let actual = load.len() + scan.len();
        if declared as usize != actual {
            return Err(AnnotationError::SkipMismatch {
                offset,
                declared,
                actual,
            });
        }

        let first = self.decode_jump(code, start + actual, base, offset)?;
        let second = self.decode_jump(code, first.offset + first.length, base, offset)?;
        let fallthrough = second.offset + second.length;

        Ok(SiteLayout {
            kind,
            offset,
            skip_length: declared,
            register,
            got_field,
            got_displacement: read_i32(code, got_field),
            label_field,
            label_displacement: read_i32(code, label_field),
            jumps: [first, second],
            fallthrough,
        })
    }

    /// Decode one dead instruction and locate its 32-bit absolute displacement.
    fn decode_reference(
        &self,
        code: &[u8],
        start: usize,
        base: u64,
        site: usize,
    ) -> AnnotationResult<(Instruction, usize)> {
        let mut decoder = Decoder::with_ip(
            self.width.bitness(),
            &code[start..],
            base + start as u64,
            DecoderOptions::NONE,
        );
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(AnnotationError::malformed(site, "undecodable label reference"));
        }
        if instruction.op1_kind() != OpKind::Memory
            || instruction.memory_base() != Register::None
            || instruction.memory_index() != Register::None
        {
            return Err(AnnotationError::malformed(site, "absolute memory operand expected"));
        }
        let offsets = decoder.get_constant_offsets(&instruction);
        if !offsets.has_displacement() || offsets.displacement_size() != 4 {
            return Err(AnnotationError::malformed(site, "32-bit displacement expected"));
        }
        Ok((instruction, start + offsets.displacement_offset()))
    }

    fn decode_jump(
        &self,
        code: &[u8],
        start: usize,
        base: u64,
        site: usize,
    ) -> AnnotationResult<SiteJump> {
        let rest = code
            .get(start..)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| AnnotationError::malformed(site, "truncated before jumps"))?;
        let mut decoder =
            Decoder::with_ip(self.width.bitness(), rest, base + start as u64, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() || !instruction.is_jmp_short_or_near() {
            return Err(AnnotationError::malformed(site, "direct jump expected"));
        }
        Ok(SiteJump {
            offset: start,
            length: instruction.len(),
            target: instruction.near_branch_target(),
        })
    }
}

fn read_i32(code: &[u8], offset: usize) -> i32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&code[offset..offset + 4]);
    i32::from_le_bytes(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_bytes(width: PointerWidth, kind: SiteKind) -> Vec<u8> {
        let mut bytes = Signature::new(width, kind).fill(0x100, 0x200);
        bytes.extend_from_slice(&[0xEB, 0x04]); // jmp +4
        bytes.extend_from_slice(&[0xE9, 0x10, 0x00, 0x00, 0x00]); // jmp rel32
        bytes.extend_from_slice(&[0x90, 0x90, 0xC3]);
        bytes
    }

    #[test]
    fn test_verify_call_site_layout() {
        let code = site_bytes(PointerWidth::Bits64, SiteKind::CallSite);
        let layout = SiteScanner::new(PointerWidth::Bits64)
            .verify_at(&code, 0, 0x4000)
            .unwrap();
        assert_eq!(layout.kind, SiteKind::CallSite);
        assert_eq!(layout.skip_length, 0x11);
        assert_eq!(layout.register, Register::RAX);
        assert_eq!(layout.got_field, 6);
        assert_eq!(layout.got_displacement, 0x100);
        assert_eq!(layout.label_field, 15);
        assert_eq!(layout.label_displacement, 0x200);
        assert_eq!(layout.jumps[0].offset, 19);
        assert_eq!(layout.jumps[0].target, 0x4000 + 21 + 4);
        assert_eq!(layout.jumps[1].offset, 21);
        assert_eq!(layout.jumps[1].length, 5);
        assert_eq!(layout.fallthrough, 26);
    }

    #[test]
    fn test_verify_x86_function_tag() {
        let code = site_bytes(PointerWidth::Bits32, SiteKind::FunctionTag);
        let layout = SiteScanner::new(PointerWidth::Bits32)
            .verify_at(&code, 0, 0)
            .unwrap();
        assert_eq!(layout.kind, SiteKind::FunctionTag);
        assert_eq!(layout.skip_length, 0x0c);
        assert_eq!(layout.register, Register::EAX);
        assert_eq!(layout.got_field, 3);
        assert_eq!(layout.label_field, 10);
    }

    #[test]
    fn test_skip_mismatch_is_reported() {
        let mut code = site_bytes(PointerWidth::Bits64, SiteKind::CallSite);
        code[1] = 0x10;
        let report = SiteScanner::new(PointerWidth::Bits64).scan(&code, 0);
        assert!(report.sites.is_empty());
        assert!(matches!(
            report.defects.as_slice(),
            [AnnotationError::SkipMismatch {
                offset: 0,
                declared: 0x10,
                actual: 17
            }]
        ));
    }

    #[test]
    fn test_missing_jumps_is_malformed() {
        let mut code = Signature::new(PointerWidth::Bits64, SiteKind::CallSite).fill(0, 0);
        code.push(0xC3);
        let err = SiteScanner::new(PointerWidth::Bits64)
            .verify_at(&code, 0, 0)
            .unwrap_err();
        assert!(matches!(err, AnnotationError::MalformedSite { offset: 0, .. }));
    }

    #[test]
    fn test_scan_finds_consecutive_sites() {
        let mut code = vec![0x90];
        code.extend(site_bytes(PointerWidth::Bits64, SiteKind::FunctionTag));
        code.extend(site_bytes(PointerWidth::Bits64, SiteKind::CallSite));
        let report = SiteScanner::new(PointerWidth::Bits64).scan(&code, 0);
        assert!(report.is_clean());
        assert_eq!(report.function_tags().count(), 1);
        assert_eq!(report.call_sites().count(), 1);
        assert_eq!(report.sites[0].offset, 1);

        let mut config = ScanConfig::new(PointerWidth::Bits64);
        config.function_tags = false;
        let report = SiteScanner::with_config(config).scan(&code, 0);
        assert_eq!(report.sites.len(), 1);
        assert_eq!(report.sites[0].kind, SiteKind::CallSite);
    }

    #[test]
    fn test_redirect_patches() {
        let mut code = site_bytes(PointerWidth::Bits64, SiteKind::CallSite);
        let layout = SiteScanner::new(PointerWidth::Bits64)
            .verify_at(&code, 0, 0)
            .unwrap();
        let patch = layout.redirect_patch().unwrap();
        assert_eq!(patch.original, [0xEB, 0x11]);
        // 17 dead bytes, then 2 + 5 bytes of jumps
        assert_eq!(patch.patched, [0xEB, 24]);
        assert!(patch.is_atomic(0x1000));
        assert!(!patch.is_atomic(0x1001));
        patch.apply(&mut code).unwrap();
        assert_eq!(&code[..2], &[0xEB, 24]);
        assert!(patch.apply(&mut code).is_err());

        let code = site_bytes(PointerWidth::Bits64, SiteKind::FunctionTag);
        let layout = SiteScanner::new(PointerWidth::Bits64)
            .verify_at(&code, 0, 0)
            .unwrap();
        assert_eq!(layout.redirect_patch().unwrap().patched, [0xEB, 19]);
    }

    #[test]
    fn test_patch_at_end_of_address_space_is_rejected() {
        let patch = RedirectPatch {
            offset: usize::MAX,
            original: [0xEB, 0x11],
            patched: [0xEB, 24],
        };
        let mut code = vec![0xEB, 0x11];
        assert!(matches!(
            patch.apply(&mut code),
            Err(AnnotationError::MalformedSite { offset: usize::MAX, .. })
        ));
        assert!(!patch.is_atomic(0));
        assert_eq!(code, [0xEB, 0x11]);

        let mut layout = SiteScanner::new(PointerWidth::Bits64)
            .verify_at(&site_bytes(PointerWidth::Bits64, SiteKind::CallSite), 0, 0)
            .unwrap();
        layout.fallthrough = 0;
        assert!(layout.redirect_patch().is_err());
    }
}
