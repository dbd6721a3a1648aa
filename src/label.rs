// This module implements the label table: the one human-readable identity an instrumentation
// engine can recover from an annotation site. Every declared annotation owns exactly one
// static Label whose storage is a single C string pointer, so the GOT entry referenced by the
// site's dead `bsf/bsr label@GOT` instruction points at a `const char *` exactly like the C
// protocol expects. Labels are built in const context from `concat!` literals, checked for a
// trailing NUL and no interior NUL at compile time, and never mutated. The text format is
// "dynamorio-annotation:<name>", optionally "dynamorio-annotation:expression:<name>" or
// "...:statement:<name>" for engines that distinguish call-site kinds; parse_label and
// annotation_name recover the name by slicing off the fixed prefix.

//! Annotation label strings.

use std::ffi::{c_char, CStr};
use std::fmt;

/// Fixed prefix of every label.
pub const LABEL_PREFIX: &str = "dynamorio-annotation:";

const EXPRESSION_TAG: &str = "expression:";
const STATEMENT_TAG: &str = "statement:";

/// Call-site kind encoded in a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Plain,
    Expression,
    Statement,
}

impl LabelKind {
    fn tag(self) -> &'static str {
        match self {
            LabelKind::Plain => "",
            LabelKind::Expression => EXPRESSION_TAG,
            LabelKind::Statement => STATEMENT_TAG,
        }
    }
}

/// Static label storage: one pointer to a NUL-terminated string.
#[repr(C)]
pub struct Label {
    text: *const c_char,
}

// The pointee is a 'static string literal that is never written.
unsafe impl Sync for Label {}
unsafe impl Send for Label {}

impl Label {
    /// Build a label from a NUL-terminated literal.
    pub const fn new(text: &'static str) -> Self {
        let bytes = text.as_bytes();
        assert!(
            !bytes.is_empty() && bytes[bytes.len() - 1] == 0,
            "annotation label must be NUL-terminated"
        );
        let mut i = 0;
        while i < bytes.len() - 1 {
            assert!(bytes[i] != 0, "annotation label contains an interior NUL");
            i += 1;
        }
        Self {
            text: bytes.as_ptr().cast(),
        }
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.text
    }

    pub fn as_c_str(&self) -> &'static CStr {
        // SAFETY: `new` only accepts 'static NUL-terminated literals.
        unsafe { CStr::from_ptr(self.text) }
    }

    pub fn as_str(&self) -> &'static str {
        self.as_c_str().to_str().unwrap_or_default()
    }

    pub fn kind(&self) -> LabelKind {
        parse_label(self.as_str()).map_or(LabelKind::Plain, |(kind, _)| kind)
    }

    /// Name the label was declared with.
    pub fn annotation_name(&self) -> &'static str {
        annotation_name(self.as_str()).unwrap_or_default()
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Label").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format the label text for `name`.
pub fn format_label(kind: LabelKind, name: &str) -> String {
    format!("{LABEL_PREFIX}{}{name}", kind.tag())
}

/// Split a label into its kind and annotation name.
pub fn parse_label(text: &str) -> Option<(LabelKind, &str)> {
    let rest = text.strip_prefix(LABEL_PREFIX)?;
    let (kind, name) = if let Some(name) = rest.strip_prefix(EXPRESSION_TAG) {
        (LabelKind::Expression, name)
    } else if let Some(name) = rest.strip_prefix(STATEMENT_TAG) {
        (LabelKind::Statement, name)
    } else {
        (LabelKind::Plain, rest)
    };
    if name.is_empty() || name.contains(':') {
        return None;
    }
    Some((kind, name))
}

pub fn annotation_name(text: &str) -> Option<&str> {
    parse_label(text).map(|(_, name)| name)
}

/// NUL-terminated label literal for an annotation identifier.
#[doc(hidden)]
#[macro_export]
macro_rules! __dr_label_text {
    ($name:ident) => {
        ::core::concat!("dynamorio-annotation:", ::core::stringify!($name), "\0")
    };
}
