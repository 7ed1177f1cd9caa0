//! Byte pattern scanning
//!
//! Patterns are written in the usual disassembler notation, two hex digits
//! per byte and `??` (or `?`) for a wildcard:
//!
//! ```text
//! 48 8B 05 ?? ?? ?? ?? 48 8B 0C C8
//! ```
//!
//! A pattern can carry a capture: instead of the match address, the scan then
//! yields the value stored at `match + offset`, optionally interpreted as an
//! instruction-relative displacement.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::layout::PatternSpec;

/// Errors produced while parsing a pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// Pattern text contained no bytes
    #[error("Pattern is empty")]
    Empty,

    /// A token was neither a hex byte nor a wildcard
    #[error("Invalid pattern token '{token}' at position {position}")]
    InvalidToken {
        /// Offending token
        token: String,
        /// Token position (0-based)
        position: usize,
    },

    /// Capture width other than 4 or 8
    #[error("Invalid capture width {0}. Must be 4 or 8")]
    CaptureWidth(usize),
}

/// One pattern element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternByte {
    /// Must equal this byte
    Exact(u8),
    /// Matches any byte
    Any,
}

impl PatternByte {
    #[inline]
    fn matches(self, byte: u8) -> bool {
        match self {
            PatternByte::Exact(b) => b == byte,
            PatternByte::Any => true,
        }
    }
}

/// What to read at a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    /// Offset of the captured field from the match start
    pub offset: isize,
    /// Width of the field in bytes (4 or 8)
    pub width: usize,
    /// Result is `field_address + width + displacement`
    pub relative: bool,
}

/// A byte pattern with wildcards and an optional capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<PatternByte>,
    capture: Option<Capture>,
}

impl Pattern {
    /// Build a pattern from raw elements
    pub fn new(bytes: Vec<PatternByte>) -> Result<Self, PatternError> {
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self {
            bytes,
            capture: None,
        })
    }

    /// Parse whitespace-separated hex bytes and `??` wildcards
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let bytes = text
            .split_whitespace()
            .enumerate()
            .map(|(position, token)| match token {
                "?" | "??" => Ok(PatternByte::Any),
                _ if token.len() == 2 => u8::from_str_radix(token, 16)
                    .map(PatternByte::Exact)
                    .map_err(|_| PatternError::InvalidToken {
                        token: token.to_string(),
                        position,
                    }),
                _ => Err(PatternError::InvalidToken {
                    token: token.to_string(),
                    position,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(bytes)
    }

    /// Attach a capture
    pub fn with_capture(
        mut self,
        offset: isize,
        width: usize,
        relative: bool,
    ) -> Result<Self, PatternError> {
        if width != 4 && width != 8 {
            return Err(PatternError::CaptureWidth(width));
        }
        self.capture = Some(Capture {
            offset,
            width,
            relative,
        });
        Ok(self)
    }

    /// Pattern elements
    pub fn bytes(&self) -> &[PatternByte] {
        &self.bytes
    }

    /// Capture, if any
    pub fn capture(&self) -> Option<Capture> {
        self.capture
    }

    /// Number of bytes a match spans
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; empty patterns are rejected on construction
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(window)
            .all(|(p, &b)| p.matches(b))
    }
}

/// Offset of the first match of `pattern` in `haystack`
pub fn find(haystack: &[u8], pattern: &Pattern) -> Option<usize> {
    if haystack.len() < pattern.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .position(|window| pattern.matches_at(window))
}

/// Scan a buffer that is mapped at `base` in the host's address space
///
/// Returns the match address, or the captured value when the pattern has a
/// capture. A capture that falls outside the buffer yields `None`.
pub fn scan_slice(haystack: &[u8], base: usize, pattern: &Pattern) -> Option<usize> {
    let offset = find(haystack, pattern)?;
    let Some(capture) = pattern.capture else {
        return Some(base.wrapping_add(offset));
    };

    let field = offset as isize + capture.offset;
    let field = usize::try_from(field).ok()?;
    let Some(raw) = haystack.get(field..field + capture.width) else {
        log::warn!(
            "capture at +{} (width {}) lies outside the scanned range",
            field,
            capture.width
        );
        return None;
    };

    let value = match capture.width {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(raw);
            i32::from_le_bytes(buf) as isize as usize
        }
        _ => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            u64::from_le_bytes(buf) as usize
        }
    };

    if capture.relative {
        Some(
            base.wrapping_add(field)
                .wrapping_add(capture.width)
                .wrapping_add(value),
        )
    } else {
        Some(value)
    }
}

/// Scan live process memory
///
/// # Safety
/// `start..start + len` must be readable for the whole call.
pub unsafe fn scan(start: usize, len: usize, pattern: &Pattern) -> Option<usize> {
    if start == 0 || len == 0 {
        return None;
    }
    let haystack = std::slice::from_raw_parts(start as *const u8, len);
    scan_slice(haystack, start, pattern)
}

/// Resolve every named pattern of a profile against one buffer
pub fn resolve_patterns(
    haystack: &[u8],
    base: usize,
    specs: &BTreeMap<String, PatternSpec>,
) -> Result<BTreeMap<String, Option<usize>>, PatternError> {
    let mut results = BTreeMap::new();
    for (name, spec) in specs {
        let pattern = spec.compile()?;
        let found = scan_slice(haystack, base, &pattern);
        match found {
            Some(addr) => log::debug!("pattern '{}' resolved to {:#x}", name, addr),
            None => log::debug!("pattern '{}' not found", name),
        }
        results.insert(name.clone(), found);
    }
    Ok(results)
}
