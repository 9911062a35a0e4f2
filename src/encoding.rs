use std::fmt;
use std::path::Path;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE, WINDOWS_1252};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingSource {
    Bom,
    Detector,
    AssumedUtf8,
}

impl fmt::Display for EncodingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EncodingSource::Bom => "bom",
            EncodingSource::Detector => "detector",
            EncodingSource::AssumedUtf8 => "assumed-utf8",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct EncodingDecision {
    pub encoding: &'static Encoding,
    pub source: EncodingSource,
}

#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub had_errors: bool,
    pub decision: EncodingDecision,
}

/// Decodes a template the way a text editor would open it: BOM first, then
/// strict UTF-8, then a statistical guess.
pub fn decode_text(bytes: &[u8]) -> DecodedText {
    let decision = detect_auto(bytes);
    let (cow, had_errors) = decision.encoding.decode_with_bom_removal(bytes);
    DecodedText {
        text: cow.into_owned(),
        had_errors,
        decision,
    }
}

/// UTF-8 bytes for `text`, prefixed with a byte-order mark when requested.
pub fn encode_utf8(text: &str, with_bom: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + UTF8_BOM.len());
    if with_bom {
        out.extend_from_slice(&UTF8_BOM);
    }
    out.extend_from_slice(text.as_bytes());
    out
}

/// True when a file name needs the unicode-aware code paths: it holds a
/// character outside 7-bit ASCII, or the caller forces unicode handling.
pub fn needs_unicode(name: &str, force_unicode: bool) -> bool {
    force_unicode || !name.is_ascii()
}

/// True when `text` survives an encode/decode trip through Windows-1252,
/// the codepage the external tool sees file names through on Windows.
pub fn fits_legacy_codepage(text: &str) -> bool {
    let (encoded, _, had_errors) = WINDOWS_1252.encode(text);
    if had_errors {
        return false;
    }
    let (decoded, _) = WINDOWS_1252.decode_without_bom_handling(&encoded);
    decoded == text
}

pub fn path_fits_legacy_codepage(path: &Path) -> bool {
    match path.to_str() {
        Some(text) => fits_legacy_codepage(text),
        None => false,
    }
}

fn detect_auto(bytes: &[u8]) -> EncodingDecision {
    if let Some(encoding) = detect_bom(bytes) {
        return EncodingDecision {
            encoding,
            source: EncodingSource::Bom,
        };
    }

    if std::str::from_utf8(bytes).is_ok() {
        return EncodingDecision {
            encoding: UTF_8,
            source: EncodingSource::AssumedUtf8,
        };
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);

    EncodingDecision {
        encoding,
        source: EncodingSource::Detector,
    }
}

fn detect_bom(bytes: &[u8]) -> Option<&'static Encoding> {
    if bytes.starts_with(&UTF8_BOM) {
        return Some(UTF_8);
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return Some(UTF_16LE);
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Some(UTF_16BE);
    }

    None
}
