//! Text decoding for archive exports whose encoding is not declared.
//!
//! Candidates are tried in order against a probe chunk; the first that
//! accepts the probe and then the whole file wins. Lossy UTF-8 is the last
//! resort so a single odd byte never aborts a run.

use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Encoding {
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "windows-1252", alias = "cp1252")]
    Windows1252,
    #[serde(rename = "iso-8859-1", alias = "latin1", alias = "latin-1")]
    Latin1,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Windows1252 => "windows-1252",
            Encoding::Latin1 => "iso-8859-1",
        };
        f.write_str(name)
    }
}

/// Code points for 0x80..=0x9F in Windows-1252. Zero marks the five bytes
/// the code page leaves undefined.
const WINDOWS_1252_HIGH: [u32; 32] = [
    0x20AC, 0, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160, 0x2039,
    0x0152, 0, 0x017D, 0, 0, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014, 0x02DC,
    0x2122, 0x0161, 0x203A, 0x0153, 0, 0x017E, 0x0178,
];

impl Encoding {
    /// Strict decode of a complete buffer.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            Encoding::Windows1252 => bytes.iter().map(|&b| windows_1252_char(b)).collect(),
            Encoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Whether a leading chunk of a file is acceptable. A UTF-8 probe may
    /// end in the middle of a multi-byte sequence.
    fn accepts_probe(&self, probe: &[u8]) -> bool {
        match self {
            Encoding::Utf8 => match std::str::from_utf8(probe) {
                Ok(_) => true,
                Err(e) => e.error_len().is_none(),
            },
            Encoding::Windows1252 => probe.iter().all(|&b| windows_1252_char(b).is_some()),
            Encoding::Latin1 => true,
        }
    }
}

fn windows_1252_char(byte: u8) -> Option<char> {
    match byte {
        0x80..=0x9F => {
            let code = WINDOWS_1252_HIGH[(byte - 0x80) as usize];
            if code == 0 {
                None
            } else {
                char::from_u32(code)
            }
        }
        _ => Some(byte as char),
    }
}

#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    /// `None` when every candidate failed and lossy replacement was used.
    pub encoding: Option<Encoding>,
}

/// Decode `bytes` with the first candidate that accepts a `probe_bytes`
/// chunk and the full buffer.
pub fn decode_with_fallback(bytes: &[u8], candidates: &[Encoding], probe_bytes: usize) -> Decoded {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let probe = &bytes[..bytes.len().min(probe_bytes.max(1))];

    for encoding in candidates {
        if !encoding.accepts_probe(probe) {
            debug!("Probe rejected encoding {}", encoding);
            continue;
        }

        match encoding.decode(bytes) {
            Some(text) => {
                return Decoded {
                    text,
                    encoding: Some(*encoding),
                }
            }
            None => {
                debug!("Encoding {} accepted probe but failed on full content", encoding);
            }
        }
    }

    warn!(
        "No candidate encoding ({}) decoded the content, falling back to lossy UTF-8",
        candidates
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Decoded {
        text: String::from_utf8_lossy(bytes).into_owned(),
        encoding: None,
    }
}
