// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Character sets accepted in upload content types

use crate::{Error, Result};

/// Charset used to decode part headers and text parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// ISO-8859-1, the default when a request names none
    #[default]
    Latin1,
    /// US-ASCII (decoded as Latin-1, which is a superset)
    Ascii,
    /// UTF-8
    Utf8,
}

impl Charset {
    /// Resolve a charset label (case-insensitive)
    pub fn from_label(label: &str) -> Result<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "iso-8859-1" | "iso8859-1" | "latin1" | "l1" => Ok(Self::Latin1),
            "us-ascii" | "ascii" => Ok(Self::Ascii),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            _ => Err(Error::UnsupportedCharset(label.to_string())),
        }
    }

    /// Decode bytes into a string. Invalid UTF-8 is replaced, not rejected.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Latin1 | Self::Ascii => bytes.iter().map(|&b| b as char).collect(),
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Encode a string, failing on characters the charset cannot carry
    pub fn encode(&self, s: &str) -> Result<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(s.as_bytes().to_vec()),
            Self::Latin1 | Self::Ascii => {
                let limit = if *self == Self::Ascii { 0x7f } else { 0xff };
                s.chars()
                    .map(|c| {
                        u8::try_from(u32::from(c))
                            .ok()
                            .filter(|&b| u32::from(b) <= limit)
                            .ok_or_else(|| {
                                Error::Protocol(format!("Character {:?} not representable", c))
                            })
                    })
                    .collect()
            }
        }
    }
}
