// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Card identities and the directory they are looked up in

use crate::crypto::decode_hex;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Hardware address of a card
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    /// Accepts `001122334455` as sent by cards, and the `:`/`-` separated forms
    fn from_str(s: &str) -> Result<Self> {
        let compact: String = s.trim().chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = decode_hex(&compact)
            .map_err(|_| Error::Protocol(format!("Invalid MAC address: {:?}", s)))?;
        let bytes: [u8; 6] = bytes
            .try_into()
            .map_err(|_| Error::Protocol(format!("Invalid MAC address length: {:?}", s)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

/// Secret shared between a card and the server
#[derive(Clone, PartialEq, Eq)]
pub struct UploadKey(Vec<u8>);

impl UploadKey {
    /// Expected key length for Eye-Fi cards
    pub const LEN: usize = 16;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = decode_hex(s).map_err(|_| Error::Config("Upload key is not valid hex".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadKey(<{} bytes redacted>)", self.0.len())
    }
}

/// A registered card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardIdentity {
    pub mac: MacAddress,
    pub upload_key: UploadKey,
    /// Folder for this card's photos; the sink default applies when unset
    pub upload_dir: Option<PathBuf>,
}

impl CardIdentity {
    pub fn new(mac: MacAddress, upload_key: UploadKey) -> Self {
        Self {
            mac,
            upload_key,
            upload_dir: None,
        }
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }
}

/// Lookup of cards by hardware address
pub trait CardDirectory: Send + Sync {
    fn find_card(&self, mac: &MacAddress) -> Option<CardIdentity>;
}

/// Read-only in-memory directory, filled at startup
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    cards: HashMap<MacAddress, CardIdentity>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a card, rejecting duplicates
    pub fn insert(&mut self, card: CardIdentity) -> Result<()> {
        if self.cards.contains_key(&card.mac) {
            return Err(Error::Config(format!("Duplicate card {}", card.mac)));
        }
        self.cards.insert(card.mac, card);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

impl FromIterator<CardIdentity> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = CardIdentity>>(iter: I) -> Self {
        Self {
            cards: iter.into_iter().map(|c| (c.mac, c)).collect(),
        }
    }
}

impl CardDirectory for StaticDirectory {
    fn find_card(&self, mac: &MacAddress) -> Option<CardIdentity> {
        self.cards.get(mac).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parsing() {
        let mac: MacAddress = "001122AABBCC".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);
        assert_eq!(mac.to_string(), "001122aabbcc");
        assert_eq!("00:11:22:aa:bb:cc".parse::<MacAddress>().unwrap(), mac);
        assert_eq!("00-11-22-AA-BB-CC".parse::<MacAddress>().unwrap(), mac);
        assert!("0011".parse::<MacAddress>().is_err());
        assert!("00112233445g".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_directory_lookup() {
        let mac: MacAddress = "001122334455".parse().unwrap();
        let mut dir = StaticDirectory::new();
        dir.insert(CardIdentity::new(mac, UploadKey::new(vec![0xAA; 16]))).unwrap();
        assert!(dir.insert(CardIdentity::new(mac, UploadKey::new(vec![0; 16]))).is_err());

        let card = dir.find_card(&mac).unwrap();
        assert_eq!(card.upload_key.as_bytes(), &[0xAA; 16]);
        assert!(dir.find_card(&"665544332211".parse().unwrap()).is_none());
    }

    #[test]
    fn test_upload_key_debug_is_redacted() {
        let key = UploadKey::from_hex("aabbccddeeff00112233445566778899").unwrap();
        assert_eq!(format!("{:?}", key), "UploadKey(<16 bytes redacted>)");
        assert!(UploadKey::from_hex("xyz").is_err());
    }
}
