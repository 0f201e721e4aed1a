// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Streaming integrity digest over raw upload bytes
//!
//! [`DigestReader`] sits between a part body and the archive decoder. Every
//! byte the decoder pulls through it is folded into an MD5 state, so the
//! digest covers the archive exactly as it was transmitted.

use md5::{Digest, Md5};
use std::io::{self, Read};

/// Length of an integrity digest in bytes
pub const DIGEST_LEN: usize = 16;

/// Byte-source decorator hashing everything read through it
pub struct DigestReader<R> {
    inner: R,
    hasher: Md5,
    bytes_read: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            bytes_read: 0,
        }
    }

    /// Digest of all bytes read so far followed by `key`.
    ///
    /// The running state is left untouched, so calling this twice without
    /// reading in between gives the same result.
    pub fn checksum(&self, key: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = self.hasher.clone();
        hasher.update(key);
        hasher.finalize().into()
    }

    /// Number of bytes hashed so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read and hash everything left in the source
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// One-shot digest of a complete archive, as a card computes it before upload
pub fn integrity_digest(archive: &[u8], key: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Md5::new();
    hasher.update(archive);
    hasher.update(key);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_matches_one_shot_digest() {
        let data = b"archive bytes as sent".to_vec();
        let mut reader = DigestReader::new(Cursor::new(data.clone()));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(reader.bytes_read(), data.len() as u64);
        assert_eq!(reader.checksum(b"key"), integrity_digest(&data, b"key"));
    }

    #[test]
    fn test_only_read_bytes_are_hashed() {
        let mut reader = DigestReader::new(Cursor::new(b"0123456789".to_vec()));
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.checksum(b"k"), integrity_digest(b"0123", b"k"));
        assert_eq!(reader.drain().unwrap(), 6);
        assert_eq!(reader.checksum(b"k"), integrity_digest(b"0123456789", b"k"));
    }

    #[test]
    fn test_known_vector() {
        // MD5("abc")
        let reader = DigestReader::new(Cursor::new(Vec::new()));
        assert_eq!(
            hex::encode(reader.checksum(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    proptest! {
        #[test]
        fn prop_checksum_idempotent(data in proptest::collection::vec(any::<u8>(), 0..4096), key in proptest::collection::vec(any::<u8>(), 16)) {
            let mut reader = DigestReader::new(Cursor::new(data));
            reader.drain().unwrap();
            prop_assert_eq!(reader.checksum(&key), reader.checksum(&key));
        }

        #[test]
        fn prop_extra_byte_changes_digest(data in proptest::collection::vec(any::<u8>(), 1..4096), key in proptest::collection::vec(any::<u8>(), 16)) {
            let mut reader = DigestReader::new(Cursor::new(data.clone()));
            let mut head = vec![0u8; data.len() - 1];
            reader.read_exact(&mut head).unwrap();
            let before = reader.checksum(&key);
            let mut last = [0u8; 1];
            reader.read_exact(&mut last).unwrap();
            prop_assert_ne!(before, reader.checksum(&key));
        }
    }
}
