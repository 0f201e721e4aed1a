// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Decoder and encoder for the tar archives wrapping uploaded photos
//!
//! An archive is a run of 512-byte header blocks, each followed by the entry
//! content padded to the block size, and terminated by two all-zero blocks.
//! The archive is embedded in a multipart part that may carry trailing bytes
//! after it, so the end is recognised from the zero blocks and never from
//! the end of the underlying stream.

use crate::{Error, Result};
use std::io::{self, Read, Write};

/// Size of a header block and of the content padding unit
pub const BLOCK_SIZE: usize = 512;

const NAME: std::ops::Range<usize> = 0..100;
const MODE: std::ops::Range<usize> = 100..108;
const UID: std::ops::Range<usize> = 108..116;
const GID: std::ops::Range<usize> = 116..124;
const SIZE: std::ops::Range<usize> = 124..136;
const MTIME: std::ops::Range<usize> = 136..148;
const CHECKSUM: std::ops::Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const MAGIC: std::ops::Range<usize> = 257..263;
const VERSION: std::ops::Range<usize> = 263..265;
const PREFIX: std::ops::Range<usize> = 345..500;

/// Kind of archive entry, from the header type flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    HardLink,
    Symlink,
    Directory,
    Other(u8),
}

impl EntryKind {
    fn from_flag(flag: u8) -> Self {
        match flag {
            b'0' | b'\0' | b'7' => Self::Regular,
            b'1' => Self::HardLink,
            b'2' => Self::Symlink,
            b'5' => Self::Directory,
            other => Self::Other(other),
        }
    }
}

/// Decoded header of one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub kind: EntryKind,
}

impl EntryHeader {
    fn parse(block: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let expected = parse_numeric(&block[CHECKSUM], "checksum")?;
        let (unsigned, signed) = header_checksums(block);
        if expected != unsigned && expected as i64 != signed {
            return Err(Error::StreamFormat(format!(
                "Archive header checksum mismatch: stored {}, computed {}",
                expected, unsigned
            )));
        }

        let mut name = field_str(&block[NAME]);
        if &block[MAGIC][..5] == b"ustar" {
            let prefix = field_str(&block[PREFIX]);
            if !prefix.is_empty() {
                name = format!("{}/{}", prefix, name);
            }
        }
        if name.is_empty() {
            return Err(Error::StreamFormat("Archive entry without a name".to_string()));
        }

        Ok(Self {
            name,
            size: parse_numeric(&block[SIZE], "size")?,
            mode: u32::try_from(parse_numeric(&block[MODE], "mode")?)
                .map_err(|_| Error::StreamFormat("Archive mode field out of range".to_string()))?,
            mtime: parse_numeric(&block[MTIME], "mtime")?,
            kind: EntryKind::from_flag(block[TYPEFLAG]),
        })
    }

    /// Content bytes that follow the header, padding included
    fn padded_size(&self) -> Result<u64> {
        let block = BLOCK_SIZE as u64;
        self.size
            .div_ceil(block)
            .checked_mul(block)
            .ok_or_else(|| Error::StreamFormat(format!("Archive entry size {} out of range", self.size)))
    }

    /// Final path component of the entry name
    pub fn file_name(&self) -> &str {
        self.name
            .trim_end_matches('/')
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.name)
    }
}

/// Unsigned and signed byte sums with the checksum field read as spaces
fn header_checksums(block: &[u8; BLOCK_SIZE]) -> (u64, i64) {
    block
        .iter()
        .enumerate()
        .fold((0u64, 0i64), |(u, s), (i, &b)| {
            let b = if CHECKSUM.contains(&i) { b' ' } else { b };
            (u + u64::from(b), s + i64::from(b as i8))
        })
}

/// Text of a NUL-terminated fixed-width field
fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Octal number padded with spaces/NULs, or GNU base-256 when the high bit is set
fn parse_numeric(field: &[u8], what: &str) -> Result<u64> {
    if field.first().map_or(false, |b| b & 0x80 != 0) {
        let mut value: u64 = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(u64::from(b)))
                .ok_or_else(|| Error::StreamFormat(format!("Archive {} field overflows", what)))?;
        }
        return Ok(value);
    }

    let text = field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| b != 0 && b != b' ');
    let mut value: u64 = 0;
    for &b in text {
        if !(b'0'..=b'7').contains(&b) {
            return Err(Error::StreamFormat(format!(
                "Invalid octal digit {:?} in archive {} field",
                b as char, what
            )));
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| Error::StreamFormat(format!("Archive {} field overflows", what)))?;
    }
    Ok(value)
}

/// Forward-only archive decoder
pub struct ArchiveReader<R> {
    inner: R,
    /// Unread content bytes of the current entry
    remaining: u64,
    /// Padding after the current entry's content
    padding: u64,
    finished: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            finished: false,
        }
    }

    /// Advance to the next entry, skipping what is left of the current one.
    ///
    /// Returns `None` after the end-of-archive marker.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_, R>>> {
        if self.finished {
            return Ok(None);
        }
        self.skip(self.remaining + self.padding)?;
        self.remaining = 0;
        self.padding = 0;

        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(&mut block)?;
        if is_zero_block(&block) {
            self.read_block(&mut block)?;
            if !is_zero_block(&block) {
                return Err(Error::StreamFormat(
                    "Archive zero block followed by data".to_string(),
                ));
            }
            self.finished = true;
            return Ok(None);
        }

        let header = EntryHeader::parse(&block)?;
        self.remaining = header.size;
        self.padding = header.padded_size()? - header.size;
        Ok(Some(ArchiveEntry {
            header,
            reader: self,
        }))
    }

    /// True once the end-of-archive marker has been read
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.inner.read_exact(block).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::StreamFormat(
                "Archive ended before the end-of-archive marker".to_string(),
            ),
            _ => Error::from(e),
        })
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let copied = io::copy(&mut self.inner.by_ref().take(n), &mut io::sink())?;
        if copied < n {
            return Err(Error::StreamFormat(
                "Archive ended inside entry content".to_string(),
            ));
        }
        Ok(())
    }

    fn read_content(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(Error::StreamFormat(
                "Archive ended inside entry content".to_string(),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// One archive entry; reading it yields exactly `header.size` bytes
pub struct ArchiveEntry<'a, R> {
    pub header: EntryHeader,
    reader: &'a mut ArchiveReader<R>,
}

impl<'a, R: Read> ArchiveEntry<'a, R> {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }
}

impl<'a, R: Read> Read for ArchiveEntry<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read_content(buf).map_err(Error::into_io)
    }
}

/// Encoder producing archives the reader accepts
pub struct ArchiveWriter<W> {
    inner: W,
    mtime: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, mtime: 0 }
    }

    /// Modification time stamped on subsequent entries
    pub fn set_mtime(&mut self, mtime: u64) {
        self.mtime = mtime;
    }

    /// Append a regular file entry
    pub fn append(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let block = self.header_block(name, data.len() as u64)?;
        self.inner.write_all(&block)?;
        self.inner.write_all(data)?;
        let pad = (BLOCK_SIZE - data.len() % BLOCK_SIZE) % BLOCK_SIZE;
        self.inner.write_all(&[0u8; BLOCK_SIZE][..pad])?;
        Ok(())
    }

    /// Write the end-of-archive marker and return the inner writer
    pub fn finish(mut self) -> Result<W> {
        self.inner.write_all(&[0u8; 2 * BLOCK_SIZE])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn header_block(&self, name: &str, size: u64) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(Error::Protocol("Archive entry name is empty".to_string()));
        }
        if bytes.len() <= NAME.len() {
            block[..bytes.len()].copy_from_slice(bytes);
        } else {
            let split = name
                .rmatch_indices('/')
                .map(|(i, _)| i)
                .find(|&i| i <= PREFIX.len() && bytes.len() - i - 1 <= NAME.len())
                .ok_or_else(|| {
                    Error::Protocol(format!("Archive entry name too long: {}", name))
                })?;
            block[NAME.start..NAME.start + bytes.len() - split - 1]
                .copy_from_slice(&bytes[split + 1..]);
            block[PREFIX.start..PREFIX.start + split].copy_from_slice(&bytes[..split]);
        }
        if size > 0o777_7777_7777 {
            return Err(Error::Protocol(format!("Archive entry too large: {}", size)));
        }

        write_octal(&mut block[MODE], 0o644);
        write_octal(&mut block[UID], 0);
        write_octal(&mut block[GID], 0);
        write_octal(&mut block[SIZE], size);
        write_octal(&mut block[MTIME], self.mtime);
        block[TYPEFLAG] = b'0';
        block[MAGIC].copy_from_slice(b"ustar\0");
        block[VERSION].copy_from_slice(b"00");

        let (sum, _) = header_checksums(&block);
        let checksum = format!("{:06o}\0 ", sum);
        block[CHECKSUM].copy_from_slice(checksum.as_bytes());
        Ok(block)
    }
}

/// Zero-padded octal terminated by NUL, filling the field
fn write_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let text = format!("{:0width$o}", value, width = width);
    let start = text.len() - width;
    field[..width].copy_from_slice(&text.as_bytes()[start..]);
    field[width] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new());
        for (name, data) in entries {
            writer.append(name, data).unwrap();
        }
        writer.finish().unwrap()
    }

    fn read_all(data: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut reader = ArchiveReader::new(Cursor::new(data));
        let mut out = Vec::new();
        while let Some(mut entry) = reader.next_entry()? {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            out.push((entry.name().to_string(), content));
        }
        Ok(out)
    }

    #[test]
    fn test_single_entry() {
        let data = build(&[("P1030007.JPG", b"jpeg bytes")]);
        assert_eq!(data.len(), 4 * BLOCK_SIZE);
        let entries = read_all(data).unwrap();
        assert_eq!(entries, vec![("P1030007.JPG".to_string(), b"jpeg bytes".to_vec())]);
    }

    #[test]
    fn test_trailing_bytes_are_left_unread() {
        let mut data = build(&[("a.jpg", &[1u8; 600])]);
        data.extend_from_slice(b"\r\n--boundary--\r\n");
        let mut reader = ArchiveReader::new(Cursor::new(data));
        let mut entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.size(), 600);
        let mut first = [0u8; 10];
        entry.read_exact(&mut first).unwrap();
        assert!(reader.next_entry().unwrap().is_none());
        assert!(reader.is_finished());
        assert!(reader.next_entry().unwrap().is_none());

        let mut rest = Vec::new();
        reader.into_inner().read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"\r\n--boundary--\r\n");
    }

    #[test]
    fn test_eof_before_end_marker() {
        let mut data = build(&[("a.jpg", b"abc")]);
        data.truncate(2 * BLOCK_SIZE);
        assert!(matches!(read_all(data), Err(Error::StreamFormat(_))));
    }

    #[test]
    fn test_truncated_content() {
        let mut data = build(&[("a.jpg", &[9u8; 1000])]);
        data.truncate(BLOCK_SIZE + 100);
        assert!(matches!(read_all(data), Err(Error::StreamFormat(_))));
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut data = build(&[("a.jpg", b"abc")]);
        data[0] = b'b';
        assert!(matches!(read_all(data), Err(Error::StreamFormat(_))));
    }

    #[test]
    fn test_invalid_size_field() {
        let mut writer = ArchiveWriter::new(Vec::new());
        let mut block = writer.header_block("a.jpg", 3).unwrap();
        block[SIZE.start] = b'9';
        block[CHECKSUM].copy_from_slice(b"        ");
        let (sum, _) = header_checksums(&block);
        block[CHECKSUM].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
        writer.inner.extend_from_slice(&block);
        let data = writer.finish().unwrap();
        assert!(matches!(read_all(data), Err(Error::StreamFormat(_))));
    }

    /// Header for `a.jpg` with `field` overwritten and the checksum recomputed
    fn header_with(range: std::ops::Range<usize>, field: &[u8]) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new());
        let mut block = writer.header_block("a.jpg", 3).unwrap();
        block[range].copy_from_slice(field);
        block[CHECKSUM].copy_from_slice(b"        ");
        let (sum, _) = header_checksums(&block);
        block[CHECKSUM].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
        writer.inner.extend_from_slice(&block);
        writer.finish().unwrap()
    }

    #[test]
    fn test_huge_base256_size_is_rejected() {
        let mut size = [0xffu8; 12];
        size[..4].copy_from_slice(&[0x80, 0, 0, 0]);
        let data = header_with(SIZE, &size);
        let mut reader = ArchiveReader::new(Cursor::new(data));
        assert!(matches!(reader.next_entry(), Err(Error::StreamFormat(_))));
    }

    #[test]
    fn test_mode_out_of_range_is_rejected() {
        let mut mode = [0u8; 8];
        mode[0] = 0x80;
        mode[3] = 0x01;
        let data = header_with(MODE, &mode);
        assert!(matches!(read_all(data), Err(Error::StreamFormat(_))));
    }

    #[test]
    fn test_zero_block_followed_by_data() {
        let mut data = vec![0u8; BLOCK_SIZE];
        data.extend(build(&[("a.jpg", b"abc")]));
        assert!(matches!(read_all(data), Err(Error::StreamFormat(_))));
    }

    #[test]
    fn test_long_name_uses_prefix() {
        let dir = "d".repeat(120);
        let name = format!("{}/photo.jpg", dir);
        let entries = read_all(build(&[(&name, b"x")])).unwrap();
        assert_eq!(entries[0].0, name);
    }

    #[test]
    fn test_header_fields() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.set_mtime(1_269_760);
        writer.append("dir/IMG_0001.JPG", b"data").unwrap();
        let data = writer.finish().unwrap();
        let mut reader = ArchiveReader::new(Cursor::new(data));
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.header.mtime, 1_269_760);
        assert_eq!(entry.header.mode, 0o644);
        assert_eq!(entry.header.kind, EntryKind::Regular);
        assert_eq!(entry.header.file_name(), "IMG_0001.JPG");
    }

    #[test]
    fn test_base256_size() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[11] = 0x02;
        field[10] = 0x01;
        assert_eq!(parse_numeric(&field, "size").unwrap(), 258);
    }

    proptest! {
        #[test]
        fn prop_round_trip(contents in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..1500), 0..6)) {
            let names: Vec<String> = (0..contents.len()).map(|i| format!("IMG_{:04}.JPG", i)).collect();
            let entries: Vec<(&str, &[u8])> = names.iter().map(String::as_str).zip(contents.iter().map(Vec::as_slice)).collect();
            let decoded = read_all(build(&entries)).unwrap();
            prop_assert_eq!(decoded.len(), contents.len());
            for ((name, data), (expected_name, expected)) in decoded.iter().zip(names.iter().zip(contents.iter())) {
                prop_assert_eq!(name, expected_name);
                prop_assert_eq!(data, expected);
            }
        }
    }
}
