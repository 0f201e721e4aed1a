// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! UploadPhoto orchestration
//!
//! An upload is a multipart body with three parts in a fixed order:
//!
//! 1. `SOAPENVELOPE`: who is uploading and the archive name
//! 2. `FILENAME`: a tar archive holding the photo (and sometimes a log)
//! 3. `INTEGRITYDIGEST`: hex MD5 over the archive bytes and the upload key
//!
//! The archive is decoded and handed to the sink while it is hashed, in a
//! single pass. The sink handle is committed only if every file reached it
//! and the digest matched; otherwise it is aborted.
//!
//! Protocol-level failures (unknown card, digest mismatch, parts out of
//! order) end in `success = false`. Broken framing is returned as an error.

use crate::archive::{ArchiveReader, EntryKind};
use crate::card::{CardDirectory, CardIdentity, MacAddress};
use crate::charset::Charset;
use crate::crypto;
use crate::digest::{DigestReader, DIGEST_LEN};
use crate::multipart::{MultipartReader, Part};
use crate::params::HeaderValue;
use crate::protocol::{UploadPhotoRequest, UploadPhotoResponse, ARCHIVE_FIELD, DIGEST_FIELD, ENVELOPE_FIELD};
use crate::sink::{UploadHandle, UploadSink};
use crate::soap;
use crate::{Error, Result};
use std::io::Read;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Largest SOAP envelope part accepted
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Largest integrity digest part accepted
pub const MAX_DIGEST_PART_BYTES: usize = 1024;

/// Default cap on how much of an unknown part is logged
pub const DEFAULT_MAX_LOGGED_PART_BYTES: usize = 1024;

/// Protocol role of a part, from its form field name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartRole {
    Envelope,
    Archive,
    Integrity,
    Unknown,
}

impl PartRole {
    pub fn from_field_name(name: Option<&str>) -> Self {
        match name {
            Some(ENVELOPE_FIELD) => Self::Envelope,
            Some(ARCHIVE_FIELD) => Self::Archive,
            Some(DIGEST_FIELD) => Self::Integrity,
            _ => Self::Unknown,
        }
    }
}

/// Position in the envelope, archive, digest sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingEnvelope,
    AwaitingArchive,
    AwaitingDigest,
    Done,
}

impl Stage {
    fn expected(self) -> Option<PartRole> {
        match self {
            Self::AwaitingEnvelope => Some(PartRole::Envelope),
            Self::AwaitingArchive => Some(PartRole::Archive),
            Self::AwaitingDigest => Some(PartRole::Integrity),
            Self::Done => None,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::AwaitingEnvelope => Self::AwaitingArchive,
            Self::AwaitingArchive => Self::AwaitingDigest,
            Self::AwaitingDigest | Self::Done => Self::Done,
        }
    }
}

/// Result of one upload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub transaction_id: Uuid,
    pub success: bool,
    /// `Some(true)` if the sink handle was committed, `Some(false)` if it
    /// was aborted, `None` if no handle was obtained
    pub committed: Option<bool>,
    /// Files handed to the sink
    pub files: u64,
    /// Raw archive part bytes received
    pub archive_bytes: u64,
    /// First reason the upload failed
    pub failure: Option<String>,
}

impl UploadOutcome {
    pub fn response(&self) -> UploadPhotoResponse {
        UploadPhotoResponse {
            success: self.success,
        }
    }
}

/// Worker-local state of one upload
struct Transaction {
    id: Uuid,
    card: Option<CardIdentity>,
    handle: Option<Box<dyn UploadHandle>>,
    calculated: Option<[u8; DIGEST_LEN]>,
    verified: bool,
    failure: Option<String>,
    files: u64,
    archive_bytes: u64,
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            card: None,
            handle: None,
            calculated: None,
            verified: false,
            failure: None,
            files: 0,
            archive_bytes: 0,
        }
    }

    fn fail(&mut self, error: &Error) {
        warn!("Upload failed: {}", error);
        if self.failure.is_none() {
            self.failure = Some(error.to_string());
        }
    }

    fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Commit or abort the handle and report
    fn finish(mut self) -> UploadOutcome {
        let mut success = self.verified && !self.failed();
        let committed = match self.handle.take() {
            Some(handle) if success => match handle.commit() {
                Ok(()) => Some(true),
                Err(e) => {
                    self.fail(&e);
                    success = false;
                    Some(false)
                }
            },
            Some(handle) => {
                if let Err(e) = handle.abort() {
                    warn!("Abort failed: {}", e);
                }
                Some(false)
            }
            None => None,
        };

        info!(success, files = self.files, bytes = self.archive_bytes, "Upload finished");
        UploadOutcome {
            transaction_id: self.id,
            success,
            committed,
            files: self.files,
            archive_bytes: self.archive_bytes,
            failure: self.failure,
        }
    }

    /// Abort after a transport failure
    fn abandon(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.abort() {
                warn!("Abort failed: {}", e);
            }
        }
    }
}

/// Errors that mean the stream itself can no longer be trusted
fn is_fatal(error: &Error) -> bool {
    matches!(error, Error::StreamFormat(_) | Error::Timeout | Error::Io(_))
}

/// Drives UploadPhoto requests from the wire to an [`UploadSink`]
pub struct UploadProcessor<D: ?Sized, S: ?Sized> {
    directory: Arc<D>,
    sink: Arc<S>,
    max_logged_part_bytes: usize,
}

impl<D, S> UploadProcessor<D, S>
where
    D: CardDirectory + ?Sized,
    S: UploadSink + ?Sized,
{
    pub fn new(directory: Arc<D>, sink: Arc<S>) -> Self {
        Self {
            directory,
            sink,
            max_logged_part_bytes: DEFAULT_MAX_LOGGED_PART_BYTES,
        }
    }

    pub fn with_max_logged_part_bytes(mut self, limit: usize) -> Self {
        self.max_logged_part_bytes = limit;
        self
    }

    /// Process a raw request body given its `Content-Type` header
    pub fn process_request<R: Read>(&self, content_type: &str, body: R) -> Result<UploadOutcome> {
        let value = HeaderValue::parse(content_type);
        if !value.token.to_ascii_lowercase().starts_with("multipart/") {
            return Err(Error::Protocol(format!(
                "Expected multipart content, got {:?}",
                value.token
            )));
        }
        let boundary = value
            .param("boundary")
            .ok_or_else(|| Error::Protocol("Content type has no boundary".to_string()))?;
        let charset = match value.param("charset") {
            Some(label) => Charset::from_label(label)?,
            None => Charset::default(),
        };

        let parts = MultipartReader::new(body, &charset.encode(boundary)?, charset)?;
        self.process(parts)
    }

    /// Consume every part of an upload.
    ///
    /// The sink handle, if one was obtained, is committed or aborted before
    /// this returns, whether it returns an outcome or an error.
    pub fn process<R: Read>(&self, mut parts: MultipartReader<R>) -> Result<UploadOutcome> {
        let mut tx = Transaction::new();
        let span = info_span!("upload", transaction = %tx.id);
        let _guard = span.enter();

        match self.run(&mut tx, &mut parts) {
            Ok(()) => Ok(tx.finish()),
            Err(e) => {
                warn!("Upload stream failed: {}", e);
                tx.abandon();
                Err(e)
            }
        }
    }

    fn run<R: Read>(&self, tx: &mut Transaction, parts: &mut MultipartReader<R>) -> Result<()> {
        let mut stage = Stage::AwaitingEnvelope;

        while let Some(mut part) = parts.next_part()? {
            let field = part.field_name();
            let role = PartRole::from_field_name(field.as_deref());

            if role == PartRole::Unknown {
                self.log_unknown(field.as_deref(), &mut part)?;
                continue;
            }
            if stage.expected() != Some(role) {
                tx.fail(&Error::Protocol(format!(
                    "Unexpected {:?} part while {:?}",
                    role, stage
                )));
                continue;
            }

            match role {
                PartRole::Envelope => self.handle_envelope(tx, &mut part)?,
                PartRole::Archive => self.handle_archive(tx, part)?,
                PartRole::Integrity => self.handle_digest(tx, &mut part)?,
                PartRole::Unknown => {}
            }
            stage = stage.next();
        }

        if stage != Stage::Done {
            tx.fail(&Error::Protocol(format!("Upload ended while {:?}", stage)));
        }
        Ok(())
    }

    fn handle_envelope<R: Read>(&self, tx: &mut Transaction, part: &mut Part<'_, R>) -> Result<()> {
        let body = match part.read_to_vec(MAX_ENVELOPE_BYTES) {
            Ok(body) => body,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                tx.fail(&e);
                return Ok(());
            }
        };
        let xml = part.charset().decode(&body);

        let request = match soap::parse_envelope(&xml).and_then(|msg| UploadPhotoRequest::from_soap(&msg)) {
            Ok(request) => request,
            Err(e) => {
                tx.fail(&e);
                return Ok(());
            }
        };

        let (mac, archive_name) = match (request.mac_address, request.file_name) {
            (Some(mac), Some(name)) => (mac, name),
            _ => {
                tx.fail(&Error::Protocol(
                    "UploadPhoto envelope needs macaddress and filename".to_string(),
                ));
                return Ok(());
            }
        };

        let card = match mac.parse::<MacAddress>() {
            Ok(mac) => self.directory.find_card(&mac),
            Err(e) => {
                tx.fail(&e);
                return Ok(());
            }
        };
        let Some(card) = card else {
            tx.fail(&Error::CardNotFound(mac));
            return Ok(());
        };

        info!(mac = %card.mac, archive = %archive_name, file_id = ?request.file_id, "Upload started");
        match self.sink.start_upload(&card, &archive_name) {
            Ok(handle) => tx.handle = Some(handle),
            Err(e) => tx.fail(&e),
        }
        tx.card = Some(card);
        Ok(())
    }

    fn handle_archive<R: Read>(&self, tx: &mut Transaction, part: Part<'_, R>) -> Result<()> {
        let mut digest = DigestReader::new(part);
        let mut archive = ArchiveReader::new(&mut digest);

        while let Some(mut entry) = archive.next_entry()? {
            if entry.header.kind != EntryKind::Regular {
                debug!(name = entry.name(), kind = ?entry.header.kind, "Skipping archive entry");
                continue;
            }
            if tx.failed() {
                continue;
            }
            let Some(handle) = tx.handle.as_mut() else {
                continue;
            };
            let name = entry.name().to_string();
            match handle.handle_file(&name, &mut entry) {
                Ok(bytes) => {
                    tx.files += 1;
                    debug!(file = %name, bytes, "File received");
                }
                Err(e) if matches!(e, Error::StreamFormat(_) | Error::Timeout) => return Err(e),
                Err(e) => tx.fail(&e),
            }
        }

        // Trailing bytes after the end marker still belong to the part
        let trailing = digest.drain()?;
        if trailing > 0 {
            debug!(trailing, "Bytes after end of archive");
        }
        tx.archive_bytes = digest.bytes_read();

        if let Some(card) = &tx.card {
            tx.calculated = Some(digest.checksum(card.upload_key.as_bytes()));
        }
        Ok(())
    }

    fn handle_digest<R: Read>(&self, tx: &mut Transaction, part: &mut Part<'_, R>) -> Result<()> {
        let body = match part.read_to_vec(MAX_DIGEST_PART_BYTES) {
            Ok(body) => body,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                tx.fail(&e);
                return Ok(());
            }
        };
        let text = part.charset().decode(&body);
        let asserted = text.lines().next().unwrap_or_default().trim();

        let Some(calculated) = tx.calculated else {
            debug!("No digest to compare against");
            return Ok(());
        };

        let matches = crypto::decode_hex(asserted)
            .map(|bytes| bool::from(bytes.as_slice().ct_eq(&calculated[..])))
            .unwrap_or(false);
        if matches {
            tx.verified = true;
        } else {
            tx.fail(&Error::IntegrityMismatch {
                expected: asserted.to_string(),
                actual: crypto::encode_hex(&calculated),
            });
        }
        Ok(())
    }

    fn log_unknown<R: Read>(&self, field: Option<&str>, part: &mut Part<'_, R>) -> Result<()> {
        let mut head = Vec::new();
        part.by_ref()
            .take(self.max_logged_part_bytes as u64)
            .read_to_end(&mut head)?;
        debug!(
            field = field.unwrap_or("<unnamed>"),
            content = %part.charset().decode(&head),
            "Ignoring unknown part"
        );
        Ok(())
    }
}
