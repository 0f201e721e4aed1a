// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Destination for uploaded files
//!
//! The orchestrator talks to an [`UploadSink`] only: one `start_upload` per
//! request, then `handle_file` per archive entry, and finally exactly one
//! of `commit` or `abort` on the handle.

use crate::card::CardIdentity;
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Storage backend that receives uploads
pub trait UploadSink: Send + Sync {
    fn start_upload(&self, card: &CardIdentity, archive_name: &str) -> Result<Box<dyn UploadHandle>>;
}

/// One in-flight upload
pub trait UploadHandle: Send {
    /// Store one file, returning the number of bytes consumed from `content`
    fn handle_file(&mut self, name: &str, content: &mut dyn Read) -> Result<u64>;

    /// Make every handled file durable
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every handled file
    fn abort(self: Box<Self>) -> Result<()>;
}

const STAGING_PREFIX: &str = ".eyefi-staging-";

/// Reduce an archive path to a bare file name
///
/// Both separators are honoured since cards are not consistent about them.
pub fn safe_file_name(name: &str) -> Result<&str> {
    let last = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    match last {
        "" | "." | ".." => Err(Error::Sink(format!("Unusable file name: {:?}", name))),
        _ => Ok(last),
    }
}

/// Stores uploads as plain files under a per-card folder
#[derive(Debug, Clone)]
pub struct DirectorySink {
    default_dir: PathBuf,
}

impl DirectorySink {
    /// `default_dir` is used for cards without their own folder
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
        }
    }

    pub fn target_dir<'a>(&'a self, card: &'a CardIdentity) -> &'a Path {
        card.upload_dir.as_deref().unwrap_or(&self.default_dir)
    }
}

impl UploadSink for DirectorySink {
    fn start_upload(&self, card: &CardIdentity, archive_name: &str) -> Result<Box<dyn UploadHandle>> {
        let target = self.target_dir(card).to_path_buf();
        fs::create_dir_all(&target)
            .map_err(|e| Error::Sink(format!("Cannot create {}: {}", target.display(), e)))?;

        let staging = target.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        fs::create_dir(&staging)
            .map_err(|e| Error::Sink(format!("Cannot create {}: {}", staging.display(), e)))?;

        debug!(mac = %card.mac, archive = archive_name, staging = %staging.display(), "Upload staged");
        Ok(Box::new(DirectoryHandle {
            staging,
            target,
            files: Vec::new(),
            finished: false,
        }))
    }
}

struct DirectoryHandle {
    staging: PathBuf,
    target: PathBuf,
    files: Vec<String>,
    finished: bool,
}

impl DirectoryHandle {
    fn discard(&mut self) -> io::Result<()> {
        self.finished = true;
        match fs::remove_dir_all(&self.staging) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl UploadHandle for DirectoryHandle {
    fn handle_file(&mut self, name: &str, content: &mut dyn Read) -> Result<u64> {
        let file_name = safe_file_name(name)?;
        let path = self.staging.join(file_name);

        let file = File::create(&path)
            .map_err(|e| Error::Sink(format!("Cannot create {}: {}", path.display(), e)))?;
        let mut out = BufWriter::new(file);
        let written = io::copy(content, &mut out)?;
        out.flush()?;

        if !self.files.iter().any(|f| f == file_name) {
            self.files.push(file_name.to_string());
        }
        debug!(file = file_name, bytes = written, "File staged");
        Ok(written)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        for name in &self.files {
            let dest = self.target.join(name);
            fs::rename(self.staging.join(name), &dest)
                .map_err(|e| Error::Sink(format!("Cannot store {}: {}", dest.display(), e)))?;
            info!(path = %dest.display(), "Stored");
        }
        self.discard()?;
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        debug!(files = self.files.len(), "Discarding staged upload");
        self.discard()?;
        Ok(())
    }
}

impl Drop for DirectoryHandle {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.discard() {
                warn!(staging = %self.staging.display(), "Failed to clean up staging: {}", e);
            }
        }
    }
}
