// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! SceyeFi Core Library
//!
//! Protocol implementation for Eye-Fi wireless SD cards: the SOAP control
//! calls that authenticate a card, and the multipart upload that carries a
//! tar archive of photos together with an integrity digest.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `params`, `charset`, `multipart`: streaming multipart decoding
//! - `archive`, `digest`: tar decoding with hashing of the raw bytes
//! - `crypto`, `card`, `session`: nonces, credentials and the control calls
//! - `soap`, `protocol`: message encoding
//! - `sink`, `upload`: the upload orchestrator and where files end up
//! - `config`, `metrics`, `retry`, `client`: service plumbing
//! - `error`: Unified error types
//!
//! Decoding is synchronous and forward-only; nothing buffers a whole upload.

pub mod archive;
pub mod card;
pub mod charset;
pub mod client;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod multipart;
pub mod params;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod sink;
pub mod soap;
pub mod upload;

pub use card::{CardDirectory, CardIdentity, MacAddress, StaticDirectory, UploadKey};
pub use error::{Error, Result};
pub use session::SessionService;
pub use sink::{DirectorySink, UploadHandle, UploadSink};
pub use upload::{UploadOutcome, UploadProcessor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TCP port cards connect to
pub const EYEFI_PORT: u16 = 59278;

/// Path of the control calls
pub const MAIN_CONTEXT: &str = "/api/soap/eyefilm/v1";

/// Path of UploadPhoto requests
pub const UPLOAD_CONTEXT: &str = "/api/soap/eyefilm/v1/upload";
