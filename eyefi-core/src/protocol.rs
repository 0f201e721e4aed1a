// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Protocol messages exchanged with cards
//!
//! Each control message maps to a flat SOAP action (see [`crate::soap`]).
//! Requests are decoded on the server and encoded by the card client;
//! responses the other way round.

use crate::card::MacAddress;
use crate::crypto::Nonce;
use crate::soap::{self, SoapMessage, REQUEST_NS, RESPONSE_NS};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Multipart field names of an UploadPhoto request, in protocol order
pub const ENVELOPE_FIELD: &str = "SOAPENVELOPE";
pub const ARCHIVE_FIELD: &str = "FILENAME";
pub const DIGEST_FIELD: &str = "INTEGRITYDIGEST";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionRequest {
    pub mac_address: MacAddress,
    pub cnonce: Nonce,
    pub transfer_mode: String,
    pub transfer_mode_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionResponse {
    /// Hex MD5 proving the server knows the card's upload key
    pub credential: String,
    pub snonce: Nonce,
    pub transfer_mode: String,
    pub transfer_mode_timestamp: String,
    pub upsync_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPhotoStatusRequest {
    pub mac_address: MacAddress,
    /// Hex MD5 proving the card knows its upload key
    pub credential: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetPhotoStatusResponse {
    pub file_id: u64,
    pub offset: u64,
}

/// A control call, dispatched on the SOAP body action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    StartSession(StartSessionRequest),
    GetPhotoStatus(GetPhotoStatusRequest),
    MarkLastPhotoInRoll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    StartSession(StartSessionResponse),
    GetPhotoStatus(GetPhotoStatusResponse),
    MarkLastPhotoInRoll,
}

fn parse_mac(msg: &SoapMessage) -> Result<MacAddress> {
    msg.required("macaddress")?.parse()
}

fn parse_optional_u64(msg: &SoapMessage, name: &str) -> Result<Option<u64>> {
    msg.field(name)
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("<{}> is not a number: {:?}", name, v)))
        })
        .transpose()
}

impl ControlRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::StartSession(_) => "StartSession",
            Self::GetPhotoStatus(_) => "GetPhotoStatus",
            Self::MarkLastPhotoInRoll => "MarkLastPhotoInRoll",
        }
    }

    pub fn from_soap(msg: &SoapMessage) -> Result<Self> {
        match msg.action.as_str() {
            "StartSession" => Ok(Self::StartSession(StartSessionRequest {
                mac_address: parse_mac(msg)?,
                cnonce: Nonce::from_hex(msg.required("cnonce")?)?,
                transfer_mode: msg.field("transfermode").unwrap_or_default().to_string(),
                transfer_mode_timestamp: msg
                    .field("transfermodetimestamp")
                    .unwrap_or_default()
                    .to_string(),
            })),
            "GetPhotoStatus" => Ok(Self::GetPhotoStatus(GetPhotoStatusRequest {
                mac_address: parse_mac(msg)?,
                credential: msg.required("credential")?.trim().to_string(),
                file_name: msg.field("filename").map(str::to_string),
                file_size: parse_optional_u64(msg, "filesize")?,
                file_signature: msg.field("filesignature").map(str::to_string),
            })),
            "MarkLastPhotoInRoll" => Ok(Self::MarkLastPhotoInRoll),
            other => Err(Error::Protocol(format!("Invalid action: {}", other))),
        }
    }

    /// Encode as the card sends it
    pub fn to_soap(&self) -> Result<String> {
        match self {
            Self::StartSession(req) => {
                let mac = req.mac_address.to_string();
                let cnonce = req.cnonce.to_hex();
                soap::write_envelope(
                    REQUEST_NS,
                    self.action(),
                    &[
                        ("macaddress", mac.as_str()),
                        ("cnonce", cnonce.as_str()),
                        ("transfermode", req.transfer_mode.as_str()),
                        ("transfermodetimestamp", req.transfer_mode_timestamp.as_str()),
                    ],
                )
            }
            Self::GetPhotoStatus(req) => {
                let mac = req.mac_address.to_string();
                let size = req.file_size.map(|s| s.to_string());
                let mut fields = vec![
                    ("credential", req.credential.as_str()),
                    ("macaddress", mac.as_str()),
                ];
                if let Some(name) = &req.file_name {
                    fields.push(("filename", name.as_str()));
                }
                if let Some(size) = &size {
                    fields.push(("filesize", size.as_str()));
                }
                if let Some(sig) = &req.file_signature {
                    fields.push(("filesignature", sig.as_str()));
                }
                soap::write_envelope(REQUEST_NS, self.action(), &fields)
            }
            Self::MarkLastPhotoInRoll => {
                soap::write_envelope(REQUEST_NS, self.action(), &[])
            }
        }
    }
}

impl ControlResponse {
    pub fn action(&self) -> &'static str {
        match self {
            Self::StartSession(_) => "StartSessionResponse",
            Self::GetPhotoStatus(_) => "GetPhotoStatusResponse",
            Self::MarkLastPhotoInRoll => "MarkLastPhotoInRollResponse",
        }
    }

    /// Encode as the server returns it
    pub fn to_soap(&self) -> Result<String> {
        match self {
            Self::StartSession(resp) => {
                let snonce = resp.snonce.to_hex();
                soap::write_envelope(
                    RESPONSE_NS,
                    self.action(),
                    &[
                        ("credential", resp.credential.as_str()),
                        ("snonce", snonce.as_str()),
                        ("transfermode", resp.transfer_mode.as_str()),
                        ("transfermodetimestamp", resp.transfer_mode_timestamp.as_str()),
                        ("upsyncallowed", if resp.upsync_allowed { "true" } else { "false" }),
                    ],
                )
            }
            Self::GetPhotoStatus(resp) => {
                let file_id = resp.file_id.to_string();
                let offset = resp.offset.to_string();
                soap::write_envelope(
                    RESPONSE_NS,
                    self.action(),
                    &[("fileid", file_id.as_str()), ("offset", offset.as_str())],
                )
            }
            Self::MarkLastPhotoInRoll => soap::write_envelope(RESPONSE_NS, self.action(), &[]),
        }
    }

    pub fn from_soap(msg: &SoapMessage) -> Result<Self> {
        match msg.action.as_str() {
            "StartSessionResponse" => Ok(Self::StartSession(StartSessionResponse {
                credential: msg.required("credential")?.trim().to_string(),
                snonce: Nonce::from_hex(msg.required("snonce")?)?,
                transfer_mode: msg.field("transfermode").unwrap_or_default().to_string(),
                transfer_mode_timestamp: msg
                    .field("transfermodetimestamp")
                    .unwrap_or_default()
                    .to_string(),
                upsync_allowed: msg.field("upsyncallowed").map_or(false, |v| v.trim() == "true"),
            })),
            "GetPhotoStatusResponse" => Ok(Self::GetPhotoStatus(GetPhotoStatusResponse {
                file_id: parse_optional_u64(msg, "fileid")?
                    .ok_or_else(|| Error::Protocol("Missing <fileid>".to_string()))?,
                offset: parse_optional_u64(msg, "offset")?.unwrap_or(0),
            })),
            "MarkLastPhotoInRollResponse" => Ok(Self::MarkLastPhotoInRoll),
            other => Err(Error::Protocol(format!("Unexpected response: {}", other))),
        }
    }
}

/// Identity data carried by the SOAPENVELOPE part of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPhotoRequest {
    /// Raw MAC text; resolving it is the orchestrator's job
    pub mac_address: Option<String>,
    pub file_name: Option<String>,
    pub file_id: Option<u64>,
    pub file_size: Option<u64>,
    pub file_signature: Option<String>,
    pub encryption: Option<String>,
    pub flags: Option<String>,
}

impl UploadPhotoRequest {
    pub const ACTION: &'static str = "UploadPhoto";

    pub fn from_soap(msg: &SoapMessage) -> Result<Self> {
        if msg.action != Self::ACTION {
            return Err(Error::Protocol(format!(
                "Expected {} envelope, found {}",
                Self::ACTION,
                msg.action
            )));
        }
        Ok(Self {
            mac_address: msg.field("macaddress").map(|s| s.trim().to_string()),
            file_name: msg.field("filename").map(|s| s.trim().to_string()),
            file_id: parse_optional_u64(msg, "fileid")?,
            file_size: parse_optional_u64(msg, "filesize")?,
            file_signature: msg.field("filesignature").map(str::to_string),
            encryption: msg.field("encryption").map(str::to_string),
            flags: msg.field("flags").map(str::to_string),
        })
    }

    pub fn to_soap(&self) -> Result<String> {
        let file_id = self.file_id.map(|v| v.to_string());
        let file_size = self.file_size.map(|v| v.to_string());
        let optional = [
            ("fileid", file_id.as_deref()),
            ("macaddress", self.mac_address.as_deref()),
            ("filename", self.file_name.as_deref()),
            ("filesize", file_size.as_deref()),
            ("filesignature", self.file_signature.as_deref()),
            ("encryption", self.encryption.as_deref()),
            ("flags", self.flags.as_deref()),
        ];
        let fields: Vec<(&str, &str)> = optional
            .iter()
            .filter_map(|(name, value)| value.map(|v| (*name, v)))
            .collect();
        soap::write_envelope(REQUEST_NS, Self::ACTION, &fields)
    }
}

/// Reply to an upload; the card only looks at `success`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPhotoResponse {
    pub success: bool,
}

impl UploadPhotoResponse {
    pub const ACTION: &'static str = "UploadPhotoResponse";

    pub fn to_soap(&self) -> Result<String> {
        soap::write_envelope(
            RESPONSE_NS,
            Self::ACTION,
            &[("success", if self.success { "true" } else { "false" })],
        )
    }

    pub fn from_soap(msg: &SoapMessage) -> Result<Self> {
        if msg.action != Self::ACTION {
            return Err(Error::Protocol(format!("Unexpected response: {}", msg.action)));
        }
        Ok(Self {
            success: msg.field("success").map_or(false, |v| v.trim() == "true"),
        })
    }
}

/// Health status for system monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Server status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Overall health status
    pub status: HealthStatus,

    /// When the server process started
    pub started_at: DateTime<Utc>,

    /// Service uptime in seconds
    pub uptime_seconds: u64,

    /// Number of registered cards
    pub cards_registered: usize,

    /// Upload workers busy right now
    pub uploads_in_progress: usize,

    /// Size of the upload worker pool
    pub upload_workers: usize,

    pub sessions_started: u64,
    pub authentication_failures: u64,
    pub uploads_committed: u64,
    pub uploads_aborted: u64,
    pub uploads_failed: u64,
    pub files_stored: u64,
    pub bytes_received: u64,

    /// Any warnings or issues
    pub warnings: Vec<String>,
}
