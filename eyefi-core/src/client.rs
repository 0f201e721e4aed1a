// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! HTTP client speaking the card side of the protocol
//!
//! Used by the card emulator to exercise a server end to end. The client
//! checks the server's StartSession credential before trusting its nonce.

use crate::archive::ArchiveWriter;
use crate::card::CardIdentity;
use crate::config::CardClientConfig;
use crate::crypto::{self, Nonce};
use crate::digest::integrity_digest;
use crate::multipart::MultipartWriter;
use crate::protocol::{
    ControlRequest, ControlResponse, GetPhotoStatusRequest, GetPhotoStatusResponse,
    StartSessionRequest, StartSessionResponse, UploadPhotoRequest, UploadPhotoResponse,
    ARCHIVE_FIELD, DIGEST_FIELD, ENVELOPE_FIELD,
};
use crate::retry::RetryPolicy;
use crate::soap;
use crate::{Error, Result, MAIN_CONTEXT, UPLOAD_CONTEXT};
use parking_lot::Mutex;
use reqwest::{Client, ClientBuilder, StatusCode};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// A file to upload: name inside the archive plus its content
#[derive(Debug, Clone)]
pub struct PhotoFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Card-side protocol client
pub struct CardClient {
    client: Client,
    base_url: Url,
    card: CardIdentity,
    retry_policy: RetryPolicy,
    server_nonce: Mutex<Option<Nonce>>,
}

impl CardClient {
    pub fn new(base_url: Url, card: CardIdentity, timeout: Duration, retry_policy: RetryPolicy) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .tcp_keepalive(Duration::from_secs(60))
            .use_rustls_tls()
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            base_url,
            card,
            retry_policy,
            server_nonce: Mutex::new(None),
        })
    }

    pub fn from_config(config: &CardClientConfig) -> Result<Self> {
        let card = config.validate()?;
        let base_url = Url::parse(&config.server_url)
            .map_err(|e| Error::Config(format!("Invalid server_url: {}", e)))?;
        let retry_policy = RetryPolicy::new(
            config.max_retries.saturating_add(1),
            Duration::from_millis(config.initial_backoff_ms),
        );
        Self::new(base_url, card, config.timeout(), retry_policy)
    }

    pub fn card(&self) -> &CardIdentity {
        &self.card
    }

    /// Open a session with a fresh client nonce
    pub async fn start_session(&self, transfer_mode: &str, timestamp: &str) -> Result<StartSessionResponse> {
        self.start_session_with(Nonce::generate(), transfer_mode, timestamp).await
    }

    /// Open a session with the given client nonce
    #[instrument(skip(self, cnonce), fields(mac = %self.card.mac))]
    pub async fn start_session_with(
        &self,
        cnonce: Nonce,
        transfer_mode: &str,
        timestamp: &str,
    ) -> Result<StartSessionResponse> {
        let request = ControlRequest::StartSession(StartSessionRequest {
            mac_address: self.card.mac,
            cnonce,
            transfer_mode: transfer_mode.to_string(),
            transfer_mode_timestamp: timestamp.to_string(),
        });

        let response = match self.control(&request).await? {
            ControlResponse::StartSession(resp) => resp,
            other => return Err(unexpected(&other)),
        };

        let expected = crypto::server_credential(
            self.card.mac.as_bytes(),
            &cnonce,
            self.card.upload_key.as_bytes(),
        );
        let supplied = crypto::decode_hex(&response.credential).unwrap_or_default();
        if !bool::from(supplied.as_slice().ct_eq(&expected[..])) {
            warn!("Server credential does not match our upload key");
            return Err(Error::Authentication);
        }

        *self.server_nonce.lock() = Some(response.snonce);
        info!(snonce = %response.snonce.to_hex(), "Session established");
        Ok(response)
    }

    /// Announce a file and obtain its id; requires a started session
    #[instrument(skip(self), fields(mac = %self.card.mac))]
    pub async fn get_photo_status(&self, file_name: &str, file_size: u64) -> Result<GetPhotoStatusResponse> {
        let snonce = (*self.server_nonce.lock())
            .ok_or_else(|| Error::Protocol("No session: call StartSession first".to_string()))?;
        let credential = crypto::card_credential(
            self.card.mac.as_bytes(),
            self.card.upload_key.as_bytes(),
            &snonce,
        );

        let request = ControlRequest::GetPhotoStatus(GetPhotoStatusRequest {
            mac_address: self.card.mac,
            credential: crypto::encode_hex(&credential),
            file_name: Some(file_name.to_string()),
            file_size: Some(file_size),
            file_signature: None,
        });
        match self.control(&request).await? {
            ControlResponse::GetPhotoStatus(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn mark_last_photo_in_roll(&self) -> Result<()> {
        match self.control(&ControlRequest::MarkLastPhotoInRoll).await? {
            ControlResponse::MarkLastPhotoInRoll => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Pack `files` into an archive named `archive_name` and upload it.
    ///
    /// Returns the server's success flag.
    #[instrument(skip(self, files), fields(mac = %self.card.mac, files = files.len()))]
    pub async fn upload_photo(&self, archive_name: &str, file_id: u64, files: &[PhotoFile]) -> Result<bool> {
        let mut archive = ArchiveWriter::new(Vec::new());
        for file in files {
            archive.append(&file.name, &file.data)?;
        }
        let archive = archive.finish()?;
        let digest = integrity_digest(&archive, self.card.upload_key.as_bytes());

        let envelope = UploadPhotoRequest {
            mac_address: Some(self.card.mac.to_string()),
            file_name: Some(archive_name.to_string()),
            file_id: Some(file_id),
            file_size: Some(archive.len() as u64),
            file_signature: None,
            encryption: Some("none".to_string()),
            flags: Some("4".to_string()),
        }
        .to_soap()?;

        let mut body = MultipartWriter::with_random_boundary();
        body.form_field(ENVELOPE_FIELD, None, "text/xml", envelope.as_bytes())
            .form_field(ARCHIVE_FIELD, Some(archive_name), "application/x-tar", &archive)
            .form_field(
                DIGEST_FIELD,
                None,
                "text/plain",
                crypto::encode_hex(&digest).as_bytes(),
            );
        let content_type = body.content_type();
        let body = body.finish();

        let url = self.endpoint(UPLOAD_CONTEXT)?;
        debug!(bytes = body.len(), "Uploading archive");
        let text = self
            .retry_policy
            .execute(|| self.post(url.clone(), &content_type, "urn:UploadPhoto", body.clone()))
            .await?;

        let response = UploadPhotoResponse::from_soap(&soap::parse_envelope(&text)?)?;
        info!(success = response.success, "Upload answered");
        Ok(response.success)
    }

    async fn control(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let xml = request.to_soap()?;
        let url = self.endpoint(MAIN_CONTEXT)?;
        let action = format!("urn:{}", request.action());
        let text = self
            .retry_policy
            .execute(|| self.post(url.clone(), "text/xml; charset=\"utf-8\"", &action, xml.clone().into_bytes()))
            .await?;
        ControlResponse::from_soap(&soap::parse_envelope(&text)?)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn post(&self, url: Url, content_type: &str, soap_action: &str, body: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("SOAPAction", format!("\"{}\"", soap_action))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!("Request to {} failed: {}", url, e);
                Error::Network(e)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(Error::Network)?;
        if !status.is_success() {
            warn!("HTTP error {}: {}", status, text);
            return Err(status_error(status, text));
        }
        Ok(text)
    }
}

/// Map an HTTP error status back to the error the server reported
fn status_error(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::FORBIDDEN => Error::Authentication,
        StatusCode::NOT_FOUND => Error::CardNotFound(body),
        StatusCode::REQUEST_TIMEOUT => Error::Timeout,
        _ => Error::Protocol(format!("HTTP {}: {}", status, body)),
    }
}

fn unexpected(response: &ControlResponse) -> Error {
    Error::Protocol(format!("Unexpected response {}", response.action()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{MacAddress, UploadKey};
    use mockito::Matcher;

    const KEY: [u8; 16] = [0xAA; 16];

    fn card() -> CardIdentity {
        let mac: MacAddress = "001122334455".parse().unwrap();
        CardIdentity::new(mac, UploadKey::new(KEY.to_vec()))
    }

    fn client(url: &str) -> CardClient {
        CardClient::new(
            Url::parse(url).unwrap(),
            card(),
            Duration::from_secs(5),
            RetryPolicy::none(),
        )
        .unwrap()
    }

    fn session_reply(cnonce: &Nonce, snonce: &Nonce, key: &[u8]) -> String {
        let credential = crypto::server_credential(card().mac.as_bytes(), cnonce, key);
        ControlResponse::StartSession(StartSessionResponse {
            credential: crypto::encode_hex(&credential),
            snonce: *snonce,
            transfer_mode: "2".to_string(),
            transfer_mode_timestamp: "1230268824".to_string(),
            upsync_allowed: false,
        })
        .to_soap()
        .unwrap()
    }

    #[tokio::test]
    async fn test_session_then_status() {
        let mut server = mockito::Server::new_async().await;
        let cnonce = Nonce::from_bytes([3; 16]);
        let snonce = Nonce::from_bytes([9; 16]);

        let session = server
            .mock("POST", MAIN_CONTEXT)
            .match_body(Matcher::Regex("StartSession".to_string()))
            .with_status(200)
            .with_header("content-type", "text/xml")
            .with_body(session_reply(&cnonce, &snonce, &KEY))
            .create_async()
            .await;

        let expected = crypto::card_credential(card().mac.as_bytes(), &KEY, &snonce);
        let status = server
            .mock("POST", MAIN_CONTEXT)
            .match_body(Matcher::Regex(crypto::encode_hex(&expected)))
            .with_status(200)
            .with_body(
                ControlResponse::GetPhotoStatus(GetPhotoStatusResponse { file_id: 7, offset: 0 })
                    .to_soap()
                    .unwrap(),
            )
            .create_async()
            .await;

        let client = client(&server.url());
        let resp = client.start_session_with(cnonce, "2", "1230268824").await.unwrap();
        assert_eq!(resp.snonce, snonce);
        let status_resp = client.get_photo_status("P1.JPG.tar", 10240).await.unwrap();
        assert_eq!(status_resp.file_id, 7);

        session.assert_async().await;
        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejects_server_with_wrong_key() {
        let mut server = mockito::Server::new_async().await;
        let cnonce = Nonce::from_bytes([3; 16]);
        let _mock = server
            .mock("POST", MAIN_CONTEXT)
            .with_status(200)
            .with_body(session_reply(&cnonce, &Nonce::from_bytes([9; 16]), &[0u8; 16]))
            .create_async()
            .await;

        let client = client(&server.url());
        let result = client.start_session_with(cnonce, "2", "0").await;
        assert!(matches!(result, Err(Error::Authentication)));
        assert!(matches!(
            client.get_photo_status("x", 1).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_reports_success_flag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", UPLOAD_CONTEXT)
            .match_header("content-type", Matcher::Regex("^multipart/form-data; boundary=".to_string()))
            .match_body(Matcher::Regex("INTEGRITYDIGEST".to_string()))
            .with_status(200)
            .with_body(UploadPhotoResponse { success: true }.to_soap().unwrap())
            .create_async()
            .await;

        let client = client(&server.url());
        let files = [PhotoFile {
            name: "P1.JPG".to_string(),
            data: b"jpeg".to_vec(),
        }];
        assert!(client.upload_photo("P1.JPG.tar", 1, &files).await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", MAIN_CONTEXT)
            .with_status(404)
            .with_body("001122334455")
            .create_async()
            .await;

        let client = client(&server.url());
        assert!(matches!(
            client.mark_last_photo_in_roll().await,
            Err(Error::CardNotFound(_))
        ));
    }
}
