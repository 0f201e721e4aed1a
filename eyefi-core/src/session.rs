// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Control-call state machine
//!
//! Cards run `StartSession`, then `GetPhotoStatus` before each upload, and
//! `MarkLastPhotoInRoll` at the end of a batch. Nothing is remembered between
//! calls: every `GetPhotoStatus` re-derives the expected credential from the
//! directory and the server nonce.

use crate::card::{CardDirectory, CardIdentity, MacAddress};
use crate::crypto::{self, Nonce};
use crate::protocol::{
    ControlRequest, ControlResponse, GetPhotoStatusRequest, GetPhotoStatusResponse,
    StartSessionRequest, StartSessionResponse,
};
use crate::soap;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

/// Answers control calls for the cards in a directory
pub struct SessionService<D> {
    directory: Arc<D>,
    server_nonce: Nonce,
    next_file_id: AtomicU64,
}

impl<D: CardDirectory> SessionService<D> {
    /// Create a service with a fresh server nonce
    pub fn new(directory: Arc<D>) -> Self {
        Self::with_nonce(directory, Nonce::generate())
    }

    /// Create a service with a fixed server nonce
    pub fn with_nonce(directory: Arc<D>, server_nonce: Nonce) -> Self {
        Self {
            directory,
            server_nonce,
            next_file_id: AtomicU64::new(1),
        }
    }

    pub fn server_nonce(&self) -> &Nonce {
        &self.server_nonce
    }

    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    fn lookup(&self, mac: &MacAddress) -> Result<CardIdentity> {
        self.directory
            .find_card(mac)
            .ok_or_else(|| Error::CardNotFound(mac.to_string()))
    }

    /// Prove knowledge of the card's key and hand out the server nonce
    #[instrument(skip(self, request), fields(mac = %request.mac_address))]
    pub fn start_session(&self, request: &StartSessionRequest) -> Result<StartSessionResponse> {
        let card = self.lookup(&request.mac_address)?;
        let credential = crypto::server_credential(
            card.mac.as_bytes(),
            &request.cnonce,
            card.upload_key.as_bytes(),
        );

        info!(transfer_mode = %request.transfer_mode, "Session started");
        Ok(StartSessionResponse {
            credential: crypto::encode_hex(&credential),
            snonce: self.server_nonce,
            transfer_mode: request.transfer_mode.clone(),
            transfer_mode_timestamp: request.transfer_mode_timestamp.clone(),
            upsync_allowed: false,
        })
    }

    /// Verify the card's credential and allocate a file id
    #[instrument(skip(self, request), fields(mac = %request.mac_address))]
    pub fn get_photo_status(&self, request: &GetPhotoStatusRequest) -> Result<GetPhotoStatusResponse> {
        let card = self.lookup(&request.mac_address)?;
        let expected = crypto::card_credential(
            card.mac.as_bytes(),
            card.upload_key.as_bytes(),
            &self.server_nonce,
        );

        // Undecodable credentials are rejected like wrong ones
        let supplied = crypto::decode_hex(&request.credential).unwrap_or_default();
        if !bool::from(supplied.as_slice().ct_eq(&expected[..])) {
            warn!("Credential mismatch");
            return Err(Error::Authentication);
        }

        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        debug!(file_id, file_name = ?request.file_name, "Photo status");
        Ok(GetPhotoStatusResponse { file_id, offset: 0 })
    }

    pub fn mark_last_photo_in_roll(&self) {
        debug!("Last photo in roll");
    }

    /// Dispatch a typed control request
    pub fn handle(&self, request: &ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::StartSession(req) => self.start_session(req).map(ControlResponse::StartSession),
            ControlRequest::GetPhotoStatus(req) => {
                self.get_photo_status(req).map(ControlResponse::GetPhotoStatus)
            }
            ControlRequest::MarkLastPhotoInRoll => {
                self.mark_last_photo_in_roll();
                Ok(ControlResponse::MarkLastPhotoInRoll)
            }
        }
    }

    /// Decode a SOAP control body, answer it, and encode the reply
    pub fn handle_control(&self, xml: &str) -> Result<String> {
        let request = ControlRequest::from_soap(&soap::parse_envelope(xml)?)?;
        self.handle(&request)?.to_soap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{StaticDirectory, UploadKey};
    use proptest::prelude::*;

    const MAC: &str = "001122334455";

    fn service() -> SessionService<StaticDirectory> {
        let mac: MacAddress = MAC.parse().unwrap();
        let directory: StaticDirectory =
            std::iter::once(CardIdentity::new(mac, UploadKey::new(vec![0xAA; 16]))).collect();
        SessionService::with_nonce(Arc::new(directory), Nonce::from_bytes([0x42; 16]))
    }

    fn status_request(credential: String) -> GetPhotoStatusRequest {
        GetPhotoStatusRequest {
            mac_address: MAC.parse().unwrap(),
            credential,
            file_name: None,
            file_size: None,
            file_signature: None,
        }
    }

    fn valid_credential(service: &SessionService<StaticDirectory>) -> String {
        let mac: MacAddress = MAC.parse().unwrap();
        crypto::encode_hex(&crypto::card_credential(mac.as_bytes(), &[0xAA; 16], service.server_nonce()))
    }

    #[test]
    fn test_start_session() {
        let service = service();
        let resp = service
            .start_session(&StartSessionRequest {
                mac_address: MAC.parse().unwrap(),
                cnonce: Nonce::from_bytes([0; 16]),
                transfer_mode: "2".to_string(),
                transfer_mode_timestamp: "1230268824".to_string(),
            })
            .unwrap();

        let mac = crypto::decode_hex(MAC).unwrap();
        let expected = crypto::md5_concat(&[&mac, &[0u8; 16], &[0xAA; 16]]);
        assert_eq!(resp.credential, crypto::encode_hex(&expected));
        assert_eq!(resp.snonce, *service.server_nonce());
        assert_eq!(resp.transfer_mode, "2");
        assert_eq!(resp.transfer_mode_timestamp, "1230268824");
        assert!(!resp.upsync_allowed);
    }

    #[test]
    fn test_unknown_card() {
        let service = service();
        let req = StartSessionRequest {
            mac_address: "665544332211".parse().unwrap(),
            cnonce: Nonce::from_bytes([0; 16]),
            transfer_mode: String::new(),
            transfer_mode_timestamp: String::new(),
        };
        assert!(matches!(service.start_session(&req), Err(Error::CardNotFound(_))));
    }

    #[test]
    fn test_file_ids_increase() {
        let service = service();
        let credential = valid_credential(&service);
        assert_eq!(service.get_photo_status(&status_request(credential.clone())).unwrap().file_id, 1);
        let second = service.get_photo_status(&status_request(credential)).unwrap();
        assert_eq!(second.file_id, 2);
        assert_eq!(second.offset, 0);
    }

    #[test]
    fn test_wrong_credential_has_no_side_effect() {
        let service = service();
        let result = service.get_photo_status(&status_request("00".repeat(16)));
        assert!(matches!(result, Err(Error::Authentication)));
        assert!(matches!(
            service.get_photo_status(&status_request("not hex".to_string())),
            Err(Error::Authentication)
        ));

        let credential = valid_credential(&service);
        assert_eq!(service.get_photo_status(&status_request(credential)).unwrap().file_id, 1);
    }

    #[test]
    fn test_truncated_credential_rejected() {
        let service = service();
        let credential = valid_credential(&service);
        for len in [0, 2, 30] {
            assert!(matches!(
                service.get_photo_status(&status_request(credential[..len].to_string())),
                Err(Error::Authentication)
            ));
        }
        let extended = format!("{}00", credential);
        assert!(matches!(
            service.get_photo_status(&status_request(extended)),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_credential_case_insensitive() {
        let service = service();
        let credential = valid_credential(&service).to_uppercase();
        assert!(service.get_photo_status(&status_request(credential)).is_ok());
    }

    #[test]
    fn test_handle_control_xml() {
        let service = service();
        let xml = soap::write_envelope(soap::REQUEST_NS, "MarkLastPhotoInRoll", &[]).unwrap();
        let reply = service.handle_control(&xml).unwrap();
        assert!(reply.contains("MarkLastPhotoInRollResponse"));

        let bad = soap::write_envelope(soap::REQUEST_NS, "EraseCard", &[]).unwrap();
        assert!(matches!(service.handle_control(&bad), Err(Error::Protocol(_))));
    }

    proptest! {
        #[test]
        fn prop_any_bit_flip_rejects(byte in 0usize..16, bit in 0u8..8) {
            let service = service();
            let mac: MacAddress = MAC.parse().unwrap();
            let mut credential = crypto::card_credential(mac.as_bytes(), &[0xAA; 16], service.server_nonce());
            credential[byte] ^= 1 << bit;
            let result = service.get_photo_status(&status_request(crypto::encode_hex(&credential)));
            prop_assert!(matches!(result, Err(Error::Authentication)));
        }
    }
}
