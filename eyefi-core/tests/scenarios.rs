// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! End-to-end protocol scenarios through the public API

use eyefi_core::archive::ArchiveWriter;
use eyefi_core::crypto::{self, Nonce};
use eyefi_core::digest::integrity_digest;
use eyefi_core::multipart::MultipartWriter;
use eyefi_core::protocol::{
    ControlRequest, ControlResponse, GetPhotoStatusRequest, StartSessionRequest, UploadPhotoRequest,
};
use eyefi_core::soap;
use eyefi_core::{
    CardIdentity, DirectorySink, Error, MacAddress, Result, SessionService, StaticDirectory,
    UploadHandle, UploadKey, UploadProcessor, UploadSink,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::Arc;

const MAC: &str = "001122334455";
const KEY: [u8; 16] = [0xAA; 16];

#[derive(Debug, Default)]
struct Calls {
    files: Vec<(String, Vec<u8>)>,
    commits: usize,
    aborts: usize,
}

#[derive(Default)]
struct RecordingSink {
    calls: Arc<Mutex<Calls>>,
}

struct RecordingHandle {
    calls: Arc<Mutex<Calls>>,
}

impl UploadSink for RecordingSink {
    fn start_upload(&self, _card: &CardIdentity, _archive_name: &str) -> Result<Box<dyn UploadHandle>> {
        Ok(Box::new(RecordingHandle {
            calls: self.calls.clone(),
        }))
    }
}

impl UploadHandle for RecordingHandle {
    fn handle_file(&mut self, name: &str, content: &mut dyn Read) -> Result<u64> {
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let len = data.len() as u64;
        self.calls.lock().files.push((name.to_string(), data));
        Ok(len)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.calls.lock().commits += 1;
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        self.calls.lock().aborts += 1;
        Ok(())
    }
}

fn mac() -> MacAddress {
    MAC.parse().unwrap()
}

fn directory() -> Arc<StaticDirectory> {
    Arc::new(std::iter::once(CardIdentity::new(mac(), UploadKey::new(KEY.to_vec()))).collect())
}

fn upload_body(files: &[(&str, &[u8])], digest_override: Option<String>) -> (String, Vec<u8>) {
    let mut archive = ArchiveWriter::new(Vec::new());
    for (name, data) in files {
        archive.append(name, data).unwrap();
    }
    let archive = archive.finish().unwrap();
    let digest = digest_override.unwrap_or_else(|| hex::encode(integrity_digest(&archive, &KEY)));

    let envelope = UploadPhotoRequest {
        mac_address: Some(MAC.to_string()),
        file_name: Some("P1030007.JPG.tar".to_string()),
        file_id: Some(1),
        file_size: Some(archive.len() as u64),
        file_signature: None,
        encryption: Some("none".to_string()),
        flags: Some("4".to_string()),
    }
    .to_soap()
    .unwrap();

    let mut writer = MultipartWriter::new("---------------------------02468ace13579bdfcafebabef00d");
    writer
        .form_field("SOAPENVELOPE", None, "text/xml", envelope.as_bytes())
        .form_field("FILENAME", Some("P1030007.JPG.tar"), "application/x-tar", &archive)
        .form_field("INTEGRITYDIGEST", None, "text/plain", digest.as_bytes());
    let content_type = format!("{}; charset=ISO-8859-1", writer.content_type());
    (content_type, writer.finish())
}

fn status_request(credential: String) -> GetPhotoStatusRequest {
    GetPhotoStatusRequest {
        mac_address: mac(),
        credential,
        file_name: Some("P1030007.JPG.tar".to_string()),
        file_size: Some(1_269_760),
        file_signature: None,
    }
}

#[test]
fn scenario_start_session_credential() {
    let service = SessionService::new(directory());
    let xml = ControlRequest::StartSession(StartSessionRequest {
        mac_address: mac(),
        cnonce: Nonce::from_bytes([0; 16]),
        transfer_mode: "2".to_string(),
        transfer_mode_timestamp: "1230268824".to_string(),
    })
    .to_soap()
    .unwrap();

    let reply = service.handle_control(&xml).unwrap();
    let response = match ControlResponse::from_soap(&soap::parse_envelope(&reply).unwrap()).unwrap() {
        ControlResponse::StartSession(resp) => resp,
        other => panic!("unexpected {other:?}"),
    };

    let mut input = hex::decode(MAC).unwrap();
    input.extend_from_slice(&[0u8; 16]);
    input.extend_from_slice(&KEY);
    assert_eq!(response.credential, hex::encode(crypto::md5_concat(&[&input])));
    assert_eq!(response.transfer_mode, "2");
    assert_eq!(response.transfer_mode_timestamp, "1230268824");
    assert!(!response.upsync_allowed);
    assert_eq!(response.snonce, *service.server_nonce());
}

#[test]
fn scenario_photo_status_ids() {
    let service = SessionService::new(directory());
    let credential = hex::encode(crypto::card_credential(mac().as_bytes(), &KEY, service.server_nonce()));

    assert_eq!(service.get_photo_status(&status_request(credential.clone())).unwrap().file_id, 1);
    assert_eq!(service.get_photo_status(&status_request(credential)).unwrap().file_id, 2);
}

#[test]
fn scenario_wrong_credential() {
    let service = SessionService::new(directory());
    let wrong = hex::encode(crypto::card_credential(mac().as_bytes(), &[0u8; 16], service.server_nonce()));
    assert!(matches!(
        service.get_photo_status(&status_request(wrong)),
        Err(Error::Authentication)
    ));

    let right = hex::encode(crypto::card_credential(mac().as_bytes(), &KEY, service.server_nonce()));
    assert_eq!(service.get_photo_status(&status_request(right)).unwrap().file_id, 1);
}

#[test]
fn scenario_upload_commits() {
    let sink = Arc::new(RecordingSink::default());
    let calls = sink.calls.clone();
    let processor = UploadProcessor::new(directory(), sink);

    let photo = vec![0xFFu8, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
    let (content_type, body) = upload_body(&[("P1030007.JPG", photo.as_slice())], None);
    let outcome = processor.process_request(&content_type, Cursor::new(body)).unwrap();

    assert!(outcome.success);
    let calls = calls.lock();
    assert_eq!(calls.files, vec![("P1030007.JPG".to_string(), photo)]);
    assert_eq!((calls.commits, calls.aborts), (1, 0));

    let reply = soap::parse_envelope(&outcome.response().to_soap().unwrap()).unwrap();
    assert_eq!(reply.field("success"), Some("true"));
}

#[test]
fn scenario_digest_mismatch_aborts() {
    let sink = Arc::new(RecordingSink::default());
    let calls = sink.calls.clone();
    let processor = UploadProcessor::new(directory(), sink);

    let (content_type, body) = upload_body(&[("P1030007.JPG", &b"jpeg"[..])], Some("ff".repeat(16)));
    let outcome = processor.process_request(&content_type, Cursor::new(body)).unwrap();

    assert!(!outcome.success);
    let calls = calls.lock();
    assert_eq!((calls.commits, calls.aborts), (0, 1));

    let reply = soap::parse_envelope(&outcome.response().to_soap().unwrap()).unwrap();
    assert_eq!(reply.action, "UploadPhotoResponse");
    assert_eq!(reply.field("success"), Some("false"));
}

#[test]
fn scenario_missing_terminal_boundary() {
    let sink = Arc::new(RecordingSink::default());
    let calls = sink.calls.clone();
    let processor = UploadProcessor::new(directory(), sink);

    let (content_type, mut body) = upload_body(&[("P1030007.JPG", &b"jpeg"[..])], None);
    let close = body
        .windows(4)
        .rposition(|w| w == b"\r\n--")
        .unwrap();
    body.truncate(close);

    let result = processor.process_request(&content_type, Cursor::new(body));
    assert!(matches!(result, Err(Error::StreamFormat(_))));
    assert_eq!(calls.lock().commits, 0);
}

#[test]
fn concurrent_photo_status_ids_are_distinct() {
    let service = Arc::new(SessionService::new(directory()));
    let credential = hex::encode(crypto::card_credential(mac().as_bytes(), &KEY, service.server_nonce()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let credential = credential.clone();
            std::thread::spawn(move || {
                (0..25)
                    .map(|_| service.get_photo_status(&status_request(credential.clone())).unwrap().file_id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 200);
    assert_eq!(unique.len(), 200);
}

#[test]
fn upload_to_directory_sink() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(DirectorySink::new(dir.path()));
    let processor = UploadProcessor::new(directory(), sink);

    let (content_type, body) = upload_body(
        &[("P1030007.JPG", &b"jpeg data"[..]), ("P1030007.JPG.log", &b"log"[..])],
        None,
    );
    let outcome = processor.process_request(&content_type, Cursor::new(body)).unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.files, 2);
    assert_eq!(std::fs::read(dir.path().join("P1030007.JPG")).unwrap(), b"jpeg data");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}
