// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Minimal SOAP envelope codec
//!
//! Eye-Fi messages are flat: `Envelope/Body/<Action>/<field>text</field>`.
//! Reading keeps the action's local name and the text of its direct
//! children; namespaces prefixes are ignored.

use crate::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::io::Cursor;

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Namespace of server responses
pub const RESPONSE_NS: &str = "http://localhost/api/soap/eyefilm";

/// Namespace cards put on their requests
pub const REQUEST_NS: &str = "EyeFi/SOAP/EyeFilm";

/// Action element of a SOAP body with its child field texts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoapMessage {
    pub action: String,
    pub fields: HashMap<String, String>,
}

impl SoapMessage {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Field that must be present
    pub fn required(&self, name: &str) -> Result<&str> {
        self.field(name).ok_or_else(|| {
            Error::Protocol(format!("{} request is missing <{}>", self.action, name))
        })
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

/// Parse a SOAP envelope into its body action
pub fn parse_envelope(xml: &str) -> Result<SoapMessage> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut message: Option<SoapMessage> = None;
    let mut text = String::new();

    loop {
        let in_body = path.get(1).map_or(false, |p| p == "Body");
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(&e);
                check_structure(&path, &name)?;
                if in_body && path.len() == 2 {
                    message = Some(SoapMessage {
                        action: name.clone(),
                        fields: HashMap::new(),
                    });
                }
                text.clear();
                path.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                check_structure(&path, &name)?;
                match path.len() {
                    _ if !in_body => {}
                    2 => {
                        message = Some(SoapMessage {
                            action: name,
                            fields: HashMap::new(),
                        })
                    }
                    3 => {
                        if let Some(m) = message.as_mut() {
                            m.fields.insert(name, String::new());
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if in_body && path.len() == 4 {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if in_body && path.len() == 4 {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                if in_body && path.len() == 4 {
                    if let (Some(m), Some(name)) = (message.as_mut(), path.last()) {
                        m.fields.insert(name.clone(), std::mem::take(&mut text));
                    }
                }
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    message.ok_or_else(|| Error::Protocol("SOAP body carries no action".to_string()))
}

fn check_structure(path: &[String], name: &str) -> Result<()> {
    match path.len() {
        0 if name != "Envelope" => Err(Error::Protocol(format!(
            "Expected SOAP Envelope, found <{}>",
            name
        ))),
        1 if name != "Body" && name != "Header" => Err(Error::Protocol(format!(
            "Unexpected <{}> in SOAP Envelope",
            name
        ))),
        _ => Ok(()),
    }
}

/// Serialize an action with flat text fields inside a SOAP envelope
pub fn write_envelope(namespace: &str, action: &str, fields: &[(&str, &str)]) -> Result<String> {
    let xml_err = |e: quick_xml::Error| Error::Xml(e.to_string());
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut envelope = BytesStart::new("SOAP-ENV:Envelope");
    envelope.push_attribute(("xmlns:SOAP-ENV", SOAP_ENV_NS));
    envelope.push_attribute(("xmlns:ns1", namespace));
    writer.write_event(Event::Start(envelope)).map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("SOAP-ENV:Body")))
        .map_err(xml_err)?;

    let action_tag = format!("ns1:{}", action);
    if fields.is_empty() {
        writer
            .write_event(Event::Empty(BytesStart::new(action_tag.as_str())))
            .map_err(xml_err)?;
    } else {
        writer
            .write_event(Event::Start(BytesStart::new(action_tag.as_str())))
            .map_err(xml_err)?;
        for (name, value) in fields {
            writer
                .write_event(Event::Start(BytesStart::new(*name)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(*name)))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(action_tag.as_str())))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("SOAP-ENV:Body")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("SOAP-ENV:Envelope")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| Error::Xml(e.to_string()))
}
