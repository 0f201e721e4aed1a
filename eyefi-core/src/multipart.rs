// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Forward-only reader for boundary-delimited multipart bodies
//!
//! The reader pulls bytes from any `Read` source and yields parts one at a
//! time. A part's body is itself a `Read` that stops at the next delimiter,
//! so an upload is processed in a single pass without holding more than a
//! small lookahead window in memory. Requesting the next part skips whatever
//! is left of the current body.
//!
//! Only the framing subset emitted by Eye-Fi cards is supported: a single
//! level of parts, CRLF line endings, no nested multiparts.

use crate::charset::Charset;
use crate::params::HeaderValue;
use crate::{Error, Result};
use std::collections::HashMap;
use std::io::{self, Read};

/// Bytes requested from the underlying source per refill
const READ_CHUNK: usize = 8 * 1024;

/// Upper bound for one part's header section
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Headers of one part, keyed by lowercased name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    map: HashMap<String, Vec<String>>,
}

impl PartHeaders {
    /// Add a header value (name is lowercased)
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.map
            .entry(name.trim().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// First value of a header, ignoring name case
    pub fn first(&self, name: &str) -> Option<&str> {
        self.map
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a header, ignoring name case
    pub fn all(&self, name: &str) -> &[String] {
        self.map
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Field name from `Content-Disposition: form-data; name="..."`
    pub fn field_name(&self) -> Option<String> {
        let disposition = HeaderValue::parse(self.first("content-disposition")?);
        disposition.param("name").map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing read yet, looking for the first delimiter
    Preamble,
    /// Positioned just after a delimiter
    Delimited,
    /// Inside a part body
    Body,
    /// Close delimiter seen
    Finished,
}

/// Streaming multipart reader
pub struct MultipartReader<R> {
    inner: R,
    charset: Charset,
    /// `CRLF "--" boundary`
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    state: State,
    max_header_bytes: usize,
}

impl<R: Read> MultipartReader<R> {
    /// Create a reader for the given boundary (without the leading dashes)
    pub fn new(inner: R, boundary: &[u8], charset: Charset) -> Result<Self> {
        if boundary.is_empty() || boundary.len() > 200 {
            return Err(Error::Protocol(format!(
                "Invalid multipart boundary length {}",
                boundary.len()
            )));
        }
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary);

        Ok(Self {
            inner,
            charset,
            delimiter,
            // A delimiter at the very start of the stream has no preceding
            // CRLF; seeding one lets the same search handle both cases.
            buf: b"\r\n".to_vec(),
            pos: 0,
            eof: false,
            state: State::Preamble,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        })
    }

    /// Override the header section size limit
    pub fn with_max_header_bytes(mut self, limit: usize) -> Self {
        self.max_header_bytes = limit;
        self
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Advance to the next part, skipping the rest of the current one.
    ///
    /// Returns `None` once the close delimiter has been read.
    pub fn next_part(&mut self) -> Result<Option<Part<'_, R>>> {
        match self.state {
            State::Finished => return Ok(None),
            State::Preamble => self.skip_preamble()?,
            State::Body => self.skip_body()?,
            State::Delimited => {}
        }

        if self.read_delimiter_suffix()? {
            self.state = State::Finished;
            return Ok(None);
        }

        let headers = self.read_headers()?;
        self.state = State::Body;
        Ok(Some(Part {
            headers,
            reader: self,
        }))
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Pull another chunk from the source. Returns false at end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let n = loop {
            match self.inner.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(start + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(n > 0)
    }

    /// Make sure at least `n` bytes are buffered; false if the stream ends first
    fn ensure(&mut self, n: usize) -> io::Result<bool> {
        while self.available().len() < n {
            if !self.fill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn skip_preamble(&mut self) -> Result<()> {
        loop {
            if let Some(idx) = find(self.available(), &self.delimiter) {
                self.pos += idx + self.delimiter.len();
                self.state = State::Delimited;
                return Ok(());
            }
            let keep = self.delimiter.len() - 1;
            self.pos = self.buf.len().saturating_sub(keep).max(self.pos);
            if !self.fill()? {
                return Err(Error::StreamFormat(
                    "No multipart boundary found before end of stream".to_string(),
                ));
            }
        }
    }

    fn skip_body(&mut self) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while self.read_body(&mut scratch)? > 0 {}
        Ok(())
    }

    /// Inspect what follows a delimiter. True for the close delimiter.
    fn read_delimiter_suffix(&mut self) -> Result<bool> {
        if !self.ensure(2)? {
            return Err(Error::StreamFormat(
                "Unexpected end of stream after boundary".to_string(),
            ));
        }
        if self.available().starts_with(b"--") {
            self.pos += 2;
            return Ok(true);
        }
        // Transport padding is allowed between the boundary and its CRLF
        loop {
            if !self.ensure(2)? {
                return Err(Error::StreamFormat(
                    "Unexpected end of stream after boundary".to_string(),
                ));
            }
            match self.available()[0] {
                b' ' | b'\t' => self.pos += 1,
                _ => break,
            }
        }
        if !self.available().starts_with(b"\r\n") {
            return Err(Error::StreamFormat(
                "Boundary line not terminated by CRLF".to_string(),
            ));
        }
        self.pos += 2;
        Ok(false)
    }

    fn read_headers(&mut self) -> Result<PartHeaders> {
        let mut headers = PartHeaders::default();
        let mut consumed = 0usize;
        let mut current: Option<(String, String)> = None;

        loop {
            let line = loop {
                if let Some(idx) = find(self.available(), b"\r\n") {
                    let line = self.charset.decode(&self.available()[..idx]);
                    self.pos += idx + 2;
                    consumed += idx + 2;
                    break line;
                }
                if self.available().len() + consumed > self.max_header_bytes {
                    return Err(Error::StreamFormat(format!(
                        "Part header section exceeds {} bytes",
                        self.max_header_bytes
                    )));
                }
                if !self.fill()? {
                    return Err(Error::StreamFormat(
                        "Unexpected end of stream in part headers".to_string(),
                    ));
                }
            };
            if consumed > self.max_header_bytes {
                return Err(Error::StreamFormat(format!(
                    "Part header section exceeds {} bytes",
                    self.max_header_bytes
                )));
            }

            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match current.as_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => {
                        return Err(Error::StreamFormat(
                            "Header continuation without a header".to_string(),
                        ))
                    }
                }
                continue;
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                Error::StreamFormat(format!("Malformed part header line: {:?}", line))
            })?;
            if name.trim().is_empty() {
                return Err(Error::StreamFormat("Empty part header name".to_string()));
            }
            if let Some((name, value)) = current.take() {
                headers.insert(&name, value);
            }
            current = Some((name.to_string(), value.trim().to_string()));
        }

        if let Some((name, value)) = current {
            headers.insert(&name, value);
        }
        Ok(headers)
    }

    /// Read body bytes of the current part; 0 at the part's end
    fn read_body(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.state != State::Body || out.is_empty() {
            return Ok(0);
        }
        loop {
            let avail = self.available();
            if let Some(idx) = find(avail, &self.delimiter) {
                if idx == 0 {
                    self.pos += self.delimiter.len();
                    self.state = State::Delimited;
                    return Ok(0);
                }
                let n = idx.min(out.len());
                out[..n].copy_from_slice(&avail[..n]);
                self.pos += n;
                return Ok(n);
            }
            // Bytes that cannot be the start of a delimiter are safe to hand out
            let safe = avail.len().saturating_sub(self.delimiter.len() - 1);
            if safe > 0 {
                let n = safe.min(out.len());
                out[..n].copy_from_slice(&avail[..n]);
                self.pos += n;
                return Ok(n);
            }
            if !self.fill()? {
                return Err(Error::StreamFormat(
                    "Unexpected end of stream in part body".to_string(),
                ));
            }
        }
    }
}

/// One part: its headers plus a body reader bounded by the next delimiter
pub struct Part<'a, R> {
    pub headers: PartHeaders,
    reader: &'a mut MultipartReader<R>,
}

impl<'a, R: Read> Part<'a, R> {
    pub fn field_name(&self) -> Option<String> {
        self.headers.field_name()
    }

    pub fn charset(&self) -> Charset {
        self.reader.charset
    }

    /// Read the whole body, failing if it exceeds `limit` bytes
    pub fn read_to_vec(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.by_ref().take(limit as u64 + 1).read_to_end(&mut data)?;
        if data.len() > limit {
            return Err(Error::Protocol(format!(
                "Part body exceeds {} bytes",
                limit
            )));
        }
        Ok(data)
    }
}

impl<'a, R: Read> Read for Part<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read_body(buf).map_err(Error::into_io)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Builder for multipart bodies in the framing the reader accepts
pub struct MultipartWriter {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartWriter {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            body: Vec::new(),
        }
    }

    /// Create a writer with a random boundary
    pub fn with_random_boundary() -> Self {
        use rand::distributions::Alphanumeric;
        use rand::Rng;
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::new(format!("---------------------------{}", suffix))
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` value announcing this body's boundary
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Append a part with explicit headers
    pub fn part(&mut self, headers: &[(&str, &str)], body: &[u8]) -> &mut Self {
        if !self.body.is_empty() {
            self.body.extend_from_slice(b"\r\n");
        }
        self.body.extend_from_slice(b"--");
        self.body.extend_from_slice(self.boundary.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        for (name, value) in headers {
            self.body.extend_from_slice(name.as_bytes());
            self.body.extend_from_slice(b": ");
            self.body.extend_from_slice(value.as_bytes());
            self.body.extend_from_slice(b"\r\n");
        }
        self.body.extend_from_slice(b"\r\n");
        self.body.extend_from_slice(body);
        self
    }

    /// Append a `form-data` part carrying a field name (and optional file name)
    pub fn form_field(
        &mut self,
        name: &str,
        filename: Option<&str>,
        content_type: &str,
        body: &[u8],
    ) -> &mut Self {
        let disposition = match filename {
            Some(f) => format!("form-data; name=\"{}\"; filename=\"{}\"", name, f),
            None => format!("form-data; name=\"{}\"", name),
        };
        self.part(
            &[
                ("Content-Disposition", disposition.as_str()),
                ("Content-Type", content_type),
            ],
            body,
        )
    }

    /// Terminate the body with the close delimiter
    pub fn finish(mut self) -> Vec<u8> {
        if !self.body.is_empty() {
            self.body.extend_from_slice(b"\r\n");
        }
        self.body.extend_from_slice(b"--");
        self.body.extend_from_slice(self.boundary.as_bytes());
        self.body.extend_from_slice(b"--\r\n");
        self.body
    }
}
