use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, warn};

use crate::cookie;
use crate::settings::ServerSettings;

use super::multipart::{self, BodySpool};
use super::{find, ByteMultiMap, RequestStatus, UploadedFile};

/// Largest step a multipart body is spooled to disk in.
const SPOOL_STEP: usize = 64 * 1024;

/// One HTTP request, parsed incrementally from socket bytes.
///
/// The connection handler feeds buffered bytes through [`Request::feed`];
/// each call advances the parse as far as the buffer permits. Termination is
/// signaled through [`Request::status`]: `Complete` when the request is
/// ready to be dispatched, `Aborted` when it is malformed or over-size.
/// Non-multipart requests are bounded by `maxRequestSize`, multipart bodies
/// by `maxMultiPartSize`; multipart bodies are spooled to a temporary file
/// and parsed from disk once fully received.
pub struct Request {
    status: RequestStatus,
    method: Bytes,
    raw_path: Bytes,
    decoded_path: Bytes,
    version: Bytes,
    headers: ByteMultiMap,
    parameters: ByteMultiMap,
    cookies: HashMap<Bytes, Bytes>,
    body: BytesMut,
    peer: SocketAddr,
    peer_address: Option<SocketAddr>,
    line_buffer: BytesMut,
    current_header: Bytes,
    boundary: Bytes,
    current_size: usize,
    expected_body_size: usize,
    max_request_size: usize,
    max_multi_part_size: usize,
    spool: Option<BodySpool>,
    uploaded_files: HashMap<Bytes, UploadedFile>,
}

impl Request {
    pub(crate) fn new(settings: &ServerSettings, peer: SocketAddr) -> Self {
        Self {
            status: RequestStatus::AwaitingRequestLine,
            method: Bytes::new(),
            raw_path: Bytes::new(),
            decoded_path: Bytes::new(),
            version: Bytes::new(),
            headers: ByteMultiMap::default(),
            parameters: ByteMultiMap::default(),
            cookies: HashMap::new(),
            body: BytesMut::new(),
            peer,
            peer_address: None,
            line_buffer: BytesMut::new(),
            current_header: Bytes::new(),
            boundary: Bytes::new(),
            current_size: 0,
            expected_body_size: 0,
            max_request_size: settings.max_request_size,
            max_multi_part_size: settings.max_multi_part_size,
            spool: None,
            uploaded_files: HashMap::new(),
        }
    }

    /// Advance the parse by one step against the buffered socket bytes.
    /// Call repeatedly while `status().is_receiving()` and the buffer is
    /// non-empty.
    pub(crate) fn feed(&mut self, buf: &mut BytesMut) {
        match self.status {
            RequestStatus::AwaitingRequestLine => self.read_request_line(buf),
            RequestStatus::AwaitingHeader => self.read_header_line(buf),
            RequestStatus::AwaitingBody => self.read_body(buf),
            RequestStatus::Complete | RequestStatus::Aborted => return,
        }

        let limit = if self.boundary.is_empty() {
            self.max_request_size
        } else {
            self.max_multi_part_size
        };
        if self.current_size > limit {
            warn!("received too many bytes, aborting request");
            self.status = RequestStatus::Aborted;
        }

        if self.status == RequestStatus::Complete {
            self.decode_parameters();
            self.extract_cookies();
        }
    }

    /// Take one CRLF-terminated line out of `buf`, consuming at most the
    /// remaining size budget plus one byte (the extra byte is what makes an
    /// overflow detectable). Partial lines accumulate across calls.
    fn take_line(&mut self, buf: &mut BytesMut) -> Option<Vec<u8>> {
        let budget = self.max_request_size.saturating_sub(self.current_size) + 1;
        let take = match buf.iter().position(|&b| b == b'\n') {
            Some(newline) => (newline + 1).min(budget),
            None => budget,
        }
        .min(buf.len());
        let chunk = buf.split_to(take);
        self.current_size += chunk.len();
        self.line_buffer.extend_from_slice(&chunk);

        if find(&self.line_buffer, b"\r\n").is_none() {
            return None;
        }
        let line = self.line_buffer.split();
        Some(line.trim_ascii().to_vec())
    }

    fn read_request_line(&mut self, buf: &mut BytesMut) {
        let Some(line) = self.take_line(buf) else {
            return;
        };
        if line.is_empty() {
            return;
        }
        let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
        if tokens.len() != 3 || find(tokens[2], b"HTTP").is_none() {
            warn!("received broken HTTP request, invalid first line");
            self.status = RequestStatus::Aborted;
            return;
        }
        self.method = Bytes::copy_from_slice(tokens[0].trim_ascii());
        self.raw_path = Bytes::copy_from_slice(tokens[1]);
        self.version = Bytes::copy_from_slice(tokens[2]);
        self.peer_address = Some(self.peer);
        self.status = RequestStatus::AwaitingHeader;
    }

    fn read_header_line(&mut self, buf: &mut BytesMut) {
        let Some(line) = self.take_line(buf) else {
            return;
        };

        if let Some(colon) = line.iter().position(|&b| b == b':').filter(|&c| c > 0) {
            let name = line[..colon].to_ascii_lowercase();
            let value = line[colon + 1..].trim_ascii();
            self.current_header = Bytes::from(name.clone());
            self.headers.insert(name, Bytes::copy_from_slice(value));
            return;
        }

        if !line.is_empty() {
            // continuation of the previous header (legacy line folding)
            let name = self.current_header.clone();
            if self.headers.contains_key(&name) {
                self.headers.fold_into_last(&name, &line);
            }
            return;
        }

        // empty line: all headers received
        let content_type = self.headers.get(b"content-type").cloned().unwrap_or_default();
        if content_type.starts_with(b"multipart/form-data") {
            if let Some(posi) = find(&content_type, b"boundary=") {
                let mut boundary = &content_type[posi + 9..];
                if boundary.len() >= 2 && boundary.starts_with(b"\"") && boundary.ends_with(b"\"")
                {
                    boundary = &boundary[1..boundary.len() - 1];
                }
                self.boundary = Bytes::copy_from_slice(boundary);
            }
        }
        if let Some(content_length) = self.headers.get(b"content-length") {
            self.expected_body_size = parse_usize(content_length);
        }

        if self.expected_body_size == 0 {
            self.status = RequestStatus::Complete;
        } else if self.boundary.is_empty()
            && self.expected_body_size + self.current_size > self.max_request_size
        {
            warn!("expected body is too large");
            self.status = RequestStatus::Aborted;
        } else if !self.boundary.is_empty() && self.expected_body_size > self.max_multi_part_size
        {
            warn!("expected multipart body is too large");
            self.status = RequestStatus::Aborted;
        } else {
            debug!(expected = self.expected_body_size, "expecting body");
            self.status = RequestStatus::AwaitingBody;
        }
    }

    fn read_body(&mut self, buf: &mut BytesMut) {
        if self.boundary.is_empty() {
            let to_read = self
                .expected_body_size
                .saturating_sub(self.body.len())
                .min(buf.len());
            let chunk = buf.split_to(to_read);
            self.current_size += chunk.len();
            self.body.extend_from_slice(&chunk);
            if self.body.len() >= self.expected_body_size {
                self.status = RequestStatus::Complete;
            }
            return;
        }

        // multipart body, spooled to a temporary file
        if self.spool.is_none() {
            match BodySpool::create() {
                Ok(spool) => self.spool = Some(spool),
                Err(e) => {
                    error!(cause = %e, "cannot create spool file for multipart body");
                    self.status = RequestStatus::Aborted;
                    return;
                }
            }
        }
        let Some(spool) = self.spool.as_mut() else {
            return;
        };
        let to_read = (self.expected_body_size.saturating_sub(spool.size as usize))
            .min(SPOOL_STEP)
            .min(buf.len());
        let chunk = buf.split_to(to_read);
        if let Err(e) = spool.write(&chunk) {
            error!(cause = %e, "cannot write spool file for multipart body");
            self.status = RequestStatus::Aborted;
            return;
        }
        if spool.size >= self.max_multi_part_size as u64 {
            warn!("received too many multipart bytes");
            self.status = RequestStatus::Aborted;
        } else if spool.size >= self.expected_body_size as u64 {
            multipart::extract(
                spool,
                &self.boundary,
                &mut self.parameters,
                &mut self.uploaded_files,
                &mut self.current_size,
            );
            self.status = RequestStatus::Complete;
        }
    }

    /// Decode parameters from the query string and, for form-encoded
    /// requests, from the body. Strips the query from the raw path.
    fn decode_parameters(&mut self) {
        let mut raw = Vec::new();
        if let Some(question_mark) = self.raw_path.iter().position(|&b| b == b'?') {
            raw = self.raw_path[question_mark + 1..].to_vec();
            self.raw_path = self.raw_path.slice(..question_mark);
        }
        let content_type = self.headers.get(b"content-type").cloned().unwrap_or_default();
        if !self.body.is_empty()
            && (content_type.is_empty()
                || content_type.starts_with(b"application/x-www-form-urlencoded"))
        {
            if !raw.is_empty() {
                raw.push(b'&');
            }
            raw.extend_from_slice(&self.body);
        }
        for part in raw.split(|&b| b == b'&') {
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.iter().position(|&b| b == b'=') {
                Some(posi) => (part[..posi].trim_ascii(), part[posi + 1..].trim_ascii()),
                None => (part.trim_ascii(), &b""[..]),
            };
            self.parameters.insert(url_decode(name), url_decode(value));
        }
        self.decoded_path = Bytes::from(url_decode(&self.raw_path));
    }

    /// Collect (name, value) pairs from all `cookie` headers, then drop the
    /// headers themselves. Later occurrences of a name win.
    fn extract_cookies(&mut self) {
        for header in self.headers.get_all(b"cookie").to_vec() {
            for part in cookie::split_csv(&header) {
                let (name, value) = cookie::split_pair(&part);
                self.cookies
                    .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
            }
        }
        self.headers.remove(b"cookie");
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn method(&self) -> &Bytes {
        &self.method
    }

    /// URL-decoded path, without the query string.
    pub fn path(&self) -> &Bytes {
        &self.decoded_path
    }

    /// Path as received, without the query string.
    pub fn raw_path(&self) -> &Bytes {
        &self.raw_path
    }

    pub fn version(&self) -> &Bytes {
        &self.version
    }

    /// Last-received value of a header, case-insensitive.
    pub fn header(&self, name: &[u8]) -> Option<&Bytes> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// All values of a header in arrival order, case-insensitive.
    pub fn headers(&self, name: &[u8]) -> &[Bytes] {
        self.headers.get_all(&name.to_ascii_lowercase())
    }

    /// Full header map; keys are lower-cased.
    pub fn header_map(&self) -> &ByteMultiMap {
        &self.headers
    }

    /// Last-received value of a parameter, case-sensitive.
    pub fn parameter(&self, name: &[u8]) -> Option<&Bytes> {
        self.parameters.get(name)
    }

    /// All values of a parameter in arrival order.
    pub fn parameters(&self, name: &[u8]) -> &[Bytes] {
        self.parameters.get_all(name)
    }

    pub fn parameter_map(&self) -> &ByteMultiMap {
        &self.parameters
    }

    /// Raw body bytes of a non-multipart request.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn cookie(&self, name: &[u8]) -> Option<&Bytes> {
        self.cookies.get(name)
    }

    pub fn cookie_map(&self) -> &HashMap<Bytes, Bytes> {
        &self.cookies
    }

    /// Address of the connected client, available once the request line has
    /// been received.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    /// Uploaded file for a multipart field name.
    pub fn uploaded_file(&self, field: &[u8]) -> Option<&UploadedFile> {
        self.uploaded_files.get(field)
    }
}

/// Decode URL encoding: `+` becomes a space, then `%HH` pairs are resolved
/// left to right. An invalid `%HH` is left unchanged and not re-examined.
fn url_decode(source: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(source.len());
    let mut i = 0;
    while i < source.len() {
        match source[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (hex_value(source.get(i + 1)), hex_value(source.get(i + 2))) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match *byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_usize(value: &[u8]) -> usize {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}
