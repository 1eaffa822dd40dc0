use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::cookie::Cookie;

/// Pending output above this size is drained to the socket before the
/// writer accepts more.
const DRAIN_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("response already finished")]
    Finished,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Writer for one HTTP response.
///
/// Status, headers and cookies are buffered until the first call to
/// [`Response::write`], which decides the framing: a single
/// `write(data, last=true)` gets a `Content-Length`, streamed writes get
/// `Transfer-Encoding: chunked` unless a `Connection: close` header was set,
/// in which case the body runs to connection close.
pub struct Response<'a> {
    stream: &'a mut (dyn AsyncWrite + Send + Unpin),
    status_code: u16,
    status_text: Bytes,
    headers: Vec<(Bytes, Bytes)>,
    cookies: Vec<Cookie>,
    pending: BytesMut,
    sent_headers: bool,
    sent_last_part: bool,
    chunked_mode: bool,
    connected: bool,
}

impl<'a> Response<'a> {
    pub(crate) fn new(stream: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self {
            stream,
            status_code: 200,
            status_text: Bytes::from_static(b"OK"),
            headers: Vec::new(),
            cookies: Vec::new(),
            pending: BytesMut::new(),
            sent_headers: false,
            sent_last_part: false,
            chunked_mode: false,
            connected: true,
        }
    }

    pub fn set_status(&mut self, code: u16, text: impl Into<Bytes>) {
        if self.sent_headers {
            warn!("ignoring status change, headers already sent");
            return;
        }
        self.status_code = code;
        self.status_text = text.into();
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Set a header. A later value for the same name replaces the earlier
    /// one; insertion order and name case are preserved.
    pub fn set_header(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        if self.sent_headers {
            warn!("ignoring header, headers already sent");
            return;
        }
        self.insert_header(name.into(), value.into());
    }

    fn insert_header(&mut self, name: Bytes, value: Bytes) {
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Last header value for `name`, compared case-insensitively.
    pub fn header(&self, name: &[u8]) -> Option<&Bytes> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Add a cookie to be sent with the headers. Cookies without a name are
    /// ignored.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        if self.sent_headers {
            warn!("ignoring cookie, headers already sent");
            return;
        }
        if cookie.name().is_empty() {
            warn!("ignoring cookie without a name");
            return;
        }
        match self
            .cookies
            .iter_mut()
            .find(|existing| existing.name() == cookie.name())
        {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    pub fn cookie(&self, name: &[u8]) -> Option<&Cookie> {
        self.cookies.iter().find(|cookie| &cookie.name()[..] == name)
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Stream a part of the body; `last` finishes the response. The first
    /// call fixes the framing and emits the status line and headers.
    pub async fn write(&mut self, data: &[u8], last: bool) -> Result<(), SendError> {
        if self.sent_last_part {
            return Err(SendError::Finished);
        }

        if !self.sent_headers {
            if last {
                // whole body in one call, so the total size is known
                self.insert_header(
                    Bytes::from_static(b"Content-Length"),
                    Bytes::from(data.len().to_string()),
                );
            } else {
                let connection_close = self
                    .header(b"connection")
                    .is_some_and(|value| value.eq_ignore_ascii_case(b"close"));
                if !connection_close {
                    self.insert_header(
                        Bytes::from_static(b"Transfer-Encoding"),
                        Bytes::from_static(b"chunked"),
                    );
                    self.chunked_mode = true;
                }
            }
            self.write_headers().await?;
        }

        if !data.is_empty() {
            if self.chunked_mode {
                let size = format!("{:x}\r\n", data.len());
                self.write_raw(size.as_bytes()).await?;
                self.write_raw(data).await?;
                self.write_raw(b"\r\n").await?;
            } else {
                self.write_raw(data).await?;
            }
        }

        if last {
            if self.chunked_mode {
                self.write_raw(b"0\r\n\r\n").await?;
            }
            self.flush().await?;
            self.sent_last_part = true;
        }
        Ok(())
    }

    /// Send a 303 redirect to `url` and finish the response.
    pub async fn redirect(&mut self, url: impl Into<Bytes>) -> Result<(), SendError> {
        self.set_status(303, &b"See Other"[..]);
        self.set_header(&b"Location"[..], url.into());
        self.write(b"Redirect", true).await
    }

    /// Drain buffered output to the socket.
    pub async fn flush(&mut self) -> Result<(), SendError> {
        self.drain().await?;
        self.stream.flush().await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn has_sent_last_part(&self) -> bool {
        self.sent_last_part
    }

    async fn write_headers(&mut self) -> Result<(), SendError> {
        let mut buffer = BytesMut::with_capacity(256);
        buffer.put_slice(b"HTTP/1.1 ");
        buffer.put_slice(self.status_code.to_string().as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(&self.status_text);
        buffer.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            buffer.put_slice(name);
            buffer.put_slice(b": ");
            buffer.put_slice(value);
            buffer.put_slice(b"\r\n");
        }
        for cookie in &self.cookies {
            buffer.put_slice(b"Set-Cookie: ");
            buffer.put_slice(&cookie.encode());
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(b"\r\n");
        let buffer = buffer.freeze();
        self.write_raw(&buffer).await?;
        self.flush().await?;
        self.sent_headers = true;
        Ok(())
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.pending.extend_from_slice(data);
        if self.pending.len() > DRAIN_THRESHOLD {
            self.drain().await?;
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), SendError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = self.pending.split();
        self.stream.write_all(&data).await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn fail(&mut self, e: io::Error) -> SendError {
        self.connected = false;
        SendError::Io { source: e }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn pipe() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(1 << 20)
    }

    async fn collect(client: &mut DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        super::super::find(haystack, needle).is_some()
    }

    #[tokio::test]
    async fn single_write_uses_content_length() {
        let (mut client, mut server) = pipe();
        {
            let mut response = Response::new(&mut server);
            response.set_header(&b"X-Tag"[..], &b"v"[..]);
            response.write(b"Hello", true).await.unwrap();
            assert!(response.has_sent_last_part());
        }
        drop(server);
        let out = collect(&mut client).await;

        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(contains(&out, b"X-Tag: v\r\n"));
        assert!(contains(&out, b"Content-Length: 5\r\n"));
        assert!(out.ends_with(b"\r\n\r\nHello"));
    }

    #[tokio::test]
    async fn streamed_writes_use_chunked_framing() {
        let (mut client, mut server) = pipe();
        {
            let mut response = Response::new(&mut server);
            response.write(b"Hel", false).await.unwrap();
            response.write(b"lo", true).await.unwrap();
        }
        drop(server);
        let out = collect(&mut client).await;

        assert!(contains(&out, b"Transfer-Encoding: chunked\r\n"));
        assert!(out.ends_with(b"\r\n\r\n3\r\nHel\r\n2\r\nlo\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn connection_close_streams_without_framing() {
        let (mut client, mut server) = pipe();
        {
            let mut response = Response::new(&mut server);
            response.set_header(&b"Connection"[..], &b"close"[..]);
            response.write(b"Hel", false).await.unwrap();
            response.write(b"lo", true).await.unwrap();
        }
        drop(server);
        let out = collect(&mut client).await;

        assert!(!contains(&out, b"Transfer-Encoding"));
        assert!(!contains(&out, b"Content-Length"));
        assert!(out.ends_with(b"\r\n\r\nHello"));
    }

    #[tokio::test]
    async fn writes_after_last_part_are_rejected() {
        let (_client, mut server) = pipe();
        let mut response = Response::new(&mut server);
        response.write(b"done", true).await.unwrap();
        assert!(matches!(
            response.write(b"more", false).await,
            Err(SendError::Finished)
        ));
    }

    #[tokio::test]
    async fn cookies_are_emitted_and_nameless_cookies_dropped() {
        let (mut client, mut server) = pipe();
        {
            let mut response = Response::new(&mut server);
            response.set_cookie(Cookie::new(&b"sessionid"[..], &b"abc"[..]));
            response.set_cookie(Cookie::new(&b""[..], &b"ignored"[..]));
            response.write(b"", true).await.unwrap();
        }
        drop(server);
        let out = collect(&mut client).await;

        assert!(contains(&out, b"Set-Cookie: sessionid=abc; Version=1\r\n"));
        assert!(!contains(&out, b"ignored"));
    }

    #[tokio::test]
    async fn redirect_sets_status_and_location() {
        let (mut client, mut server) = pipe();
        {
            let mut response = Response::new(&mut server);
            response.redirect(&b"/other"[..]).await.unwrap();
        }
        drop(server);
        let out = collect(&mut client).await;

        assert!(out.starts_with(b"HTTP/1.1 303 See Other\r\n"));
        assert!(contains(&out, b"Location: /other\r\n"));
        assert!(out.ends_with(b"Redirect"));
    }

    #[tokio::test]
    async fn header_replacement_is_last_wins() {
        let (_client, mut server) = pipe();
        let mut response = Response::new(&mut server);
        response.set_header(&b"X-A"[..], &b"1"[..]);
        response.set_header(&b"X-A"[..], &b"2"[..]);
        assert_eq!(&response.header(b"x-a").unwrap()[..], b"2");
    }
}
