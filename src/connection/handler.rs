use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::connection::pool::PoolShared;
use crate::connection::transport::Transport;
use crate::protocol::{Request, RequestStatus, Response};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) enum HandlerMessage {
    Connection(TcpStream, SocketAddr),
    Shutdown,
}

/// Long-lived worker owning one connection at a time.
///
/// The pool hands accepted sockets over through the message queue; all
/// socket I/O, timer handling and request/response mutation happen inside
/// this task, so responses to pipelined requests go out in arrival order.
pub(crate) struct ConnectionHandler {
    id: u64,
    shared: Arc<PoolShared>,
    receiver: mpsc::Receiver<HandlerMessage>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        id: u64,
        shared: Arc<PoolShared>,
        receiver: mpsc::Receiver<HandlerMessage>,
    ) -> Self {
        Self { id, shared, receiver }
    }

    pub(crate) async fn run(mut self) {
        debug!(handler = self.id, "connection handler started");
        while let Some(message) = self.receiver.recv().await {
            match message {
                HandlerMessage::Connection(stream, peer) => {
                    debug!(handler = self.id, peer = %peer, "handle new connection");
                    self.serve(stream, peer).await;
                    self.shared.release(self.id);
                }
                HandlerMessage::Shutdown => break,
            }
        }
        debug!(handler = self.id, "connection handler stopped");
    }

    /// Drive one connection from accept to close.
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let read_timeout = Duration::from_millis(self.shared.settings.read_timeout);

        let mut stream = match &self.shared.tls {
            Some(acceptor) => {
                match tokio::time::timeout(read_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => Transport::Tls(Box::new(tls)),
                    Ok(Err(e)) => {
                        warn!(handler = self.id, cause = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        debug!(handler = self.id, "TLS handshake timed out");
                        return;
                    }
                }
            }
            None => Transport::Plain(stream),
        };

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let timer = sleep(read_timeout);
        tokio::pin!(timer);
        let mut request: Option<Request> = None;

        loop {
            if buf.is_empty() {
                tokio::select! {
                    result = stream.read_buf(&mut buf) => match result {
                        Ok(0) => {
                            debug!(handler = self.id, "disconnected");
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(handler = self.id, cause = %e, "read error");
                            return;
                        }
                    },
                    _ = timer.as_mut() => {
                        debug!(handler = self.id, "read timeout occurred");
                        // Deliberately no 408 status line here: some legacy
                        // clients cannot handle it. Drain and close.
                        let _ = stream.shutdown().await;
                        return;
                    }
                }
            }

            let mut req = request
                .take()
                .unwrap_or_else(|| Request::new(&self.shared.settings, peer));
            while !buf.is_empty() && req.status().is_receiving() {
                req.feed(&mut buf);
                if req.status() == RequestStatus::AwaitingBody {
                    // keep large uploads from tripping the read timeout
                    timer.as_mut().reset(Instant::now() + read_timeout);
                }
            }

            match req.status() {
                RequestStatus::Aborted => {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 413 entity too large\r\nConnection: close\r\n\r\n\
                              413 Entity too large\r\n",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                    return;
                }
                RequestStatus::Complete => {
                    debug!(handler = self.id, "received request");
                    let close = self.dispatch(&mut stream, &req).await;
                    drop(req);
                    if close {
                        let _ = stream.shutdown().await;
                        return;
                    }
                    // keep-alive: wait for the next pipelined request
                    timer.as_mut().reset(Instant::now() + read_timeout);
                }
                _ => {
                    // buffer exhausted mid-request, keep collecting
                    request = Some(req);
                }
            }
        }
    }

    /// Invoke the user handler for a completed request and settle the
    /// framing. Returns whether the connection must be closed afterwards.
    async fn dispatch(&self, stream: &mut Transport, request: &Request) -> bool {
        let mut close_connection = request
            .header(b"connection")
            .is_some_and(|value| value.eq_ignore_ascii_case(b"close"));

        let mut response = Response::new(stream);
        if close_connection {
            response.set_header(&b"Connection"[..], &b"close"[..]);
        } else if request.version().eq_ignore_ascii_case(b"HTTP/1.0") {
            // HTTP/1.0 cannot do chunked transfer, so the response must be
            // framed by closing the connection
            close_connection = true;
            response.set_header(&b"Connection"[..], &b"close"[..]);
        }

        let service = self.shared.service.service(request, &mut response);
        if AssertUnwindSafe(service).catch_unwind().await.is_err() {
            error!(handler = self.id, "uncaught panic in the request handler");
        }

        if !response.has_sent_last_part() {
            if let Err(e) = response.write(b"", true).await {
                warn!(handler = self.id, cause = %e, "cannot finalize response");
                return true;
            }
        }

        if !close_connection {
            if response
                .header(b"connection")
                .is_some_and(|value| value.eq_ignore_ascii_case(b"close"))
            {
                // the request handler asked for the close
                close_connection = true;
            } else if response.header(b"content-length").is_none() {
                let chunked = response
                    .header(b"transfer-encoding")
                    .is_some_and(|value| value.eq_ignore_ascii_case(b"chunked"));
                if !chunked {
                    // without framing the client can only detect the end of
                    // the response by the connection closing
                    close_connection = true;
                }
            }
        }

        close_connection || !response.is_connected()
    }
}
