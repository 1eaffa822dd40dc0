//! Embeddable HTTP/1.x server library.
//!
//! A [`HttpListener`] accepts TCP (optionally TLS) connections and hands
//! each one to a pooled, long-lived connection handler, which parses
//! requests incrementally, invokes the application's [`RequestHandler`] and
//! streams the response back with `Content-Length`, chunked or
//! close-delimited framing. Keep-alive and pipelining are handled per
//! connection; an in-process [`SessionStore`] keyed by cookie is included.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use hearth_http::{HttpListener, Request, RequestHandler, Response, ServerSettings};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl RequestHandler for Hello {
//!     async fn service(&self, _request: &Request, response: &mut Response<'_>) {
//!         let _ = response.write(b"Hello", true).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hearth_http::ServerError> {
//!     let settings = ServerSettings { port: 8080, ..ServerSettings::default() };
//!     let listener = HttpListener::bind(settings, Arc::new(Hello)).await?;
//!     println!("listening on {}", listener.local_addr());
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```

pub mod cookie;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod settings;

mod connection;
mod error;
mod server;

pub use cookie::Cookie;
pub use error::ServerError;
pub use handler::RequestHandler;
pub use protocol::{ByteMultiMap, Request, RequestStatus, Response, SendError, UploadedFile};
pub use server::HttpListener;
pub use session::{Session, SessionStore, SessionValue};
pub use settings::{ServerSettings, SessionSettings};
