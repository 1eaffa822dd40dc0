use std::io;

use thiserror::Error;

/// Errors raised while starting or stopping the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("cannot load TLS configuration: {reason}")]
    Tls { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}
