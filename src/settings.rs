use std::path::PathBuf;

use serde::Deserialize;

/// Listener, pool and parser configuration.
///
/// Field names deserialize from the conventional camelCase settings keys
/// (`maxRequestSize`, `sslKeyFile`, ...), so an existing settings file can be
/// loaded with any serde format. Missing keys take the documented defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Interface to bind. Empty means any interface.
    pub host: String,
    /// Port to bind. 0 lets the OS pick an ephemeral port.
    pub port: u16,
    /// Number of idle connection handlers the trimmer keeps warm.
    pub min_threads: usize,
    /// Hard cap on the number of connection handlers.
    pub max_threads: usize,
    /// Interval of the pool trimmer, in milliseconds.
    pub cleanup_interval: u64,
    /// Read timeout per connection, in milliseconds.
    pub read_timeout: u64,
    /// Maximum size of a non-multipart request (line, headers and body).
    pub max_request_size: usize,
    /// Maximum size of a multipart request body spooled to disk.
    pub max_multi_part_size: usize,
    /// PEM private key file. TLS is enabled when both files are set.
    pub ssl_key_file: Option<PathBuf>,
    /// PEM certificate file. TLS is enabled when both files are set.
    pub ssl_cert_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            min_threads: 1,
            max_threads: 100,
            cleanup_interval: 1000,
            read_timeout: 10_000,
            max_request_size: 16_000,
            max_multi_part_size: 1_000_000,
            ssl_key_file: None,
            ssl_cert_file: None,
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Name of the session cookie.
    pub cookie_name: String,
    /// Path attribute of the session cookie. Empty means not set.
    pub cookie_path: String,
    /// Comment attribute of the session cookie. Empty means not set.
    pub cookie_comment: String,
    /// Domain attribute of the session cookie. Empty means not set.
    pub cookie_domain: String,
    /// Idle time after which a session expires, in milliseconds.
    pub expiration_time: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: "sessionid".to_owned(),
            cookie_path: String::new(),
            cookie_comment: String::new(),
            cookie_domain: String::new(),
            expiration_time: 3_600_000,
        }
    }
}
