use async_trait::async_trait;

use crate::protocol::{Request, Response};

/// Application entry point: called once per completed request.
///
/// The handler writes the response through [`Response`]; if it never calls
/// `write(.., true)` the connection handler finalizes the response with an
/// empty last write. Panics are caught, logged and otherwise ignored; the
/// connection then follows the normal close policy. Neither reference may
/// be retained beyond the call.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn service(&self, request: &Request, response: &mut Response<'_>);
}
