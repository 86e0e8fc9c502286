/*!
 * Protocol Errors
 *
 * Failures that happen while turning bytes into a request or a request into
 * a response. None of them close the connection: each one is rendered as a
 * structured error response and sent back to the peer.
 */

use crate::message::{HttpMessage, Response, StatusCode};
use thiserror::Error;

/// Recoverable failure on the request path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Start line, header line or Content-Length could not be parsed
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Version token is well-formed but not one we speak
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),
    /// Anything else that went wrong while producing a response
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Status code reported to the peer for this failure
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::Malformed(_) => StatusCode::BadRequest,
            ProtocolError::UnsupportedVersion(_) => StatusCode::HttpVersionNotSupported,
            ProtocolError::Internal(_) => StatusCode::InternalServerError,
        }
    }

    /// Build the error response; the body carries the error description.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status());
        response.set_body(self.to_string());
        response
    }
}
