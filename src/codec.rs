/*!
 * HTTP/1.1 Message Codec
 *
 * Byte-level grammar for the request/response subset the server speaks.
 * Parsing is incremental: callers hand in whatever has been received so far
 * and get `Ok(None)` back until a complete message (head plus a body of
 * Content-Length bytes) is available. Encoding appends into a `BytesMut`.
 * Nothing here touches a socket.
 *
 * Request grammar:
 *   METHOD SP TARGET SP VERSION CRLF
 *   *( Key ":" Value CRLF )
 *   CRLF
 *   body (Content-Length bytes, or none)
 */

use crate::error::ProtocolError;
use crate::message::{Headers, HttpMessage, Method, Request, Response, StatusCode, Version};
use bytes::{Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Start line and headers of a message, before the body is attached
struct Head<'a> {
    start_line: &'a str,
    headers: Headers,
    /// Bytes consumed up to and including the blank line
    len: usize,
}

/// Parse a single request from the front of `data`
///
/// # Returns
/// * `Ok(Some((consumed_bytes, request)))` - A full request was available
/// * `Ok(None)` - Incomplete head or body, need more bytes
/// * `Err(...)` - Malformed start line/header, or unsupported version
pub fn parse_request(data: &[u8]) -> Result<Option<(usize, Request)>, ProtocolError> {
    let head = match split_head(data)? {
        Some(h) => h,
        None => return Ok(None),
    };

    let mut parts = head.start_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !t.is_empty() => (m, t, v),
        _ => {
            return Err(ProtocolError::Malformed(format!(
                "invalid start line `{}`",
                head.start_line
            )))
        }
    };
    let method: Method = method.parse()?;
    let version: Version = version.parse()?;

    let total = message_end(&head)?;
    if data.len() < total {
        return Ok(None); // Body still in flight
    }

    let mut request = Request::new(method, target);
    request.set_version(version);
    *request.headers_mut() = head.headers;
    request.replace_body(Bytes::copy_from_slice(&data[head.len..total]));

    Ok(Some((total, request)))
}

/// Parse a single response from the front of `data`
///
/// Counterpart of `parse_request` for the client side. A response without a
/// Content-Length header is taken to have an empty body.
pub fn parse_response(data: &[u8]) -> Result<Option<(usize, Response)>, ProtocolError> {
    let head = match split_head(data)? {
        Some(h) => h,
        None => return Ok(None),
    };

    let mut parts = head.start_line.splitn(3, ' ');
    let version: Version = parts
        .next()
        .ok_or_else(|| ProtocolError::Malformed("empty status line".into()))?
        .parse()?;
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| {
            ProtocolError::Malformed(format!("invalid status line `{}`", head.start_line))
        })?;

    let total = message_end(&head)?;
    if data.len() < total {
        return Ok(None);
    }

    let mut response = Response::new(status);
    response.set_version(version);
    *response.headers_mut() = head.headers;
    response.replace_body(Bytes::copy_from_slice(&data[head.len..total]));

    Ok(Some((total, response)))
}

/// Serialize a response
///
/// When `send_body` is false (HEAD requests) the body bytes are left out but
/// the headers, Content-Length included, are written unchanged.
pub fn encode_response(response: &Response, send_body: bool, out: &mut BytesMut) {
    let status = response.status();
    let reason = status.reason_phrase();
    out.reserve(64 + response.content_length());

    out.extend_from_slice(response.version().as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(status.as_u16().to_string().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(reason.as_bytes());
    out.extend_from_slice(CRLF);
    write_headers(response.headers(), out);
    if send_body {
        out.extend_from_slice(response.body());
    }
}

/// Serialize a request
pub fn encode_request(request: &Request, out: &mut BytesMut) {
    out.reserve(64 + request.content_length());

    out.extend_from_slice(request.method().as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(request.target().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(request.version().as_str().as_bytes());
    out.extend_from_slice(CRLF);
    write_headers(request.headers(), out);
    out.extend_from_slice(request.body());
}

/// Header lines in insertion order followed by the blank line
fn write_headers(headers: &Headers, out: &mut BytesMut) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(CRLF);
}

/// Split off the start line and headers once the blank line has arrived
fn split_head(data: &[u8]) -> Result<Option<Head<'_>>, ProtocolError> {
    let end = match find(data, HEAD_END) {
        Some(i) => i,
        None => return Ok(None),
    };

    let text = std::str::from_utf8(&data[..end])
        .map_err(|_| ProtocolError::Malformed("message head is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or_default();

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid header line `{}`", line)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProtocolError::Malformed(format!("empty header name in `{}`", line)));
        }
        headers.set(name, value.trim());
    }

    Ok(Some(Head {
        start_line,
        headers,
        len: end + HEAD_END.len(),
    }))
}

/// Offset just past the body: head length plus the declared body length
fn message_end(head: &Head<'_>) -> Result<usize, ProtocolError> {
    let body_len = declared_length(&head.headers)?;
    head.len.checked_add(body_len).ok_or_else(|| {
        ProtocolError::Malformed(format!("Content-Length {} is out of range", body_len))
    })
}

/// Body length announced by Content-Length, zero when absent
fn declared_length(headers: &Headers) -> Result<usize, ProtocolError> {
    match headers.get("Content-Length") {
        None => Ok(0),
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ProtocolError::Malformed(format!("invalid Content-Length `{}`", v))),
    }
}

#[inline]
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
