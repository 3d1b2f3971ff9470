//! Encode HTTP responses on the server.

use std::io::Write as _;

use http_types::headers::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http_types::Response;

/// The terminal marker of a chunked body.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Serialize the status line and headers of a response.
///
/// `Content-Length` is skipped whenever the response is framed with
/// `Transfer-Encoding: chunked`; exactly one of the two framing headers ends
/// up on the wire.
pub(crate) fn head(res: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    let status = res.status();
    let reason = status.canonical_reason();
    // serializing into a Vec never fails
    let _ = write!(buf, "HTTP/1.1 {} {}\r\n", status, reason);

    let chunked = is_chunked(res);
    for (name, values) in res.iter() {
        if chunked && name == &CONTENT_LENGTH {
            continue;
        }
        for value in values.iter() {
            let _ = write!(buf, "{}: {}\r\n", name, value);
        }
    }

    let _ = write!(buf, "\r\n");
    buf
}

/// Whether the response asks for chunked transfer framing.
pub(crate) fn is_chunked(res: &Response) -> bool {
    res.header(TRANSFER_ENCODING)
        .map(|te| {
            te.iter()
                .any(|value| value.as_str().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

/// Frame one chunk of body data.
pub(crate) fn chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 8);
    let _ = write!(buf, "{:X}\r\n", data.len());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

/// The full response written when outbound processing fails before any
/// headers went out.
pub(crate) fn error_head() -> Vec<u8> {
    b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        .to_vec()
}
