//! Decode HTTP requests on the server.

use std::str::FromStr;

use futures_lite::io::{AsyncBufReadExt, AsyncRead as Read, AsyncReadExt, BufReader};
use http_types::headers::{CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http_types::{Method, Request, Url, Version};

use crate::message::InboundEvent;
use crate::{Error, Result, MAX_HEADERS, MAX_HEAD_LENGTH};

const LF: u8 = b'\n';

/// The number returned from httparse when the request is HTTP 1.1
const HTTP_1_1_VERSION: u8 = 1;
/// The number returned from httparse when the request is HTTP 1.0
const HTTP_1_0_VERSION: u8 = 0;

pub(crate) const CONTINUE_HEADER_VALUE: &str = "100-continue";
pub(crate) const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Chunk sizes above this are treated as malformed.
const MAX_CHUNK_SIZE: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// How a request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyMode {
    /// No body framing headers: the request carries no body.
    None,
    /// `Content-Length` framing with the given number of bytes.
    Fixed(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
}

/// Decode the head of an HTTP request.
///
/// Returns `None` when the peer closed the stream before sending anything.
pub(crate) async fn decode_head<IO>(
    reader: &mut BufReader<IO>,
) -> Result<Option<(Request, BodyMode)>>
where
    IO: Read + Unpin,
{
    let mut buf = Vec::new();
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut httparse_req = httparse::Request::new(&mut headers);

    // Keep reading bytes from the stream until we hit the end of the head.
    loop {
        let bytes_read = reader.read_until(LF, &mut buf).await?;
        // No more bytes are yielded from the stream.
        if bytes_read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Protocol("unexpected eof in request head".into()));
        }

        // Prevent CWE-400 DDOS with large HTTP Headers.
        if buf.len() >= MAX_HEAD_LENGTH {
            return Err(Error::Protocol(
                "head byte length should be less than 8kb".into(),
            ));
        }

        // We've hit the end delimiter of the stream.
        let idx = buf.len() - 1;
        if idx >= 3 && &buf[idx - 3..=idx] == b"\r\n\r\n" {
            break;
        }
    }

    // Convert our header buf into an httparse instance, and validate.
    let status = httparse_req
        .parse(&buf)
        .map_err(|e| Error::Protocol(format!("malformed HTTP head: {}", e)))?;
    if status.is_partial() {
        return Err(Error::Protocol("malformed HTTP head".into()));
    }

    let method = httparse_req
        .method
        .ok_or_else(|| Error::Protocol("no method found".into()))?;
    let method =
        Method::from_str(method).map_err(|_| Error::Protocol("unknown method".into()))?;

    let version = match httparse_req.version {
        Some(HTTP_1_1_VERSION) => Version::Http1_1,
        Some(HTTP_1_0_VERSION) => Version::Http1_0,
        v => {
            return Err(Error::Protocol(format!(
                "unsupported HTTP version 1.{:?}",
                v
            )))
        }
    };

    let url = url_from_httparse_req(&httparse_req, method)?;

    let mut req = Request::new(method, url);
    req.set_version(Some(version));

    for header in httparse_req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Protocol("header value is not utf8".into()))?;
        req.append_header(header.name, value);
    }

    let content_length = req.header(CONTENT_LENGTH);
    let transfer_encoding = req.header(TRANSFER_ENCODING);

    if content_length.is_some() && transfer_encoding.is_some() {
        return Err(Error::Protocol("unexpected content-length header".into()));
    }

    if let Some(encoding) = transfer_encoding {
        if encoding.last().as_str() == "chunked" {
            return Ok(Some((req, BodyMode::Chunked)));
        }
        // Fall through to Content-Length
    }

    let body = match content_length {
        Some(len) => {
            let len = len
                .last()
                .as_str()
                .parse::<u64>()
                .map_err(|_| Error::Protocol("invalid content-length header".into()))?;
            BodyMode::Fixed(len)
        }
        None => BodyMode::None,
    };

    Ok(Some((req, body)))
}

/// Whether the request declared `Expect: 100-continue`.
pub(crate) fn expects_continue(req: &Request) -> bool {
    req.header(EXPECT)
        .map(|expect| expect.last().as_str().eq_ignore_ascii_case(CONTINUE_HEADER_VALUE))
        .unwrap_or(false)
}

fn url_from_httparse_req(req: &httparse::Request<'_, '_>, method: Method) -> Result<Url> {
    let path = req
        .path
        .ok_or_else(|| Error::Protocol("no uri found".into()))?;
    let host = req
        .headers
        .iter()
        .find(|x| x.name.eq_ignore_ascii_case("host"))
        .ok_or_else(|| Error::Protocol("mandatory host header missing".into()))?
        .value;
    let host = std::str::from_utf8(host)
        .map_err(|_| Error::Protocol("host header is not utf8".into()))?;

    let parse = |s: &str| Url::parse(s).map_err(|e| Error::Protocol(e.to_string()));

    if path.starts_with("http://") || path.starts_with("https://") {
        parse(path)
    } else if path.starts_with('/') {
        parse(&format!("http://{}/", host))?
            .join(path)
            .map_err(|e| Error::Protocol(e.to_string()))
    } else if method == Method::Connect {
        parse(&format!("http://{}/", path))
    } else {
        Err(Error::Protocol("unexpected uri format".into()))
    }
}

/// Incrementally decodes the body of one request into [`InboundEvent`]s.
///
/// Emits any number of `Chunk` events followed by exactly one `Last` event.
/// For fixed-length bodies the final bytes arrive on the `Last` event; a
/// chunked body always terminates with an empty `Last` once the zero-size
/// chunk and trailers have been consumed.
#[derive(Debug)]
pub(crate) struct BodyReader {
    mode: BodyMode,
    /// Bytes left in the fixed-length body, or in the current chunk.
    remaining: u64,
    in_chunk: bool,
}

impl BodyReader {
    pub(crate) fn new(mode: BodyMode) -> Self {
        let remaining = match mode {
            BodyMode::Fixed(len) => len,
            _ => 0,
        };
        BodyReader {
            mode,
            remaining,
            in_chunk: false,
        }
    }

    pub(crate) async fn next_event<IO>(
        &mut self,
        reader: &mut BufReader<IO>,
    ) -> Result<InboundEvent>
    where
        IO: Read + Unpin,
    {
        match self.mode {
            BodyMode::None => Ok(InboundEvent::Last(vec![])),
            BodyMode::Fixed(_) => self.next_fixed(reader).await,
            BodyMode::Chunked => self.next_chunked(reader).await,
        }
    }

    async fn next_fixed<IO>(&mut self, reader: &mut BufReader<IO>) -> Result<InboundEvent>
    where
        IO: Read + Unpin,
    {
        if self.remaining == 0 {
            return Ok(InboundEvent::Last(vec![]));
        }
        let data = read_some(reader, self.remaining).await?;
        self.remaining -= data.len() as u64;
        if self.remaining == 0 {
            Ok(InboundEvent::Last(data))
        } else {
            Ok(InboundEvent::Chunk(data))
        }
    }

    async fn next_chunked<IO>(&mut self, reader: &mut BufReader<IO>) -> Result<InboundEvent>
    where
        IO: Read + Unpin,
    {
        if self.in_chunk {
            if self.remaining == 0 {
                // chunk data is followed by CRLF
                let mut crlf = [0u8; 2];
                reader.read_exact(&mut crlf).await?;
                self.in_chunk = false;
            } else {
                let data = read_some(reader, self.remaining).await?;
                self.remaining -= data.len() as u64;
                return Ok(InboundEvent::Chunk(data));
            }
        }

        let mut line = Vec::new();
        let n = reader.read_until(LF, &mut line).await?;
        if n == 0 {
            return Err(Error::Protocol(
                "unexpected eof while reading request body".into(),
            ));
        }
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // discard trailers up to the final empty line
            loop {
                line.clear();
                let n = reader.read_until(LF, &mut line).await?;
                if n == 0 || line == b"\r\n" || line == b"\n" {
                    break;
                }
            }
            return Ok(InboundEvent::Last(vec![]));
        }

        self.in_chunk = true;
        self.remaining = size;
        let data = read_some(reader, self.remaining).await?;
        self.remaining -= data.len() as u64;
        Ok(InboundEvent::Chunk(data))
    }
}

/// Read up to 8kb from the body, never past `limit`.
async fn read_some<IO>(reader: &mut BufReader<IO>, limit: u64) -> Result<Vec<u8>>
where
    IO: Read + Unpin,
{
    let cap = limit.min(8 * 1024) as usize;
    let mut buf = vec![0; cap];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(Error::Protocol(
            "unexpected eof while reading request body".into(),
        ));
    }
    buf.truncate(n);
    Ok(buf)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let mut size: u64 = 0;
    let mut digits = 0;
    for c in line.iter().copied() {
        match c {
            b'0'..=b'9' => size = (size << 4) + (c - b'0') as u64,
            b'a'..=b'f' => size = (size << 4) + (c + 10 - b'a') as u64,
            b'A'..=b'F' => size = (size << 4) + (c + 10 - b'A') as u64,
            b';' | b'\r' => break,
            _ => return Err(Error::Protocol("invalid chunk size".into())),
        }
        digits += 1;
        if size > MAX_CHUNK_SIZE {
            return Err(Error::Protocol("invalid chunk size".into()));
        }
    }
    if digits == 0 {
        return Err(Error::Protocol("invalid chunk size".into()));
    }
    Ok(size)
}
