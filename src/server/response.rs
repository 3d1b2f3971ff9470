//! The mutable response half of an exchange.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use http_types::cookies::Cookie;
use http_types::headers::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http_types::{Response, StatusCode};

use crate::server::encode;
use crate::server::{empty_body, OutboundStream};
use crate::{Error, Result};

const HEADERS_SENT: u8 = 1;
const BODY_SENT: u8 = 1 << 1;

/// Tracks what has been written for the current exchange.
///
/// Two monotonic flags form the state: `INIT` (nothing sent), `HEADERS`
/// (head flushed) and `DONE` (body terminated). Transitions are one-way and
/// atomic; whichever caller first marks a flag wins, which is also what
/// arbitrates racing upgrade attempts.
pub(crate) struct FramingState(AtomicU8);

impl FramingState {
    fn new() -> Self {
        FramingState(AtomicU8::new(0))
    }

    pub(crate) fn has_sent_headers(&self) -> bool {
        self.0.load(Ordering::SeqCst) & HEADERS_SENT != 0
    }

    pub(crate) fn has_sent_body(&self) -> bool {
        self.0.load(Ordering::SeqCst) & BODY_SENT != 0
    }

    /// Mark the headers as sent. Returns `true` only for the caller that
    /// performed the transition.
    pub(crate) fn mark_headers(&self) -> bool {
        self.0.fetch_or(HEADERS_SENT, Ordering::SeqCst) & HEADERS_SENT == 0
    }

    /// Mark the body (and implicitly the headers) as sent. Returns `true`
    /// only for the caller that performed the body transition.
    pub(crate) fn mark_body(&self) -> bool {
        self.0.fetch_or(HEADERS_SENT | BODY_SENT, Ordering::SeqCst) & BODY_SENT == 0
    }

    /// Mark headers and body as sent in one step. Returns `true` only if the
    /// headers had not been sent before.
    pub(crate) fn mark_headers_and_body(&self) -> bool {
        self.0.fetch_or(HEADERS_SENT | BODY_SENT, Ordering::SeqCst) & HEADERS_SENT == 0
    }
}

impl fmt::Debug for FramingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramingState")
            .field("headers_sent", &self.has_sent_headers())
            .field("body_sent", &self.has_sent_body())
            .finish()
    }
}

/// The response under construction for one exchange.
///
/// The handle is cheap to clone; all clones share the same state. Status and
/// headers stay mutable until the head is flushed to the transport, after
/// which every mutator fails with a state error and leaves the response
/// unchanged.
#[derive(Clone, Debug)]
pub struct ServerResponse {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    res: Mutex<Response>,
    framing: FramingState,
    persist: AtomicBool,
}

impl ServerResponse {
    /// A new `200 OK` response, framed chunked until told otherwise.
    pub(crate) fn new() -> Self {
        let this = ServerResponse {
            inner: Arc::new(Inner {
                res: Mutex::new(Response::new(StatusCode::Ok)),
                framing: FramingState::new(),
                persist: AtomicBool::new(true),
            }),
        };
        this.chunked_transfer(true);
        this
    }

    fn lock(&self) -> MutexGuard<'_, Response> {
        self.inner.res.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self) -> Result<()> {
        if self.inner.framing.has_sent_headers() {
            return Err(Error::State("status and headers already sent"));
        }
        Ok(())
    }

    /// The current status code.
    pub fn status(&self) -> StatusCode {
        self.lock().status()
    }

    /// Set the status code.
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        self.guard()?;
        self.lock().set_status(status);
        Ok(())
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn add_header(&self, name: &str, value: &str) -> Result<()> {
        self.guard()?;
        self.lock().append_header(name, value);
        Ok(())
    }

    /// Set a header, replacing any existing values for the same name.
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        self.guard()?;
        self.lock().insert_header(name, value);
        Ok(())
    }

    /// Replace all headers.
    pub fn set_headers<'a, I>(&self, headers: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.guard()?;
        let mut res = self.lock();
        let names: Vec<String> = res.iter().map(|(name, _)| name.to_string()).collect();
        for name in names {
            res.remove_header(name.as_str());
        }
        for (name, value) in headers {
            res.append_header(name, value);
        }
        Ok(())
    }

    /// Append a `Set-Cookie` header with the encoded cookie.
    pub fn add_cookie(&self, cookie: Cookie<'_>) -> Result<()> {
        self.guard()?;
        self.lock()
            .append_header("set-cookie", cookie.to_string().as_str());
        Ok(())
    }

    /// Mark the response as a server-sent event stream.
    pub fn sse(&self) -> Result<()> {
        self.set_header("content-type", "text/event-stream")
    }

    /// Switch between chunked and length-delimited body framing.
    ///
    /// The framing headers only change while the head is unsent; the
    /// persistence flag is recomputed either way.
    pub fn chunked_transfer(&self, chunked: bool) -> &Self {
        if !self.inner.framing.has_sent_headers() {
            let mut res = self.lock();
            if encode::is_chunked(&res) != chunked {
                res.remove_header(TRANSFER_ENCODING);
                if chunked {
                    res.insert_header(TRANSFER_ENCODING, "chunked");
                    res.remove_header(CONTENT_LENGTH);
                }
            }
        }
        self.inner.persist.store(chunked, Ordering::SeqCst);
        self
    }

    /// Force the connection persistence decision for this response.
    pub fn keep_alive(&self, keep_alive: bool) -> &Self {
        let mut res = self.lock();
        if keep_alive {
            res.remove_header("connection");
        } else {
            res.insert_header("connection", "close");
        }
        self.inner.persist.store(keep_alive, Ordering::SeqCst);
        self
    }

    /// Reply `404 Not Found` with an empty body.
    pub fn send_not_found(&self) -> Result<OutboundStream> {
        self.set_status(StatusCode::NotFound)?;
        Ok(empty_body())
    }

    /// Reply `302 Found` redirecting to `location`, with an empty body.
    pub fn send_redirect(&self, location: &str) -> Result<OutboundStream> {
        self.set_status(StatusCode::Found)?;
        self.set_header("location", location)?;
        Ok(empty_body())
    }

    /// Whether the head has been flushed to the transport.
    pub fn has_sent_headers(&self) -> bool {
        self.inner.framing.has_sent_headers()
    }

    /// Whether the body has been terminated.
    pub fn has_sent_body(&self) -> bool {
        self.inner.framing.has_sent_body()
    }

    pub(crate) fn framing(&self) -> &FramingState {
        &self.inner.framing
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.inner.persist.load(Ordering::SeqCst)
    }

    /// Statuses defined to never carry a body lose their transfer-encoding
    /// and get a zero content-length, whatever the handler set.
    pub(crate) fn is_no_content(&self) -> bool {
        matches!(u16::from(self.status()), 204 | 205 | 304)
    }

    fn apply_no_content_statuses(res: &mut Response) {
        if matches!(u16::from(res.status()), 204 | 205 | 304) {
            res.remove_header(TRANSFER_ENCODING);
            res.insert_header(CONTENT_LENGTH, "0");
        }
    }

    /// Serialize the head for a streamed body. Returns the bytes and whether
    /// the body is chunk-framed.
    pub(crate) fn encode_head(&self) -> (Vec<u8>, bool) {
        let mut res = self.lock();
        Self::apply_no_content_statuses(&mut res);
        let chunked = encode::is_chunked(&res);
        (encode::head(&res), chunked)
    }

    /// Serialize a complete empty-body message: transfer-encoding stripped,
    /// content-length forced to zero.
    pub(crate) fn encode_full_empty_body(&self) -> Vec<u8> {
        let mut res = self.lock();
        Self::apply_no_content_statuses(&mut res);
        res.remove_header(TRANSFER_ENCODING);
        res.insert_header(CONTENT_LENGTH, "0");
        encode::head(&res)
    }
}
