//! The read-only request half of an exchange.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_lite::Stream;
use http_types::cookies::Cookie;
use http_types::headers::HeaderValues;
use http_types::{Method, Request, Url, Version};
use pin_project::pin_project;

use crate::cookies::Cookies;

/// Resolves route parameters for a request path, lazily and per access.
pub type ParamsResolver = Arc<dyn Fn(&str) -> Option<HashMap<String, String>> + Send + Sync>;

/// The parsed request handed to the application handler.
///
/// The head is immutable once parsed. The body is a lazy, backpressured
/// stream of chunks: the engine reads no further ahead than the handler
/// consumes.
pub struct ServerRequest {
    head: Arc<Request>,
    body: Option<BodyStream>,
    cookies: Cookies,
    params_resolver: Option<ParamsResolver>,
}

impl ServerRequest {
    pub(crate) fn new(
        head: Arc<Request>,
        body: BodyStream,
        params_resolver: Option<ParamsResolver>,
    ) -> Self {
        let cookies = Cookies::from_request(&head);
        ServerRequest {
            head,
            body: Some(body),
            cookies,
            params_resolver,
        }
    }

    /// The request method.
    pub fn method(&self) -> Method {
        self.head.method()
    }

    /// The request URL.
    pub fn url(&self) -> &Url {
        self.head.url()
    }

    /// The protocol version the request was made with.
    pub fn version(&self) -> Option<Version> {
        self.head.version()
    }

    /// All values for the named request header.
    pub fn header(&self, name: &str) -> Option<&HeaderValues> {
        self.head.header(name)
    }

    /// Whether the peer asked to keep the connection open after this
    /// exchange.
    pub fn is_keep_alive(&self) -> bool {
        keep_alive_requested(&self.head)
    }

    /// Whether the peer asked to upgrade this connection to a websocket.
    pub fn is_websocket(&self) -> bool {
        upgrade_requested(&self.head)
    }

    /// The request cookies, decoded on first access and cached for the
    /// lifetime of the exchange.
    pub fn cookies(&mut self) -> &HashMap<String, Vec<Cookie<'static>>> {
        self.cookies.cached()
    }

    /// Resolve a single route parameter. Resolution runs on every call and
    /// is never cached.
    pub fn param(&self, key: &str) -> Option<String> {
        let resolver = self.params_resolver.as_ref()?;
        resolver(self.head.url().path())?.remove(key)
    }

    /// Resolve all route parameters for this request's path.
    pub fn params(&self) -> Option<HashMap<String, String>> {
        let resolver = self.params_resolver.as_ref()?;
        resolver(self.head.url().path())
    }

    /// Take the request body stream.
    ///
    /// The body can be taken once; later calls return an exhausted stream.
    pub fn receive(&mut self) -> BodyStream {
        self.body.take().unwrap_or_else(BodyStream::exhausted)
    }
}

impl fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequest")
            .field("method", &self.head.method())
            .field("url", &self.head.url())
            .finish()
    }
}

pub(crate) fn keep_alive_requested(head: &Request) -> bool {
    if let Some(connection) = head.header("connection") {
        let value = connection.last().as_str();
        if value.eq_ignore_ascii_case("close") {
            return false;
        }
        if value.to_ascii_lowercase().contains("keep-alive") {
            return true;
        }
    }
    head.version() == Some(Version::Http1_1)
}

pub(crate) fn upgrade_requested(head: &Request) -> bool {
    head.header("upgrade")
        .map(|upgrade| {
            upgrade
                .iter()
                .any(|value| value.as_str().eq_ignore_ascii_case("websocket"))
        })
        .unwrap_or(false)
}

/// The inbound body of one request as a stream of byte chunks.
///
/// The first poll signals reading interest to the engine, which is what
/// sequences an interim `100 Continue` ahead of the first delivered chunk.
/// Dropping the stream makes the engine drain and discard the rest of the
/// body.
#[pin_project]
pub struct BodyStream {
    #[pin]
    chunks: async_channel::Receiver<Vec<u8>>,
    interest: Option<async_channel::Sender<()>>,
}

impl BodyStream {
    pub(crate) fn new(
        chunks: async_channel::Receiver<Vec<u8>>,
        interest: async_channel::Sender<()>,
    ) -> Self {
        BodyStream {
            chunks,
            interest: Some(interest),
        }
    }

    fn exhausted() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        drop(tx);
        BodyStream {
            chunks: rx,
            interest: None,
        }
    }

    /// Collect the remaining chunks into one buffer.
    pub async fn into_bytes(mut self) -> Vec<u8> {
        use futures_lite::StreamExt;

        let mut buf = Vec::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk);
        }
        buf
    }
}

impl Stream for BodyStream {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if let Some(interest) = this.interest.take() {
            let _ = interest.try_send(());
        }
        this.chunks.poll_next(cx)
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("interest_signaled", &self.interest.is_none())
            .finish()
    }
}
