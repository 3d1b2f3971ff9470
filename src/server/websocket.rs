//! Websocket upgrade handoff.
//!
//! An upgrade consumes the HTTP exchange irrevocably: once the `101
//! Switching Protocols` head is on the wire the connection speaks a duplex
//! framed protocol and no further plain-HTTP writes are possible. The
//! framing of individual websocket messages is left to the handler; the
//! engine hands it the raw duplex byte streams.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::io::{AsyncRead as Read, AsyncWrite as Write};
use http_types::headers::HeaderValues;
use log::{debug, trace};
use sha1::{Digest, Sha1};

use crate::{Error, Exception};

/// Fixed GUID appended to the client key, per RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The boxed handler invoked once the handshake has been confirmed.
pub(crate) type WebsocketHandlerFn = Box<
    dyn FnOnce(
            WebsocketInbound,
            WebsocketOutbound,
        ) -> Pin<Box<dyn Future<Output = Result<(), Exception>> + Send>>
        + Send,
>;

/// A pending websocket upgrade, produced by [`Outbound::websocket`].
///
/// [`Outbound::websocket`]: crate::server::Outbound::websocket
pub struct WsUpgrade {
    pub(crate) protocols: Option<String>,
    pub(crate) handler: WebsocketHandlerFn,
}

impl WsUpgrade {
    pub(crate) fn new<F, Fut>(protocols: Option<&str>, handler: F) -> Self
    where
        F: FnOnce(WebsocketInbound, WebsocketOutbound) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Exception>> + Send + 'static,
    {
        WsUpgrade {
            protocols: protocols.map(String::from),
            handler: Box::new(move |inbound, outbound| Box::pin(handler(inbound, outbound))),
        }
    }
}

impl fmt::Debug for WsUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsUpgrade")
            .field("protocols", &self.protocols)
            .finish()
    }
}

/// The exchange that supersedes the HTTP exchange after an upgrade.
///
/// Owns the single-fire handshake result and the negotiated sub-protocol.
#[derive(Debug)]
pub struct WebsocketExchange {
    subprotocol: Option<String>,
    result: async_channel::Receiver<bool>,
}

/// The sending half of the handshake result. Fires exactly once.
#[derive(Debug)]
pub(crate) struct HandshakeSignal {
    tx: async_channel::Sender<bool>,
}

impl HandshakeSignal {
    pub(crate) fn confirm(self) {
        let _ = self.tx.try_send(true);
    }

    pub(crate) fn fail(self) {
        let _ = self.tx.try_send(false);
    }
}

impl WebsocketExchange {
    pub(crate) fn new(subprotocol: Option<String>) -> (Self, HandshakeSignal) {
        let (tx, rx) = async_channel::bounded(1);
        (
            WebsocketExchange {
                subprotocol,
                result: rx,
            },
            HandshakeSignal { tx },
        )
    }

    /// The sub-protocol negotiated during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Wait for the handshake result signal to fire.
    pub(crate) async fn handshake(&self) -> crate::Result<()> {
        match self.result.recv().await {
            Ok(true) => Ok(()),
            _ => Err(Error::Upgrade("failed to upgrade to websocket")),
        }
    }

    /// The handler finished cleanly.
    pub(crate) fn complete(&self) {
        trace!("websocket exchange completed");
    }

    /// The handler failed; the error travels back to the upgrade caller.
    pub(crate) fn on_handler_error(&self, err: &Exception) {
        debug!("websocket handler failed: {}", err);
    }
}

/// The inbound frame stream of an upgraded connection.
pub struct WebsocketInbound {
    reader: Box<dyn Read + Send + Unpin>,
    subprotocol: Option<String>,
}

impl WebsocketInbound {
    pub(crate) fn new(reader: Box<dyn Read + Send + Unpin>, subprotocol: Option<String>) -> Self {
        WebsocketInbound {
            reader,
            subprotocol,
        }
    }

    /// The sub-protocol negotiated during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }
}

impl Read for WebsocketInbound {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl fmt::Debug for WebsocketInbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketInbound")
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

/// The outbound frame stream of an upgraded connection.
pub struct WebsocketOutbound {
    writer: Box<dyn Write + Send + Unpin>,
    subprotocol: Option<String>,
}

impl WebsocketOutbound {
    pub(crate) fn new(writer: Box<dyn Write + Send + Unpin>, subprotocol: Option<String>) -> Self {
        WebsocketOutbound {
            writer,
            subprotocol,
        }
    }

    /// The sub-protocol negotiated during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }
}

impl Write for WebsocketOutbound {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_close(cx)
    }
}

impl fmt::Debug for WebsocketOutbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketOutbound")
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

/// Pick the first sub-protocol both sides support.
pub(crate) fn negotiate_subprotocol(
    offered: Option<&str>,
    requested: Option<&HeaderValues>,
) -> Option<String> {
    let offered = offered?;
    let requested = requested?;
    for offer in offered.split(',').map(str::trim) {
        for value in requested.iter() {
            if value
                .as_str()
                .split(',')
                .map(str::trim)
                .any(|p| p.eq_ignore_ascii_case(offer))
            {
                return Some(offer.to_owned());
            }
        }
    }
    None
}

/// Serialize the `101 Switching Protocols` head.
pub(crate) fn switching_protocols_head(accept: &str, subprotocol: Option<&str>) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {}\r\n",
        accept
    );
    if let Some(protocol) = subprotocol {
        head.push_str(&format!("sec-websocket-protocol: {}\r\n", protocol));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_the_rfc_sample() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn subprotocol_negotiation_picks_the_first_shared_one() {
        let url = http_types::Url::parse("http://example.com/").unwrap();
        let mut req = http_types::Request::new(http_types::Method::Get, url);
        req.insert_header("sec-websocket-protocol", "chat, superchat");
        let requested = req.header("sec-websocket-protocol");

        assert_eq!(
            negotiate_subprotocol(Some("superchat, chat"), requested),
            Some("superchat".to_owned())
        );
        assert_eq!(negotiate_subprotocol(Some("other"), requested), None);
        assert_eq!(negotiate_subprotocol(None, requested), None);
    }

    #[test]
    fn switching_protocols_head_includes_the_negotiated_protocol() {
        let head = switching_protocols_head("abc=", Some("chat"));
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("sec-websocket-accept: abc=\r\n"));
        assert!(text.contains("sec-websocket-protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
