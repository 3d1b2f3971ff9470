//! Process HTTP connections on the server.
//!
//! [`accept`] binds one transport connection and serves exchanges on it
//! until the peer goes away, the handler breaks the connection, or an
//! upgrade hands the transport to a websocket handler.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_lite::future::zip;
use futures_lite::io::{AsyncRead as Read, AsyncWrite as Write, BufReader};
use futures_lite::Stream;
use log::{debug, trace};

use crate::pipeline::{BridgeStage, BRIDGE};
use crate::{Connection, Error, Exception, Result};

mod decode;
mod encode;
mod exchange;
mod request;
mod response;
mod timeout;
mod websocket;

pub use request::{BodyStream, ParamsResolver, ServerRequest};
pub use response::ServerResponse;
pub use websocket::{WebsocketExchange, WebsocketInbound, WebsocketOutbound, WsUpgrade};

use exchange::{run_inbound, ConnectionStatus, Exchange, ExchangeCore, WsHandoff};
use timeout::{timeout, TimeoutError};

/// One element of a handler's outbound stream.
pub enum Outbound {
    /// A chunk of response body data.
    Data(Vec<u8>),
    /// A file whose contents become the response body, delivered chunk by
    /// chunk without loading the file into memory.
    File(PathBuf),
    /// Upgrade the connection to a websocket.
    Upgrade(WsUpgrade),
}

impl Outbound {
    /// Body data.
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Outbound::Data(data.into())
    }

    /// A file-backed body.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Outbound::File(path.into())
    }

    /// A websocket upgrade. Once the handshake is confirmed the handler is
    /// invoked with the connection's duplex byte streams; its error, if
    /// any, becomes the upgrade's completion error.
    pub fn websocket<F, Fut>(protocols: Option<&str>, handler: F) -> Self
    where
        F: FnOnce(WebsocketInbound, WebsocketOutbound) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), Exception>> + Send + 'static,
    {
        Outbound::Upgrade(WsUpgrade::new(protocols, handler))
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            Outbound::File(path) => f.debug_tuple("File").field(path).finish(),
            Outbound::Upgrade(upgrade) => f.debug_tuple("Upgrade").field(upgrade).finish(),
        }
    }
}

/// The stream of response elements produced by an application handler.
///
/// The engine pulls the next element only after the transport has confirmed
/// the previous write, so a slow peer throttles the handler and nothing
/// buffers without bound.
pub type OutboundStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Outbound, Exception>> + Send + 'static>>;

/// An outbound stream with no elements.
pub fn empty_body() -> OutboundStream {
    Box::pin(futures_lite::stream::empty())
}

/// An outbound stream with a single element.
pub fn body_of(outbound: Outbound) -> OutboundStream {
    Box::pin(futures_lite::stream::once(Ok(outbound)))
}

/// Configure the server.
pub struct ServerOptions {
    /// Timeout to handle headers. Defaults to 60s.
    pub headers_timeout: Option<Duration>,
    /// Resolves route parameters for [`ServerRequest::param`] and
    /// [`ServerRequest::params`]. Carried across every exchange on the
    /// connection.
    pub params_resolver: Option<ParamsResolver>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            headers_timeout: Some(Duration::from_secs(60)),
            params_resolver: None,
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("headers_timeout", &self.headers_timeout)
            .field("params_resolver", &self.params_resolver.is_some())
            .finish()
    }
}

/// Accept a new incoming HTTP/1.1 connection.
///
/// Supports `KeepAlive` requests by default.
pub async fn accept<RW, F, Fut>(io: RW, endpoint: F) -> Result<()>
where
    RW: Read + Write + Clone + Send + Sync + Unpin + 'static,
    F: Fn(ServerRequest, ServerResponse) -> Fut,
    Fut: Future<Output = std::result::Result<OutboundStream, Exception>>,
{
    accept_with_opts(io, endpoint, Default::default()).await
}

/// Accept a new incoming HTTP/1.1 connection.
///
/// Supports `KeepAlive` requests by default.
pub async fn accept_with_opts<RW, F, Fut>(
    io: RW,
    endpoint: F,
    opts: ServerOptions,
) -> Result<()>
where
    RW: Read + Write + Clone + Send + Sync + Unpin + 'static,
    F: Fn(ServerRequest, ServerResponse) -> Fut,
    Fut: Future<Output = std::result::Result<OutboundStream, Exception>>,
{
    let mut reader = BufReader::with_capacity(8 * 1024, io.clone());
    let mut conn = Connection::new(io.clone());
    conn.pipeline_mut()
        .add_last(BRIDGE, Box::new(BridgeStage::new()))?;

    loop {
        // Decode a new request, timing out if this takes longer than the
        // timeout duration.
        let fut = decode::decode_head(&mut reader);
        let decoded = if let Some(timeout_duration) = opts.headers_timeout {
            match timeout(timeout_duration, fut).await {
                Ok(decoded) => decoded?,
                Err(TimeoutError { .. }) => break,
            }
        } else {
            fut.await?
        };

        let (head, body_mode) = match decoded {
            Some(decoded) => decoded,
            None => break, /* EOF */
        };

        let head = Arc::new(head);
        let expects_continue = decode::expects_continue(&head);

        // channel capacity 1: the pump reads no further ahead than the
        // handler consumes
        let (body_tx, body_rx) = async_channel::bounded(1);
        let (interest_tx, interest_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);

        let res = ServerResponse::new();
        let req = ServerRequest::new(
            head.clone(),
            BodyStream::new(body_rx, interest_tx),
            opts.params_resolver.clone(),
        );
        trace!("handling exchange: {} {}", head.method(), head.url());
        let handler = endpoint(req, res.clone());

        let core = Arc::new(ExchangeCore::new());
        let auto_read = conn.auto_read_handle();
        conn.set_auto_read(false);

        let inbound = run_inbound(
            &mut reader,
            body_mode,
            io.clone(),
            expects_continue,
            body_tx,
            interest_rx,
            done_rx,
            core.clone(),
            auto_read,
        );
        let outbound = async {
            let mut exchange = Exchange::new(&mut conn, head.clone(), res, core.clone(), done_tx);
            exchange.process(handler).await
        };

        // the exchange terminates only when both directions have finished
        let (pumped, status) = zip(inbound, outbound).await;

        match status {
            ConnectionStatus::Upgraded(handoff) => {
                pumped?;
                return serve_websocket(handoff, reader, io).await;
            }
            ConnectionStatus::KeepAlive if pumped.is_ok() && core.inbound_done() => {
                trace!("keeping connection alive for the next exchange");
                continue;
            }
            ConnectionStatus::KeepAlive => {
                conn.close().await.ok();
                return pumped;
            }
            ConnectionStatus::Close => {
                if let Err(err) = &pumped {
                    debug!("inbound pump failed on a closing connection: {}", err);
                }
                conn.close().await.ok();
                break;
            }
        }
    }

    Ok(())
}

/// Run the websocket half of an upgraded connection.
async fn serve_websocket<RW>(
    handoff: WsHandoff,
    reader: BufReader<RW>,
    io: RW,
) -> Result<()>
where
    RW: Read + Write + Clone + Send + Sync + Unpin + 'static,
{
    let WsHandoff { exchange, handler } = handoff;
    exchange.handshake().await?;

    let subprotocol = exchange.subprotocol().map(String::from);
    let inbound = WebsocketInbound::new(Box::new(reader), subprotocol.clone());
    let outbound = WebsocketOutbound::new(Box::new(io), subprotocol);
    match handler(inbound, outbound).await {
        Ok(()) => {
            exchange.complete();
            Ok(())
        }
        Err(err) => {
            exchange.on_handler_error(&err);
            Err(Error::Handler(err))
        }
    }
}
