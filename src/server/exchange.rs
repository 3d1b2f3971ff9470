//! The per-exchange state machine driving one request/response cycle.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_lite::future::or;
use futures_lite::io::{AsyncRead as Read, AsyncWrite as Write, AsyncWriteExt, BufReader};
use futures_lite::StreamExt;
use http_types::{Request, StatusCode};
use log::{debug, error, trace};

use crate::chunked_file::{ChunkedFileDelivery, ChunkedInput};
use crate::message::{InboundEvent, WireMessage};
use crate::server::decode::{BodyMode, BodyReader, CONTINUE_RESPONSE};
use crate::server::request::keep_alive_requested;
use crate::server::websocket::{
    accept_key, negotiate_subprotocol, switching_protocols_head, WebsocketExchange,
    WebsocketHandlerFn, WsUpgrade,
};
use crate::server::{encode, Outbound, OutboundStream, ServerResponse};
use crate::{Connection, Error, Exception};

/// Completion flags shared between the inbound and outbound halves of an
/// exchange. The exchange only terminates once both directions are done.
#[derive(Debug, Default)]
pub(crate) struct ExchangeCore {
    inbound_done: AtomicBool,
    outbound_done: AtomicBool,
}

impl ExchangeCore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inbound_done(&self) -> bool {
        self.inbound_done.load(Ordering::SeqCst)
    }

    pub(crate) fn outbound_done(&self) -> bool {
        self.outbound_done.load(Ordering::SeqCst)
    }
}

/// What to do with the connection once an exchange has finished.
pub(crate) enum ConnectionStatus {
    /// Both sides agreed to reuse the connection for another exchange.
    KeepAlive,
    /// The connection must be closed.
    Close,
    /// The exchange was consumed by a websocket upgrade.
    Upgraded(WsHandoff),
}

/// Everything the driver needs to run the websocket half of an upgraded
/// connection.
pub(crate) struct WsHandoff {
    pub(crate) exchange: WebsocketExchange,
    pub(crate) handler: WebsocketHandlerFn,
}

impl fmt::Debug for WsHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsHandoff")
            .field("exchange", &self.exchange)
            .finish()
    }
}

impl fmt::Debug for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::KeepAlive => write!(f, "KeepAlive"),
            ConnectionStatus::Close => write!(f, "Close"),
            ConnectionStatus::Upgraded(_) => write!(f, "Upgraded"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BodyFraming {
    Chunked,
    Plain,
}

/// One request/response cycle bound to a connection.
pub(crate) struct Exchange<'c, RW> {
    conn: &'c mut Connection<RW>,
    head: Arc<Request>,
    res: ServerResponse,
    core: Arc<ExchangeCore>,
    done: Option<async_channel::Sender<()>>,
    framing: Option<BodyFraming>,
}

impl<'c, RW> Exchange<'c, RW>
where
    RW: Read + Write + Clone + Send + Sync + Unpin + 'static,
{
    pub(crate) fn new(
        conn: &'c mut Connection<RW>,
        head: Arc<Request>,
        res: ServerResponse,
        core: Arc<ExchangeCore>,
        done: async_channel::Sender<()>,
    ) -> Self {
        Exchange {
            conn,
            head,
            res,
            core,
            done: Some(done),
            framing: None,
        }
    }

    /// Drive the handler's outbound stream to completion, one element per
    /// confirmed transport write.
    pub(crate) async fn process<Fut>(&mut self, handler: Fut) -> ConnectionStatus
    where
        Fut: Future<Output = Result<OutboundStream, Exception>>,
    {
        let mut stream = match handler.await {
            Ok(stream) => stream,
            Err(err) => return self.on_outbound_error(Error::Handler(err)).await,
        };

        loop {
            match stream.next().await {
                Some(Ok(Outbound::Data(data))) => {
                    if let Err(err) = self.write_data(data).await {
                        return self.on_outbound_error(err).await;
                    }
                }
                Some(Ok(Outbound::File(path))) => {
                    if let Err(err) = self.send_file(&path).await {
                        return self.on_outbound_error(err).await;
                    }
                }
                Some(Ok(Outbound::Upgrade(upgrade))) => {
                    match self.with_websocket_support(upgrade).await {
                        Ok(handoff) => {
                            self.finish_outbound();
                            return ConnectionStatus::Upgraded(handoff);
                        }
                        Err(err) => return self.on_outbound_error(err).await,
                    }
                }
                Some(Err(err)) => return self.on_outbound_error(Error::Handler(err)).await,
                None => return self.on_outbound_complete().await,
            }
        }
    }

    /// Flush the response head exactly once.
    async fn flush_head(&mut self) -> crate::Result<()> {
        if self.res.framing().mark_headers() {
            let (head, chunked) = self.res.encode_head();
            self.framing = Some(if chunked {
                BodyFraming::Chunked
            } else {
                BodyFraming::Plain
            });
            trace!("writing response head");
            self.conn.write(WireMessage::Bytes(head)).await?;
        }
        Ok(())
    }

    async fn write_data(&mut self, data: Vec<u8>) -> crate::Result<()> {
        self.flush_head().await?;
        if self.res.is_no_content() {
            trace!("discarding body bytes for a no-content status");
            return Ok(());
        }
        let bytes = match self.framing {
            Some(BodyFraming::Chunked) => encode::chunk(&data),
            _ => data,
        };
        self.conn.write(WireMessage::Bytes(bytes)).await?;
        Ok(())
    }

    /// Deliver a file-backed body incrementally, installing the
    /// chunk-extraction stage around the write.
    async fn send_file(&mut self, path: &Path) -> crate::Result<()> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if !self.res.has_sent_headers() => {
                debug!("failed to open {:?}, replying 404: {}", path, err);
                self.res.set_status(StatusCode::NotFound)?;
                return Ok(());
            }
            Err(err) => return Err(Error::Io(err)),
        };

        self.flush_head().await?;
        if self.res.is_no_content() {
            return Ok(());
        }

        let mut delivery = ChunkedFileDelivery::new();
        delivery.prepare(self.conn.pipeline_mut())?;
        let input = FramedChunks {
            inner: delivery.chunk_file(file),
            chunked: matches!(self.framing, Some(BodyFraming::Chunked)),
        };
        // completion and error both funnel through the same cleanup
        let written = self.conn.write(WireMessage::file(input)).await;
        delivery.cleanup(self.conn.pipeline_mut())?;
        written.map_err(Error::Io)
    }

    /// Upgrade the connection to a websocket, consuming the HTTP exchange.
    ///
    /// Only the caller that wins the headers-sent transition may upgrade;
    /// everyone else gets an upgrade failure.
    async fn with_websocket_support(
        &mut self,
        upgrade: WsUpgrade,
    ) -> crate::Result<WsHandoff> {
        if !self.res.framing().mark_headers() {
            return Err(Error::Upgrade("failed to upgrade to websocket"));
        }

        let key = match self.head.header("sec-websocket-key") {
            Some(key) => key.last().as_str().to_owned(),
            None => {
                debug!("upgrade request carries no sec-websocket-key");
                return Err(Error::Upgrade("failed to upgrade to websocket"));
            }
        };
        let subprotocol = negotiate_subprotocol(
            upgrade.protocols.as_deref(),
            self.head.header("sec-websocket-protocol"),
        );
        let head = switching_protocols_head(&accept_key(key.as_bytes()), subprotocol.as_deref());

        let (exchange, handshake) = WebsocketExchange::new(subprotocol);
        match self.conn.write(WireMessage::Bytes(head)).await {
            Ok(()) => {
                trace!("wrote 101 Switching Protocols, replacing http exchange");
                handshake.confirm();
                Ok(WsHandoff {
                    exchange,
                    handler: upgrade.handler,
                })
            }
            Err(err) => {
                debug!("websocket handshake write failed: {}", err);
                handshake.fail();
                Err(Error::Upgrade("failed to upgrade to websocket"))
            }
        }
    }

    /// The handler's outbound stream finished without an error.
    async fn on_outbound_complete(&mut self) -> ConnectionStatus {
        let framing = self.res.framing();
        let written = if framing.mark_headers_and_body() {
            trace!("outbound complete with nothing sent, writing full empty-body response");
            let head = self.res.encode_full_empty_body();
            self.conn.write(WireMessage::Bytes(head)).await
        } else if framing.mark_body() {
            trace!("outbound complete, terminating the body");
            self.conn.write(WireMessage::Bytes(self.last_marker())).await
        } else {
            Ok(())
        };
        self.finish_outbound();

        match written {
            Ok(()) => {
                if self.is_persistent() {
                    ConnectionStatus::KeepAlive
                } else {
                    ConnectionStatus::Close
                }
            }
            Err(err) => self.on_outbound_error(Error::Io(err)).await,
        }
    }

    /// Recover from a failure while producing the response.
    ///
    /// Exactly one of three writes happens, depending on how far the
    /// response got: a full `500` message, a terminal body marker, or an
    /// empty buffer. The connection closes after the flush either way.
    async fn on_outbound_error(&mut self, err: Error) -> ConnectionStatus {
        error!("outbound error on exchange: {}", err);
        self.finish_outbound();

        if !self.conn.is_active() {
            trace!("connection already inactive, tearing down without writes");
            return ConnectionStatus::Close;
        }

        let framing = self.res.framing();
        let written = if framing.mark_headers() {
            self.conn.write(WireMessage::Bytes(encode::error_head())).await
        } else if framing.mark_body() {
            self.conn.write(WireMessage::Bytes(self.last_marker())).await
        } else {
            self.conn.write(WireMessage::Bytes(Vec::new())).await
        };
        if let Err(err) = written {
            debug!("failed to write error response: {}", err);
        }
        if let Err(err) = self.conn.close().await {
            debug!("failed to close connection: {}", err);
        }
        ConnectionStatus::Close
    }

    fn last_marker(&self) -> Vec<u8> {
        match self.framing {
            Some(BodyFraming::Chunked) => encode::LAST_CHUNK.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Mark outbound as finished and release the inbound side, which may be
    /// waiting to discard an unread body.
    fn finish_outbound(&mut self) {
        self.core.outbound_done.store(true, Ordering::SeqCst);
        self.done.take();
    }

    fn is_persistent(&self) -> bool {
        self.res.is_persistent() && keep_alive_requested(&self.head)
    }
}

impl<'c, RW> fmt::Debug for Exchange<'c, RW> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("core", &self.core)
            .field("framing", &self.framing)
            .finish()
    }
}

/// A [`ChunkedInput`] whose chunks come out pre-framed for the response's
/// transfer encoding.
struct FramedChunks<I> {
    inner: I,
    chunked: bool,
}

impl<I: ChunkedInput> ChunkedInput for FramedChunks<I> {
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inner.read_chunk()?.map(|data| {
            if self.chunked {
                encode::chunk(&data)
            } else {
                data
            }
        }))
    }
}

/// Pump the inbound half of one exchange.
///
/// Body chunks are forwarded to the handler's [`BodyStream`] once it has
/// signaled reading interest; the interim `100 Continue` (when expected) is
/// written and flushed strictly before the first chunk is delivered. If the
/// handler finishes without reading, the body is drained and discarded so a
/// persistent connection starts the next exchange clean. The empty terminal
/// marker is suppressed, never delivered.
///
/// [`BodyStream`]: crate::server::BodyStream
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_inbound<RW>(
    reader: &mut BufReader<RW>,
    mode: BodyMode,
    mut io: RW,
    expects_continue: bool,
    chunks: async_channel::Sender<Vec<u8>>,
    interest: async_channel::Receiver<()>,
    done: async_channel::Receiver<()>,
    core: Arc<ExchangeCore>,
    auto_read: Arc<AtomicBool>,
) -> crate::Result<()>
where
    RW: Read + Write + Clone + Send + Sync + Unpin + 'static,
{
    let mut deliver = match mode {
        BodyMode::None => false,
        _ => {
            or(async { interest.recv().await.is_ok() }, async {
                let _ = done.recv().await;
                false
            })
            .await
        }
    };

    if deliver && expects_continue {
        trace!("writing 100 Continue interim response");
        io.write_all(CONTINUE_RESPONSE).await?;
        io.flush().await?;
    }

    let mut body = BodyReader::new(mode);
    loop {
        match body.next_event(reader).await? {
            InboundEvent::Chunk(data) => {
                if deliver {
                    deliver = forward(&chunks, &done, data).await;
                }
            }
            InboundEvent::Last(data) => {
                // the empty terminal marker is suppressed
                if deliver && !data.is_empty() {
                    forward(&chunks, &done, data).await;
                }
                break;
            }
        }
    }

    core.inbound_done.store(true, Ordering::SeqCst);
    if !core.outbound_done() {
        // inbound is done; resume transport reads so the close of a
        // lingering connection is noticed promptly
        auto_read.store(true, Ordering::SeqCst);
    }
    Ok(())
}

/// Deliver one chunk to the handler. Returns `false` once the handler is no
/// longer listening, flipping the pump into discard mode.
async fn forward(
    chunks: &async_channel::Sender<Vec<u8>>,
    done: &async_channel::Receiver<()>,
    data: Vec<u8>,
) -> bool {
    or(async { chunks.send(data).await.is_ok() }, async {
        let _ = done.recv().await;
        false
    })
    .await
}
