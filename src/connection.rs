//! The binding between the engine and one transport connection.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_lite::io::{AsyncRead as Read, AsyncWrite as Write, AsyncWriteExt};
use log::trace;

use crate::message::WireMessage;
use crate::pipeline::Pipeline;

/// One byte-oriented transport connection.
///
/// A `Connection` owns the outbound half of the transport and the
/// [`Pipeline`] every outbound message passes through. Writes are
/// asynchronous; the future returned by [`write`](Connection::write)
/// resolves only once the message has been flushed, which is what callers
/// use as the write-completion signal for backpressure.
pub struct Connection<RW> {
    io: RW,
    pipeline: Pipeline,
    active: Arc<AtomicBool>,
    auto_read: Arc<AtomicBool>,
}

impl<RW> Connection<RW>
where
    RW: Read + Write + Clone + Send + Sync + Unpin + 'static,
{
    /// Bind a new connection to a transport.
    pub fn new(io: RW) -> Self {
        Connection {
            io,
            pipeline: Pipeline::new(),
            active: Arc::new(AtomicBool::new(true)),
            auto_read: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The connection's processing pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Mutable access to the processing pipeline.
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Returns `true` while the transport is usable for writes.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the transport should keep reading regardless of demand from
    /// the current exchange.
    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::SeqCst)
    }

    /// Toggle auto-read.
    pub fn set_auto_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn auto_read_handle(&self) -> Arc<AtomicBool> {
        self.auto_read.clone()
    }

    /// Run a message through the pipeline and write it to the transport.
    ///
    /// Resolves once every resulting byte has been flushed. A failed write
    /// marks the connection inactive; further writes fail immediately.
    pub async fn write(&mut self, msg: WireMessage) -> io::Result<()> {
        if !self.is_active() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ));
        }
        let result = self.write_inner(msg).await;
        if result.is_err() {
            self.active.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn write_inner(&mut self, msg: WireMessage) -> io::Result<()> {
        let messages = self.pipeline.run(msg)?;
        for msg in messages {
            match msg {
                WireMessage::Bytes(data) => {
                    self.io.write_all(&data).await?;
                }
                WireMessage::File(mut region) => {
                    if !region.armed {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "no chunked-writer stage in pipeline",
                        ));
                    }
                    // one flush per extracted chunk; the next pull waits for
                    // the previous write to complete
                    while let Some(chunk) = region.input.read_chunk()? {
                        self.io.write_all(&chunk).await?;
                        self.io.flush().await?;
                    }
                }
            }
        }
        self.io.flush().await
    }

    /// Close the transport. The connection becomes inactive.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            trace!("closing connection");
        }
        self.io.close().await
    }
}

impl<RW> fmt::Debug for Connection<RW> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("active", &self.active.load(Ordering::SeqCst))
            .field("auto_read", &self.auto_read.load(Ordering::SeqCst))
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
