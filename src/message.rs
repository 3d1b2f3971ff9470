//! Wire-level messages exchanged with the transport.

use std::fmt;

use crate::chunked_file::ChunkedInput;

/// An event decoded from the inbound byte stream of one request.
///
/// The body of a request arrives as a sequence of [`InboundEvent::Chunk`]s
/// terminated by exactly one [`InboundEvent::Last`]. The terminal event may
/// carry data: a fixed-length body delivers its final bytes together with
/// the end-of-body marker, while a chunked body always terminates with an
/// empty marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A chunk of request body data.
    Chunk(Vec<u8>),
    /// The terminal chunk of the request body, possibly carrying trailing
    /// data.
    Last(Vec<u8>),
}

/// An outbound message on its way through the connection's pipeline.
pub enum WireMessage {
    /// Pre-encoded bytes, written to the transport as-is.
    Bytes(Vec<u8>),
    /// A file region to be sliced into transport-sized chunks by the
    /// `chunked-writer` pipeline stage.
    File(FileRegion),
}

impl WireMessage {
    /// Create a message from raw wire bytes.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        WireMessage::Bytes(data.into())
    }

    /// Create a message that delivers a file region chunk by chunk.
    pub fn file(input: impl ChunkedInput + 'static) -> Self {
        WireMessage::File(FileRegion {
            input: Box::new(input),
            armed: false,
        })
    }
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            WireMessage::File(region) => f.debug_tuple("File").field(region).finish(),
        }
    }
}

/// A file-backed message payload.
///
/// A region starts out disarmed; only the `chunked-writer` stage arms it.
/// Writing a disarmed region fails, mirroring the rule that chunked inputs
/// need a chunk-extraction stage in the pipeline.
pub struct FileRegion {
    pub(crate) input: Box<dyn ChunkedInput>,
    pub(crate) armed: bool,
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("armed", &self.armed)
            .finish()
    }
}
