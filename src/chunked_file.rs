//! Incremental delivery of file-backed response bodies.
//!
//! Sending a file without loading it into memory requires a chunk-extraction
//! stage in the connection's pipeline. [`ChunkedFileDelivery`] performs the
//! handshake of installing and removing that stage around a write: `prepare`
//! inserts the [`ChunkedWriter`] stage only if none is present, and `cleanup`
//! removes it only if this instance added it, so a stage installed by an
//! outer caller is never torn down from under it.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};

use crate::message::WireMessage;
use crate::pipeline::{Pipeline, Stage, BRIDGE, CHUNKED_WRITER};
use crate::Result;

/// The default size of a single extracted chunk.
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// A pull-based source of body chunks.
///
/// `read_chunk` returns `None` once the input is exhausted. The slicing
/// mechanics (how a file turns into chunks) live behind this trait; the
/// engine only drives the pulls, one transport write at a time.
pub trait ChunkedInput: Send {
    /// Produce the next chunk, or `None` at the end of the input.
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// A [`ChunkedInput`] that reads a file in fixed-size slices.
#[derive(Debug)]
pub struct FileChunks {
    file: File,
    chunk_size: usize,
}

impl FileChunks {
    /// Wrap an open file.
    pub fn new(file: File, chunk_size: usize) -> Self {
        FileChunks { file, chunk_size }
    }
}

impl ChunkedInput for FileChunks {
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0; self.chunk_size];
        let n = self.file.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

/// The pipeline stage that arms file regions for chunk extraction.
#[derive(Debug, Default)]
pub struct ChunkedWriter;

impl Stage for ChunkedWriter {
    fn process(&mut self, msg: WireMessage) -> io::Result<Vec<WireMessage>> {
        match msg {
            WireMessage::File(mut region) => {
                region.armed = true;
                Ok(vec![WireMessage::File(region)])
            }
            msg => Ok(vec![msg]),
        }
    }
}

/// Prepares and cleans up a connection's pipeline for chunked file delivery.
///
/// The same instance must be used for both halves of the handshake: it
/// records whether `prepare` actually installed the stage, and `cleanup`
/// only removes what it installed. After removal `cleanup` invokes the
/// post-write hook, which defaults to a no-op.
pub struct ChunkedFileDelivery {
    added_stage: bool,
    chunk_size: usize,
    after_write: Option<Box<dyn FnMut() + Send>>,
}

impl ChunkedFileDelivery {
    /// Create a strategy with the default chunk size.
    pub fn new() -> Self {
        ChunkedFileDelivery {
            added_stage: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            after_write: None,
        }
    }

    /// Override the size of extracted chunks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Register custom teardown to run at the end of `cleanup`, e.g. to
    /// release resources tied to the write.
    pub fn on_after_write(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.after_write = Some(Box::new(hook));
        self
    }

    /// Install the chunk-extraction stage if the pipeline doesn't have one.
    ///
    /// The stage goes immediately before the [`BRIDGE`] stage when that is
    /// present, otherwise at the end of the pipeline.
    pub fn prepare(&mut self, pipeline: &mut Pipeline) -> Result<()> {
        self.added_stage = !pipeline.contains(CHUNKED_WRITER);
        if self.added_stage {
            if pipeline.contains(BRIDGE) {
                pipeline.add_before(BRIDGE, CHUNKED_WRITER, Box::new(ChunkedWriter))?;
            } else {
                pipeline.add_last(CHUNKED_WRITER, Box::new(ChunkedWriter))?;
            }
        }
        Ok(())
    }

    /// Remove the chunk-extraction stage if this instance added it, then run
    /// the post-write hook.
    pub fn cleanup(&mut self, pipeline: &mut Pipeline) -> Result<()> {
        if self.added_stage {
            pipeline.remove(CHUNKED_WRITER)?;
            self.added_stage = false;
        }
        if let Some(hook) = self.after_write.as_mut() {
            hook();
        }
        Ok(())
    }

    /// Slice an open file into chunks of this strategy's configured size.
    pub fn chunk_file(&self, file: File) -> FileChunks {
        FileChunks::new(file, self.chunk_size)
    }
}

impl Default for ChunkedFileDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkedFileDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedFileDelivery")
            .field("added_stage", &self.added_stage)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
