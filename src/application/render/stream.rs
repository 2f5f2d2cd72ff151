//! Chunked rendering.

use std::io;
use std::num::NonZeroUsize;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use minijinja::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::RenderError;
use super::session::RenderSession;

/// Chunks buffered between the render task and the consumer.
const CHANNEL_DEPTH: usize = 4;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, RenderError>> + Send>>;

/// `io::Write` sink that forwards output in chunks of exactly `chunk_size`
/// bytes. Writing fails once the receiving side is gone.
pub struct ChunkWriter {
    tx: mpsc::Sender<Result<Bytes, RenderError>>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl ChunkWriter {
    pub fn new(tx: mpsc::Sender<Result<Bytes, RenderError>>, chunk_size: NonZeroUsize) -> Self {
        Self {
            tx,
            buffer: BytesMut::with_capacity(chunk_size.get()),
            chunk_size: chunk_size.get(),
        }
    }

    /// Emit the trailing partial chunk.
    pub fn finish(mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rest = self.buffer.split().freeze();
        self.send(rest)
    }

    fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream consumer went away"))
    }
}

impl io::Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.send(chunk)?;
        }
        Ok(data.len())
    }

    /// Partial chunks are held back so every chunk but the last is full size.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Render `session`'s root template on a blocking thread, streaming its
/// output. All dependencies must already be loaded into the session.
pub fn spawn_render(
    session: RenderSession,
    context: Value,
    chunk_size: NonZeroUsize,
) -> ChunkStream {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut writer = ChunkWriter::new(tx.clone(), chunk_size);
        let env = session.environment();
        let rendered = env
            .get_template(session.root())
            .and_then(|template| {
                template
                    .render_captured_to(&context, &mut writer)
                    .map(|_| ())
            })
            .map_err(|err| session.map_error(&err))
            .and_then(|()| writer.finish().map_err(|_| RenderError::Cancelled));

        match rendered {
            Ok(()) => {}
            Err(RenderError::Cancelled) => {
                debug!(template = %session.root(), "stream render abandoned by consumer");
            }
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
            }
        }
    });
    receiver_stream(rx)
}

/// Split an already rendered body into chunks.
pub fn chunked(body: Bytes, chunk_size: NonZeroUsize) -> ChunkStream {
    let size = chunk_size.get();
    let chunks: Vec<Result<Bytes, RenderError>> = (0..body.len())
        .step_by(size)
        .map(|start| Ok(body.slice(start..(start + size).min(body.len()))))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

fn receiver_stream(mut rx: mpsc::Receiver<Result<Bytes, RenderError>>) -> ChunkStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            let failed = item.is_err();
            yield item;
            if failed {
                break;
            }
        }
    })
}
