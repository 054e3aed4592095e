//! Output strategies.
//!
//! An [`OutputStrategy`] abstracts the destination of a response body,
//! independent of the transport. Bytes already flushed to the client are
//! never rolled back; aborting is only possible while nothing has been
//! committed.

use async_trait::async_trait;
use bytes::Bytes;

use crate::OwsResult;
use crate::error::OwsError;

#[async_trait]
pub trait OutputStrategy: Send {
    /// Writes one chunk toward the client.
    async fn write(&mut self, chunk: Bytes) -> OwsResult<()>;

    /// Commits everything written so far.
    async fn flush(&mut self) -> OwsResult<()>;

    /// Discards uncommitted output. Fails once any bytes were flushed.
    async fn abort(&mut self) -> OwsResult<()>;

    /// Bytes already visible to the client.
    fn flushed(&self) -> u64;
}

/// Collects output in memory; flush commits the whole buffer.
#[derive(Default)]
pub struct VecOutput {
    buf: Vec<u8>,
    flushed: u64,
}

impl VecOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

#[async_trait]
impl OutputStrategy for VecOutput {
    async fn write(&mut self, chunk: Bytes) -> OwsResult<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn flush(&mut self) -> OwsResult<()> {
        self.flushed = self.buf.len() as u64;
        Ok(())
    }

    async fn abort(&mut self) -> OwsResult<()> {
        if self.flushed > 0 {
            return Err(OwsError::Configuration(
                "output already committed; cannot abort".to_string(),
            ));
        }
        self.buf.clear();
        Ok(())
    }

    fn flushed(&self) -> u64 {
        self.flushed
    }
}

/// Delays all writes to the wrapped strategy until flush.
///
/// Lets a pipeline stage produce output speculatively and still switch to a
/// fault document as long as nothing was committed downstream.
pub struct BufferedOutput<S: OutputStrategy> {
    inner: S,
    buf: Vec<u8>,
}

impl<S: OutputStrategy> BufferedOutput<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: OutputStrategy> OutputStrategy for BufferedOutput<S> {
    async fn write(&mut self, chunk: Bytes) -> OwsResult<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn flush(&mut self) -> OwsResult<()> {
        if !self.buf.is_empty() {
            let pending = Bytes::from(std::mem::take(&mut self.buf));
            self.inner.write(pending).await?;
        }
        self.inner.flush().await
    }

    async fn abort(&mut self) -> OwsResult<()> {
        if self.inner.flushed() > 0 {
            return Err(OwsError::Configuration(
                "output already committed; cannot abort".to_string(),
            ));
        }
        self.buf.clear();
        Ok(())
    }

    fn flushed(&self) -> u64 {
        self.inner.flushed()
    }
}
