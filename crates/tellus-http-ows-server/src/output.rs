//! HTTP response bodies and the direct output strategy.
//!
//! Buffered responses use `Full<Bytes>`; streamed responses are fed through
//! a channel into a custom `http_body::Body` implementation. A failed send
//! means the peer dropped the connection, which surfaces as a client abort.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http_body::{Body, Frame};
use http_body_util::Full;
use tokio::sync::mpsc;

use tellus_ows::error::OwsError;
use tellus_ows::output::OutputStrategy;
use tellus_ows::OwsResult;

/// Response body returned by the dispatcher.
#[derive(Debug)]
pub enum OwsBody {
    Full(Full<Bytes>),
    Channel(mpsc::Receiver<Bytes>),
}

impl OwsBody {
    pub fn full(bytes: Bytes) -> Self {
        OwsBody::Full(Full::new(bytes))
    }

    pub fn empty() -> Self {
        OwsBody::Full(Full::new(Bytes::new()))
    }
}

impl Body for OwsBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            OwsBody::Full(full) => Pin::new(full).poll_frame(cx),
            OwsBody::Channel(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Direct output strategy: every write goes straight to the client.
pub struct ChannelOutput {
    tx: mpsc::Sender<Bytes>,
    flushed: u64,
}

impl ChannelOutput {
    /// Creates the strategy and the body its chunks arrive on.
    pub fn new(capacity: usize) -> (Self, OwsBody) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, flushed: 0 }, OwsBody::Channel(rx))
    }
}

#[async_trait]
impl OutputStrategy for ChannelOutput {
    async fn write(&mut self, chunk: Bytes) -> OwsResult<()> {
        let len = chunk.len() as u64;
        self.tx
            .send(chunk)
            .await
            .map_err(|_| OwsError::ClientAborted)?;
        self.flushed += len;
        Ok(())
    }

    async fn flush(&mut self) -> OwsResult<()> {
        Ok(())
    }

    async fn abort(&mut self) -> OwsResult<()> {
        if self.flushed > 0 {
            return Err(OwsError::Configuration(
                "output already committed; cannot abort".to_string(),
            ));
        }
        Ok(())
    }

    fn flushed(&self) -> u64 {
        self.flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_channel_output_streams_chunks() {
        let (mut out, body) = ChannelOutput::new(8);
        out.write(Bytes::from_static(b"hello ")).await.unwrap();
        out.write(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(out.flushed(), 11);
        drop(out);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_a_client_abort() {
        let (mut out, body) = ChannelOutput::new(1);
        drop(body);
        let err = out.write(Bytes::from_static(b"data")).await.unwrap_err();
        assert!(err.is_client_abort());
    }
}
