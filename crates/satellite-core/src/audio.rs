//! Audio ingestion for a pipeline run.
//!
//! Frames are queued without bound in arrival order. An empty frame is the
//! end-of-stream sentinel: the consuming [`AudioStream`] ends there for good,
//! even if more frames were queued behind it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{FusedStream, Stream};
use tokio::sync::mpsc;

/// Create a connected sink/stream pair.
pub fn audio_channel() -> (AudioSink, AudioStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        AudioSink { tx },
        AudioStream {
            rx,
            finished: false,
        },
    )
}

/// Producer side of a run's audio queue.
#[derive(Debug, Clone)]
pub struct AudioSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl AudioSink {
    /// Queue a frame. Returns `false` once the consumer is gone.
    pub fn push(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Queue the end-of-stream sentinel.
    pub fn close(&self) -> bool {
        self.push(Bytes::new())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Lazy, finite, non-restartable sequence of audio frames.
#[derive(Debug)]
pub struct AudioStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    finished: bool,
}

impl AudioStream {
    /// Whether the stream has observed the sentinel (or lost its producer).
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for AudioStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) if frame.is_empty() => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(None)
            }
            Poll::Ready(Some(frame)) => Poll::Ready(Some(frame)),
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedStream for AudioStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_frames_arrive_in_order_until_sentinel() {
        let (sink, mut stream) = audio_channel();
        assert!(sink.push(Bytes::from_static(b"ab")));
        assert!(sink.push(Bytes::from_static(b"cd")));
        assert!(sink.close());
        sink.push(Bytes::from_static(b"after"));

        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"cd"));
        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
        // Never restarts
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sink_reports_closed_after_sentinel_consumed() {
        let (sink, mut stream) = audio_channel();
        sink.close();
        assert!(stream.next().await.is_none());
        assert!(sink.is_closed());
        assert!(!sink.push(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_dropped_sink_ends_stream() {
        let (sink, mut stream) = audio_channel();
        sink.push(Bytes::from_static(b"x"));
        drop(sink);
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(stream.is_terminated());
    }
}
