//! TCP publish/subscribe sockets for the message bus
//!
//! A node binds one publish socket; every peer that subscribes to it opens a
//! TCP connection and receives each published frame (length-delimited).
//! Delivery is at-most-once: a subscriber that falls more than the backlog
//! behind loses the oldest frames.

use bytes::{Bytes, BytesMut};
use futures_util::SinkExt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::Stream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}

/// Outbound broadcast socket
pub struct Publisher {
    local_addr: SocketAddr,
    frames: broadcast::Sender<Bytes>,
    max_frame_len: usize,
}

impl Publisher {
    /// Bind the publish socket and start accepting subscribers
    pub async fn bind(
        addr: SocketAddr,
        backlog: usize,
        max_frame_len: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (frames, _) = broadcast::channel(backlog);

        tokio::spawn(accept_loop(listener, frames.clone(), max_frame_len, shutdown));

        Ok(Self {
            local_addr,
            frames,
            max_frame_len,
        })
    }

    /// Get the local address this publisher is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a frame for every connected subscriber.
    ///
    /// Returns how many subscribers it was queued for; zero is not an error.
    /// Frames over the length limit are refused before they reach any
    /// subscriber connection.
    pub fn publish(&self, frame: Bytes) -> Result<usize, io::Error> {
        if frame.len() > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    frame.len(),
                    self.max_frame_len
                ),
            ));
        }
        Ok(self.frames.send(frame).unwrap_or(0))
    }

    /// Number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

async fn accept_loop(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                debug!("Publisher: Subscriber connected from {}", remote);
                let rx = frames.subscribe();
                tokio::spawn(serve_subscriber(stream, remote, rx, max_frame_len, shutdown.clone()));
            }
            Err(e) => warn!("Publisher: Accept failed: {}", e),
        }
    }
    debug!("Publisher: Accept loop stopped");
}

async fn serve_subscriber(
    stream: TcpStream,
    remote: SocketAddr,
    mut rx: broadcast::Receiver<Bytes>,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Publisher: Could not set nodelay for {}: {}", remote, e);
    }
    let mut sink = FramedWrite::new(stream, codec(max_frame_len));

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };

        match frame {
            Ok(bytes) => {
                if let Err(e) = sink.send(bytes).await {
                    debug!("Publisher: Subscriber {} gone: {}", remote, e);
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Publisher: Subscriber {} lagged, dropped {} frames", remote, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Inbound socket subscribed to one peer's publisher.
///
/// Yields one item per frame. A read error or EOF is yielded once as an
/// `Err`, after which the socket is released and the stream stays pending
/// until it is dropped; the owner decides when the peer is gone.
pub struct Subscription {
    endpoint: SocketAddr,
    frames: Option<FramedRead<TcpStream, LengthDelimitedCodec>>,
}

impl Subscription {
    /// Connect to a peer's publish socket
    pub async fn connect(
        endpoint: SocketAddr,
        max_frame_len: usize,
        timeout: Duration,
    ) -> Result<Self, io::Error> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;

        Ok(Self {
            endpoint,
            frames: Some(FramedRead::new(stream, codec(max_frame_len))),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// False once a read error or EOF released the socket
    pub fn is_open(&self) -> bool {
        self.frames.is_some()
    }
}

impl Stream for Subscription {
    type Item = Result<BytesMut, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let frames = match this.frames.as_mut() {
            Some(frames) => frames,
            None => return Poll::Pending,
        };

        match Pin::new(frames).poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => {
                this.frames = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.frames = None;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "publisher closed the connection",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
