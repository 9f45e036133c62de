//! Framed transport
//!
//! A transport is one full-duplex connection split into an outbound sink and an
//! inbound stream of text messages. The stream ending (`None`) means the remote
//! side closed the connection normally; abnormal drops surface as
//! `SessionError::Transport`.
//!
//! Only one write may be in flight at a time, so outbound frames never touch
//! the sink directly: producers enqueue on a [`FrameSender`] and a single
//! writer task owns the sink.

use std::pin::Pin;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use super::frame::Frame;
use crate::error::{Result, SessionError};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SessionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One physical connection carrying frames
pub struct FramedTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl FramedTransport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens a transport to a session endpoint
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a Url) -> BoxFuture<'a, Result<FramedTransport>>;
}

/// Connects over WebSocket (`ws://` or `wss://`)
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect<'a>(&'a self, endpoint: &'a Url) -> BoxFuture<'a, Result<FramedTransport>> {
        async move {
            match endpoint.scheme() {
                "ws" | "wss" => {}
                other => {
                    return Err(SessionError::Transport(format!(
                        "unsupported endpoint scheme: {}",
                        other
                    )));
                }
            }

            let (ws, _response) = tokio_tungstenite::connect_async(endpoint.as_str()).await?;
            debug!("Connected to {}", endpoint);

            let (ws_sink, ws_stream) = ws.split();

            let sink = ws_sink
                .sink_map_err(SessionError::from)
                .with(|text: String| future::ready(Ok::<_, SessionError>(Message::text(text))));

            let stream = futures::stream::unfold(ws_stream, |mut ws_stream| async move {
                loop {
                    match ws_stream.next().await? {
                        Ok(Message::Text(text)) => {
                            return Some((Ok(text.as_str().to_owned()), ws_stream));
                        }
                        Ok(Message::Binary(bytes)) => {
                            let item = String::from_utf8(bytes.to_vec()).map_err(|_| {
                                SessionError::Protocol("binary message is not UTF-8".to_string())
                            });
                            return Some((item, ws_stream));
                        }
                        Ok(Message::Close(frame)) => {
                            debug!("Remote closed connection: {:?}", frame);
                            return None;
                        }
                        Ok(_) => continue,
                        Err(tungstenite::Error::ConnectionClosed)
                        | Err(tungstenite::Error::AlreadyClosed) => return None,
                        Err(e) => return Some((Err(SessionError::from(e)), ws_stream)),
                    }
                }
            });

            Ok(FramedTransport::new(Box::pin(sink), Box::pin(stream.fuse())))
        }
        .boxed()
    }
}

/// Cloneable handle producers use to enqueue outbound frames
pub type FrameSender = mpsc::Sender<Frame>;

/// Reports the error that stopped the writer, if one did
pub type WriteFailure = oneshot::Receiver<SessionError>;

/// Spawn the single writer that owns the sink.
///
/// Frames are written one at a time in queue order. When every sender is
/// dropped the queue drains and the sink is closed. A failed write stops the
/// writer, is reported on the returned [`WriteFailure`] and cancels `cancel`.
pub fn spawn_writer(
    mut sink: FrameSink,
    capacity: usize,
    cancel: CancellationToken,
) -> (FrameSender, WriteFailure, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Frame>(capacity.max(1));
    let (failed_tx, failed_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping outbound frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(text).await {
                error!("Failed to write frame: {}", e);
                // reported before the cancel; waiters check the report first
                let _ = failed_tx.send(e);
                cancel.cancel();
                return;
            }
        }

        if let Err(e) = sink.close().await {
            debug!("Transport close: {}", e);
        }
    });

    (tx, failed_rx, handle)
}

/// Wait for the writer to drain, aborting it after `grace`
pub async fn finish_writer(handle: JoinHandle<()>, grace: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Writer task failed: {}", e),
        Err(_) => {
            debug!("Writer did not finish within {:?}, aborting", grace);
            abort.abort();
        }
    }
}

/// In-memory transport and remote end for tests
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    use futures::channel::mpsc as fmpsc;

    /// The far side of an in-memory transport
    pub struct RemoteEnd {
        pub outbound: fmpsc::UnboundedReceiver<String>,
        pub inbound: fmpsc::UnboundedSender<Result<String>>,
    }

    impl RemoteEnd {
        /// Send a raw text message to the client
        pub fn send(&self, text: &str) {
            let _ = self.inbound.unbounded_send(Ok(text.to_string()));
        }

        pub fn fail(&self, message: &str) {
            let _ = self
                .inbound
                .unbounded_send(Err(SessionError::Transport(message.to_string())));
        }

        /// Close the inbound direction gracefully
        pub fn hang_up(&self) {
            self.inbound.close_channel();
        }

        /// Next outbound frame written by the client, decoded
        pub async fn next_frame(&mut self) -> Option<Frame> {
            let text = tokio::time::timeout(Duration::from_secs(2), self.outbound.next())
                .await
                .ok()??;
            Some(Frame::decode(&text).expect("client wrote an invalid frame"))
        }

        /// All frames until the client closes its sink
        pub async fn drain(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Some(frame) = self.next_frame().await {
                frames.push(frame);
            }
            frames
        }
    }

    pub fn pair() -> (FramedTransport, RemoteEnd) {
        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<String>>();

        let sink = out_tx.sink_map_err(|e| SessionError::Transport(e.to_string()));
        let transport = FramedTransport::new(Box::pin(sink), Box::pin(in_rx));

        (
            transport,
            RemoteEnd {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Hands out one prepared transport, then refuses
    pub struct ChannelConnector {
        transport: Mutex<Option<FramedTransport>>,
    }

    impl ChannelConnector {
        pub fn new(transport: FramedTransport) -> Self {
            Self {
                transport: Mutex::new(Some(transport)),
            }
        }
    }

    impl Connector for ChannelConnector {
        fn connect<'a>(&'a self, _endpoint: &'a Url) -> BoxFuture<'a, Result<FramedTransport>> {
            let transport = self.transport.lock().unwrap().take();
            async move {
                transport.ok_or_else(|| SessionError::Transport("connection refused".to_string()))
            }
            .boxed()
        }
    }
}
