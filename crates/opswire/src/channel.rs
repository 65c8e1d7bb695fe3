//! One websocket per scope. A writer task drains an outbound queue while
//! the reader forwards text frames upward; the connection manager owns the
//! lifecycle and interprets close codes.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to open channel: {0}")]
    Connect(String),
    #[error("channel closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the reader half reports upward.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Frame(String),
    /// The socket is gone. `normal` is true only for an explicit
    /// normal/going-away close code.
    Closed { normal: bool },
}

pub(crate) struct EventChannel {
    out_tx: mpsc::UnboundedSender<Message>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl EventChannel {
    pub(crate) async fn connect(url: &str) -> Result<Self, ChannelError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, events_rx) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let read_task = tokio::spawn(async move {
            let mut reported = false;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(ChannelEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let normal = matches!(
                            frame,
                            Some(CloseFrame {
                                code: CloseCode::Normal | CloseCode::Away,
                                ..
                            })
                        );
                        let _ = event_tx.send(ChannelEvent::Closed { normal });
                        reported = true;
                        break;
                    }
                    // binary frames and transport-level ping/pong are not
                    // domain frames
                    Ok(_) => {}
                    Err(_) => {
                        let _ = event_tx.send(ChannelEvent::Closed { normal: false });
                        reported = true;
                        break;
                    }
                }
            }
            if !reported {
                let _ = event_tx.send(ChannelEvent::Closed { normal: false });
            }
        });

        Ok(Self {
            out_tx,
            events_rx,
            read_task: Some(read_task),
            write_task: Some(write_task),
        })
    }

    pub(crate) fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), ChannelError> {
        let text = serde_json::to_string(frame)?;
        self.out_tx
            .send(Message::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    pub(crate) async fn next(&mut self) -> Option<ChannelEvent> {
        self.events_rx.recv().await
    }

    /// Close with an intentional code so the server (and our own reader)
    /// treat the teardown as deliberate.
    pub(crate) async fn close(mut self) {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        }));
        let _ = self.out_tx.send(close);

        let read_task = self.read_task.take();
        let write_task = self.write_task.take();
        // Dropping the sender lets the writer drain the close frame and exit.
        drop(self);

        if let Some(mut task) = write_task {
            tokio::select! {
                _ = &mut task => {}
                _ = sleep(Duration::from_secs(1)) => task.abort(),
            }
        }
        if let Some(task) = read_task {
            task.abort();
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}
