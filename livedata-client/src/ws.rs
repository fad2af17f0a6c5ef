//! WebSocket transport over tokio-tungstenite.
//!
//! The socket lives in a background task. [`WebSocketTransport`] is the
//! synchronous handle the connection talks to; lifecycle events come back on
//! the channel returned by [`WebSocketTransport::connect`].
//!
//! Frames handed to `send` while the socket is down are dropped: the
//! connection replays everything that matters from its own state on the next
//! [`TransportEvent::Reset`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ConnectionOptions;
use crate::transport::{ConnectionStatus, DisconnectOptions, StatusKind, Transport, TransportEvent};

#[derive(Debug)]
enum SocketCommand {
    Send(String),
    Reconnect { force: bool },
    Disconnect(DisconnectOptions),
}

/// Why a live socket stopped.
enum Ended {
    /// Dropped or forced; reconnect per retry policy.
    Lost { immediately: bool },
    /// Disconnected on request.
    Stopped(DisconnectOptions),
    /// The handle is gone.
    Shutdown,
}

/// Handle to a socket task.
pub struct WebSocketTransport {
    commands: mpsc::UnboundedSender<SocketCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl WebSocketTransport {
    /// Spawn the socket task and start connecting to `url`. Must be called
    /// from within a tokio runtime.
    pub fn connect(
        url: impl Into<String>,
        options: &ConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let socket = SocketTask {
            url: url.into(),
            retry: options.retry,
            retry_delay: options.retry_delay(),
            commands: command_rx,
            events: event_tx,
            status: status_tx,
        };
        tokio::spawn(socket.run());

        (
            Self {
                commands: command_tx,
                status: status_rx,
            },
            event_rx,
        )
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    fn command(&self, cmd: SocketCommand) {
        if self.commands.send(cmd).is_err() {
            log::debug!("Socket task has exited; dropping command");
        }
    }
}

impl Transport for WebSocketTransport {
    fn send(&mut self, frame: String) {
        self.command(SocketCommand::Send(frame));
    }

    fn reconnect(&mut self, force: bool) {
        self.command(SocketCommand::Reconnect { force });
    }

    fn disconnect(&mut self, options: DisconnectOptions) {
        self.command(SocketCommand::Disconnect(options));
    }

    fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }
}

struct SocketTask {
    url: String,
    retry: bool,
    retry_delay: Duration,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl SocketTask {
    async fn run(mut self) {
        let mut retry_count = 0u32;

        loop {
            self.set_status(StatusKind::Connecting, retry_count, None);

            let ended = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    log::info!("Connected to {}", self.url);
                    retry_count = 0;
                    self.set_status(StatusKind::Connected, 0, None);
                    if self.events.send(TransportEvent::Reset).is_err() {
                        return;
                    }
                    let ended = self.pump(stream).await;
                    let _ = self.events.send(TransportEvent::Disconnect);
                    ended
                }
                Err(e) => {
                    log::warn!("Connection to {} failed: {e}", self.url);
                    Ended::Lost { immediately: false }
                }
            };

            match ended {
                Ended::Shutdown => return,
                Ended::Stopped(options) => {
                    let kind = if options.permanent {
                        StatusKind::Failed
                    } else {
                        StatusKind::Offline
                    };
                    self.set_status(kind, retry_count, options.error);
                    if options.permanent || !self.wait_for_reconnect().await {
                        return;
                    }
                }
                Ended::Lost { immediately: true } => {}
                Ended::Lost { immediately: false } => {
                    if !self.retry {
                        self.set_status(StatusKind::Offline, retry_count, None);
                        if !self.wait_for_reconnect().await {
                            return;
                        }
                        continue;
                    }
                    retry_count += 1;
                    self.set_status(StatusKind::Waiting, retry_count, None);
                    if !self.back_off().await {
                        return;
                    }
                }
            }
        }
    }

    /// Shuttle frames until the socket ends.
    async fn pump(&mut self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Ended {
        let (mut writer, mut reader) = stream.split();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Send(frame)) => {
                        if let Err(e) = writer.send(WsMessage::Text(frame.into())).await {
                            log::warn!("WebSocket send failed: {e}");
                            return Ended::Lost { immediately: false };
                        }
                    }
                    Some(SocketCommand::Reconnect { force: false }) => {}
                    Some(SocketCommand::Reconnect { force: true }) => {
                        let _ = writer.close().await;
                        return Ended::Lost { immediately: true };
                    }
                    Some(SocketCommand::Disconnect(options)) => {
                        let _ = writer.close().await;
                        return Ended::Stopped(options);
                    }
                    None => {
                        let _ = writer.close().await;
                        return Ended::Shutdown;
                    }
                },
                frame = reader.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if self.events.send(TransportEvent::Message(text.as_str().to_owned())).is_err() {
                            return Ended::Shutdown;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Server closed the connection");
                        return Ended::Lost { immediately: false };
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return Ended::Lost { immediately: false };
                    }
                    // Control frames are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Sleep out the retry delay. An explicit reconnect cuts it short.
    /// Returns false if the task should exit.
    async fn back_off(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.retry_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Reconnect { .. }) => return true,
                    Some(SocketCommand::Disconnect(options)) => {
                        let kind = if options.permanent {
                            StatusKind::Failed
                        } else {
                            StatusKind::Offline
                        };
                        self.set_status(kind, 0, options.error);
                        return !options.permanent && self.wait_for_reconnect().await;
                    }
                    Some(SocketCommand::Send(_)) => log::debug!("Not connected; dropping frame"),
                    None => return false,
                },
            }
        }
    }

    /// Idle until asked to reconnect. Returns false if the handle is gone.
    async fn wait_for_reconnect(&mut self) -> bool {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                SocketCommand::Reconnect { .. } => return true,
                SocketCommand::Send(_) => log::debug!("Offline; dropping frame"),
                SocketCommand::Disconnect(_) => {}
            }
        }
        false
    }

    fn set_status(&self, status: StatusKind, retry_count: u32, reason: Option<String>) {
        self.status.send_replace(ConnectionStatus {
            status,
            retry_count,
            reason,
        });
    }
}
