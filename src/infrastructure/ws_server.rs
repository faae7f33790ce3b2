//! WebSocket bridge between real connections and the in-process event bus.
//!
//! A client connects to `ws://host/{session_id}`, receives the session's
//! event stream (preceded by a history replay when the session is already
//! running), and may send commands (`pause`, `resume`, `stop`, `ping`) that
//! are acknowledged with `command_ack` events.

use crate::application::backtest::BacktestEngine;
use crate::application::forward::ForwardEngine;
use crate::domain::events::{Command, Event, EventKind};
use crate::infrastructure::event_bus::EventBus;
use anyhow::{Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{debug, info, warn};

pub struct WsServer {
    bus: EventBus,
    backtest: Arc<BacktestEngine>,
    forward: Arc<ForwardEngine>,
}

impl WsServer {
    pub fn new(bus: EventBus, backtest: Arc<BacktestEngine>, forward: Arc<ForwardEngine>) -> Self {
        Self {
            bus,
            backtest,
            forward,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("WebSocket server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Incoming WebSocket connection from {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_socket(stream).await {
                    debug!("WebSocket connection ended: {e:#}");
                }
            });
        }
    }

    async fn handle_socket(&self, stream: TcpStream) -> Result<()> {
        let mut path = String::new();
        let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
            path = request.uri().path().to_string();
            Ok(response)
        })
        .await?;

        let session_id = path.trim_matches('/').to_string();
        if session_id.is_empty() {
            return Err(anyhow!("connection rejected: no session id in path"));
        }

        let (connection_id, mut events) = self.bus.connect(&session_id).await;
        let (mut sink, mut incoming) = ws.split();

        // Writer: drain the bus channel into the socket. Per-connection
        // ordering is the channel's FIFO order.
        let writer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if sink.send(Message::text(event.to_json())).await.is_err() {
                    break;
                }
            }
        });

        // Catch a late joiner up with the session history; live events queue
        // behind the replay on the same channel.
        self.backtest
            .send_history_to_connection(&session_id, &connection_id)
            .await;
        self.forward
            .send_history_to_connection(&session_id, &connection_id)
            .await;

        while let Some(message) = incoming.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    self.handle_command(&session_id, &connection_id, text.as_str())
                        .await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket read error: {e}");
                    break;
                }
            }
        }

        self.bus.disconnect(&connection_id).await;
        writer.abort();
        Ok(())
    }

    async fn handle_command(&self, session_id: &str, connection_id: &str, text: &str) {
        let command: Command = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("Unparseable command on {connection_id}: {e}");
                self.send_error(connection_id, "INVALID_COMMAND", &format!("{e}"))
                    .await;
                return;
            }
        };

        let is_backtest = self.backtest.is_session_active(session_id).await;
        let outcome = match &command {
            Command::Ping => Ok(None),
            Command::Pause => {
                let result = if is_backtest {
                    self.backtest.pause(session_id).await
                } else {
                    self.forward.pause(session_id).await
                };
                result.map(|_| None)
            }
            Command::Resume => {
                let result = if is_backtest {
                    self.backtest.resume(session_id).await
                } else {
                    self.forward.resume(session_id).await
                };
                result.map(|_| None)
            }
            Command::Stop { close_position } => {
                // The recovery path inside either engine also covers
                // sessions that only exist in the database.
                let result = if self.forward.is_session_active(session_id).await {
                    self.forward.stop(session_id, *close_position).await
                } else {
                    self.backtest.stop(session_id, *close_position).await
                };
                result.map(Some)
            }
        };

        match outcome {
            Ok(result_id) => {
                let ack = Event::new(EventKind::CommandAck {
                    action: command.action_name().to_string(),
                    result_id,
                });
                self.bus.send_to_connection(connection_id, ack).await;
            }
            Err(e) => {
                self.send_error(connection_id, "COMMAND_FAILED", &format!("{e:#}"))
                    .await;
            }
        }
    }

    async fn send_error(&self, connection_id: &str, code: &str, message: &str) {
        let event = Event::new(EventKind::Error {
            message: message.to_string(),
            error_code: Some(code.to_string()),
        });
        self.bus.send_to_connection(connection_id, event).await;
    }
}
