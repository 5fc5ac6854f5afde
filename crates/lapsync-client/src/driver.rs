//! Background task: owns the socket and feeds the sync agent
//!
//! Connection lifecycle per attempt:
//! 1. connect (bounded by `connect_timeout`)
//! 2. wait for the snapshot (bounded by `resync_timeout`)
//! 3. relay events and commands until the socket drops
//!
//! Failures back off exponentially; after `max_attempts` consecutive
//! failures the agent gives up until `reconnect()` is called. Commands keep
//! being served in every phase so laps can be recorded offline.

use crate::backoff::delay_for_attempt;
use crate::{ClientConfig, ClientError, ClientStatus, Command, SyncObserver};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use lapsync_core::protocol::ServerMessage;
use lapsync_core::sync::{AgentState, Effect, Notice, SyncAgent};
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why a connected session ended
enum SessionEnd {
    Lost { was_synced: bool },
    Reconnect,
    Shutdown,
}

/// What interrupted a wait between attempts
enum WaitEnd {
    Elapsed,
    Reconnect,
    Shutdown,
}

pub(crate) struct Driver {
    config: ClientConfig,
    agent: SyncAgent,
    observer: Box<dyn SyncObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ClientStatus>,
    /// A submission failed on the server; re-request a snapshot soon
    retry_pending: bool,
}

impl Driver {
    pub(crate) fn new(
        config: ClientConfig,
        observer: Box<dyn SyncObserver>,
        commands: mpsc::UnboundedReceiver<Command>,
        status_tx: watch::Sender<ClientStatus>,
    ) -> Self {
        Self {
            config,
            agent: SyncAgent::new(),
            observer,
            commands,
            status_tx,
            retry_pending: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            let attempt = self.agent.begin_connect();
            self.publish_status();
            tracing::debug!(attempt, url = %self.config.url, "Connecting");

            let outcome = match self.connect(attempt).await {
                Ok(Some(ws)) => {
                    self.agent.on_connected(attempt);
                    self.session(attempt, ws).await
                }
                Ok(None) => {
                    let effects = self.agent.on_transport_lost(attempt);
                    self.notify(effects);
                    SessionEnd::Lost { was_synced: false }
                }
                Err(end) => end,
            };

            match outcome {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {
                    failures = 0;
                    continue;
                }
                SessionEnd::Lost { was_synced } => {
                    if was_synced {
                        failures = 0;
                    }
                    failures += 1;
                }
            }
            self.publish_status();

            if failures >= self.config.max_attempts {
                tracing::warn!(failures, "Giving up reconnecting");
                let effects = self.agent.on_gave_up();
                self.notify(effects);
                self.publish_status();
                match self.wait(None).await {
                    WaitEnd::Shutdown => break,
                    _ => {
                        failures = 0;
                        continue;
                    }
                }
            }

            let delay = delay_for_attempt(
                failures,
                self.config.initial_backoff,
                self.config.max_backoff,
            );
            tracing::info!(failures, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            match self.wait(Some(delay)).await {
                WaitEnd::Shutdown => break,
                WaitEnd::Reconnect => failures = 0,
                WaitEnd::Elapsed => {}
            }
        }

        let effects = self.agent.on_transport_lost(self.agent.current_attempt());
        self.notify(effects);
        self.publish_status();
        tracing::debug!("Sync client stopped");
    }

    /// Establish the socket, serving commands meanwhile
    ///
    /// `Ok(None)` means the attempt failed; `Err` carries a command that
    /// ended it.
    async fn connect(&mut self, attempt: u64) -> Result<Option<WsStream>, SessionEnd> {
        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.url.clone()),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return Ok(match result {
                        Ok(Ok((ws, _))) => Some(ws),
                        Ok(Err(e)) => {
                            tracing::warn!(attempt, "Connection failed: {}", e);
                            None
                        }
                        Err(_) => {
                            tracing::warn!(attempt, "Connection timed out");
                            None
                        }
                    });
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return Err(SessionEnd::Shutdown),
                    Some(Command::Reconnect) => return Err(SessionEnd::Reconnect),
                    Some(cmd) => {
                        // No transport yet, so nothing can be sent
                        let _ = self.handle_command(cmd, None).await;
                        self.publish_status();
                    }
                },
            }
        }
    }

    /// Relay traffic on an established socket until it ends
    async fn session(&mut self, attempt: u64, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut was_synced = false;

        let resync_deadline = tokio::time::sleep(self.config.resync_timeout);
        tokio::pin!(resync_deadline);
        let retry_timer = tokio::time::sleep(self.config.initial_backoff);
        tokio::pin!(retry_timer);

        loop {
            let before = self.agent.state();
            let lost = tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => {
                                let effects = self.agent.on_server_message(attempt, message);
                                self.apply(effects, Some(&mut sink)).await.is_err()
                            }
                            Err(e) => {
                                tracing::warn!("Ignoring unreadable server message: {}", e);
                                false
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => true,
                    Some(Ok(_)) => false,
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {}", e);
                        true
                    }
                },
                _ = &mut resync_deadline, if !self.agent.is_synced() => {
                    tracing::warn!(attempt, "Timed out waiting for snapshot");
                    true
                }
                _ = &mut retry_timer, if self.retry_pending => {
                    self.retry_pending = false;
                    match self.agent.request_snapshot() {
                        Some(effect) => self.apply(vec![effect], Some(&mut sink)).await.is_err(),
                        None => false,
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Reconnect) => {
                        let _ = sink.close().await;
                        let effects = self.agent.on_transport_lost(attempt);
                        self.notify(effects);
                        return SessionEnd::Reconnect;
                    }
                    Some(cmd) => self.handle_command(cmd, Some(&mut sink)).await.is_err(),
                },
            };

            if lost {
                break;
            }

            let after = self.agent.state();
            was_synced |= after == AgentState::Synced;
            if matches!(after, AgentState::Resyncing { .. }) && before == AgentState::Synced {
                resync_deadline
                    .as_mut()
                    .reset(Instant::now() + self.config.resync_timeout);
            }
            if self.retry_pending && retry_timer.is_elapsed() {
                arm(retry_timer.as_mut(), self.config.initial_backoff);
            }
            self.publish_status();
        }

        let effects = self.agent.on_transport_lost(attempt);
        self.notify(effects);
        SessionEnd::Lost { was_synced }
    }

    /// Sleep for `delay` (forever if `None`) while serving commands
    async fn wait(&mut self, delay: Option<std::time::Duration>) -> WaitEnd {
        // Disabled branch below when there is no delay
        let sleep = tokio::time::sleep(delay.unwrap_or(std::time::Duration::from_secs(3600)));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep, if delay.is_some() => return WaitEnd::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return WaitEnd::Shutdown,
                    Some(Command::Reconnect) => return WaitEnd::Reconnect,
                    Some(cmd) => {
                        let _ = self.handle_command(cmd, None).await;
                        self.publish_status();
                    }
                },
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        sink: Option<&mut WsSink>,
    ) -> Result<(), tungstenite::Error> {
        match cmd {
            Command::Record {
                client_record_id,
                elapsed_ms,
                captured_at,
            } => {
                let effects = self.agent.record(client_record_id, elapsed_ms, captured_at);
                self.apply(effects, sink).await
            }
            Command::RequestReset { reply } => {
                let effect = self.agent.request_reset();
                self.send_request(effect, reply, sink).await
            }
            Command::RequestSnapshot { reply } => {
                let effect = self.agent.request_snapshot();
                self.send_request(effect, reply, sink).await
            }
            // Handled by the phase loops
            Command::Reconnect | Command::Shutdown => Ok(()),
        }
    }

    async fn send_request(
        &mut self,
        effect: Option<Effect>,
        reply: tokio::sync::oneshot::Sender<Result<(), ClientError>>,
        sink: Option<&mut WsSink>,
    ) -> Result<(), tungstenite::Error> {
        match (effect, sink) {
            (Some(effect), Some(sink)) => {
                let result = self.apply(vec![effect], Some(sink)).await;
                let _ = reply.send(if result.is_ok() {
                    Ok(())
                } else {
                    Err(ClientError::NotConnected)
                });
                result
            }
            _ => {
                let _ = reply.send(Err(ClientError::NotConnected));
                Ok(())
            }
        }
    }

    async fn apply(
        &mut self,
        effects: Vec<Effect>,
        mut sink: Option<&mut WsSink>,
    ) -> Result<(), tungstenite::Error> {
        for effect in effects {
            match effect {
                Effect::Send(message) => {
                    let Some(sink) = sink.as_deref_mut() else {
                        continue;
                    };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to encode client message: {}", e);
                            continue;
                        }
                    };
                    sink.send(Message::Text(json.into())).await?;
                }
                Effect::Notify(notice) => self.deliver(notice),
            }
        }
        Ok(())
    }

    /// Deliver notices from an agent call that can't produce sends
    fn notify(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            if let Effect::Notify(notice) = effect {
                self.deliver(notice);
            }
        }
    }

    fn deliver(&mut self, notice: Notice) {
        if matches!(notice, Notice::SubmissionFailed { .. }) {
            self.retry_pending = true;
        }
        self.observer.on_notice(&notice);
    }

    fn publish_status(&self) {
        let status = ClientStatus {
            state: self.agent.state(),
            session_id: self.agent.session_id().cloned(),
            session_state: self.agent.session_state(),
            started_at: self.agent.started_at(),
            records: self.agent.records().to_vec(),
            pending: self.agent.pending().len(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn arm(timer: Pin<&mut Sleep>, delay: std::time::Duration) {
    timer.reset(Instant::now() + delay);
}
