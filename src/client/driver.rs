use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::ClientConfig;
use crate::topic::Topic;
use crate::websocket::Envelope;

use super::session::{ClientSession, SessionAction};
use super::state::SessionState;
use super::stats::ConnectionStats;
use super::transport::{ClientTransport, Connector};
use super::ClientError;

const COMMAND_BUFFER: usize = 32;
const ENVELOPE_BUFFER: usize = 256;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn ClientTransport>, ClientError>> + Send>>;

#[derive(Debug, Clone, Copy)]
enum SessionCommand {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Disconnect,
    Reconnect,
}

/// Observable session details besides the state itself
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub stats: ConnectionStats,
    pub desired_topics: Vec<Topic>,
    pub loading_topics: Vec<Topic>,
    /// Latest snapshot payload per topic
    pub snapshots: BTreeMap<Topic, Arc<Value>>,
}

/// Handle to a background task driving a [`ClientSession`] over a
/// [`Connector`]. Dropping the handle stops the task.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start connecting immediately. Received envelopes are forwarded to the
    /// returned receiver.
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        Self::spawn_session(ClientSession::new(&config), &config, connector)
    }

    pub fn spawn_session(
        session: ClientSession,
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (envelope_tx, envelope_rx) = mpsc::channel(ENVELOPE_BUFFER);
        let (state_tx, state) = watch::channel(session.state());
        let (status_tx, status) = watch::channel(SessionStatus::default());

        let driver = Driver {
            session,
            connector,
            transport: None,
            connecting: None,
            heartbeat_period: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            heartbeat: None,
            reconnect_at: None,
            commands: command_rx,
            envelopes: envelope_tx,
            state_tx,
            status_tx,
        };
        let task = tokio::spawn(driver.run());

        (
            Self {
                commands,
                state,
                status,
                task,
            },
            envelope_rx,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch channel that changes with every state transition
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.status.borrow().stats.clone()
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<(), ClientError> {
        self.send(SessionCommand::Subscribe(topic)).await
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), ClientError> {
        self.send(SessionCommand::Unsubscribe(topic)).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.send(SessionCommand::Disconnect).await
    }

    /// Disconnect, then connect again with the same desired topics
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.send(SessionCommand::Reconnect).await
    }

    /// Disconnect and wait for the driver task to finish
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Disconnect).await;
        drop(self.commands);
        let _ = self.task.await;
    }

    async fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.commands.send(command).await.map_err(|_| ClientError::Closed)
    }
}

struct Driver {
    session: ClientSession,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn ClientTransport>>,
    /// In-flight connect attempt; dropping it abandons the attempt
    connecting: Option<ConnectFuture>,
    heartbeat_period: Duration,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    commands: mpsc::Receiver<SessionCommand>,
    envelopes: mpsc::Sender<Envelope>,
    state_tx: watch::Sender<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
}

impl Driver {
    async fn run(mut self) {
        let initial = self.session.connect();
        self.handle(initial).await;

        loop {
            let actions = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        let actions = self.session.disconnect();
                        self.execute(actions).await;
                        break;
                    }
                },
                attempt = pending_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(attempt)
                }
                incoming = next_frame(&mut self.transport) => self.on_frame(incoming),
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.session.on_backoff_elapsed()
                }
                _ = tick(&mut self.heartbeat) => {
                    Ok(self.session.heartbeat_tick(Utc::now().timestamp_millis()).into_iter().collect())
                }
            };
            self.handle(actions).await;
        }

        tracing::debug!("Client session driver stopped");
    }

    fn on_command(&mut self, command: SessionCommand) -> Result<Vec<SessionAction>, ClientError> {
        match command {
            SessionCommand::Subscribe(topic) => Ok(self.session.subscribe(topic)),
            SessionCommand::Unsubscribe(topic) => Ok(self.session.unsubscribe(topic)),
            SessionCommand::Disconnect => Ok(self.session.disconnect()),
            SessionCommand::Reconnect => {
                let mut actions = self.session.disconnect();
                actions.extend(self.session.connect()?);
                Ok(actions)
            }
        }
    }

    fn on_connect_result(
        &mut self,
        attempt: Result<Box<dyn ClientTransport>, ClientError>,
    ) -> Result<Vec<SessionAction>, ClientError> {
        match attempt {
            Ok(transport) => {
                self.transport = Some(transport);
                tracing::info!("Session connected");
                self.session.on_open(std::time::Instant::now())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connect attempt failed");
                self.session.on_transport_lost()
            }
        }
    }

    fn on_frame(&mut self, frame: Option<Result<String, ClientError>>) -> Result<Vec<SessionAction>, ClientError> {
        let text = match frame {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Transport error");
                self.transport = None;
                return self.session.on_transport_lost();
            }
            None => {
                tracing::info!("Transport closed by hub");
                self.transport = None;
                return self.session.on_transport_lost();
            }
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse envelope");
                return Ok(Vec::new());
            }
        };

        let actions = self.session.on_envelope(&envelope, Utc::now().timestamp_millis());
        if let Err(e) = self.envelopes.try_send(envelope) {
            tracing::debug!(error = %e, "Envelope receiver unavailable");
        }
        Ok(actions)
    }

    async fn handle(&mut self, actions: Result<Vec<SessionAction>, ClientError>) {
        match actions {
            Ok(actions) => self.execute(actions).await,
            Err(e) => tracing::debug!(error = %e, "Ignored session input"),
        }
        self.publish();
    }

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            let follow_up = match action {
                SessionAction::Open => {
                    let connector = self.connector.clone();
                    self.connecting = Some(Box::pin(async move { connector.connect().await }));
                    Ok(Vec::new())
                }
                SessionAction::Close => {
                    self.connecting = None;
                    if let Some(mut transport) = self.transport.take() {
                        transport.close().await;
                    }
                    Ok(Vec::new())
                }
                SessionAction::Send(message) => self.send(&message).await,
                SessionAction::ScheduleReconnect(delay) => {
                    self.reconnect_at = Some(Instant::now() + delay);
                    Ok(Vec::new())
                }
                SessionAction::CancelReconnect => {
                    self.reconnect_at = None;
                    Ok(Vec::new())
                }
                SessionAction::StartHeartbeat => {
                    let mut interval =
                        tokio::time::interval_at(Instant::now() + self.heartbeat_period, self.heartbeat_period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(interval);
                    Ok(Vec::new())
                }
                SessionAction::StopHeartbeat => {
                    self.heartbeat = None;
                    Ok(Vec::new())
                }
            };

            match follow_up {
                Ok(actions) => queue.extend(actions),
                Err(e) => tracing::debug!(error = %e, "Ignored session input"),
            }
            self.publish();
        }
    }

    async fn send(&mut self, message: &crate::websocket::ClientMessage) -> Result<Vec<SessionAction>, ClientError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(Vec::new());
        };
        let text = serde_json::to_string(message)?;
        if let Err(e) = transport.send(text).await {
            tracing::warn!(error = %e, "Send failed");
            self.transport = None;
            return self.session.on_transport_lost();
        }
        Ok(Vec::new())
    }

    /// Status goes out before state so state watchers see matching status
    fn publish(&self) {
        let _ = self.status_tx.send(SessionStatus {
            stats: self.session.stats(std::time::Instant::now()),
            desired_topics: self.session.desired_topics(),
            loading_topics: self.session.loading_topics(),
            snapshots: self.session.snapshots(),
        });
        self.state_tx.send_if_modified(|state| {
            let next = self.session.state();
            let changed = *state != next;
            *state = next;
            changed
        });
    }
}

async fn pending_connect(
    attempt: &mut Option<ConnectFuture>,
) -> Result<Box<dyn ClientTransport>, ClientError> {
    match attempt {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(transport: &mut Option<Box<dyn ClientTransport>>) -> Option<Result<String, ClientError>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
