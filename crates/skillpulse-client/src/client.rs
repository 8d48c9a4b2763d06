//! The event client facade: one owner task, many cheap handles.

use std::sync::Arc;

use chrono::Utc;
use skillpulse_core::{
    decode_inbound, ConfirmationRequest, Execution, InboundMessage, OutboundMessage,
    RememberScope, ResolutionReason,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::arbiter::ConfirmationArbiter;
use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::events::{ClientEvent, EventEmitter};
use crate::ledger::ExecutionLedger;
use crate::supervisor::{ConnectionState, ConnectionSupervisor, SendSlot, SupervisorEvent};
use crate::timers::{TimerKey, TimerRegistry};
use crate::transport::{Connector, WsConnector};

const COMMAND_CAPACITY: usize = 64;

enum Command {
    Respond {
        id: String,
        response: String,
        remember: RememberScope,
        reply: oneshot::Sender<bool>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Connect {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        id: String,
        reply: oneshot::Sender<Option<Execution>>,
    },
    ListRunning {
        reply: oneshot::Sender<Vec<Execution>>,
    },
    ListExecutions {
        reply: oneshot::Sender<Vec<Execution>>,
    },
    ListPending {
        reply: oneshot::Sender<Vec<ConfirmationRequest>>,
    },
    ListStale {
        reply: oneshot::Sender<Vec<Execution>>,
    },
    ConnectionState {
        reply: oneshot::Sender<ConnectionState>,
    },
    Shutdown {
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to a running event client.
///
/// Cloning is cheap; every clone talks to the same owner task. The owner
/// keeps running until [`EventClient::shutdown`] is called or every handle
/// is dropped.
#[derive(Clone)]
pub struct EventClient {
    commands: mpsc::Sender<Command>,
    emitter: EventEmitter,
}

impl EventClient {
    /// Spawns the owner task on the current runtime and starts connecting.
    pub fn spawn<C>(config: ClientConfig, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        Self::spawn_shared(config, Arc::new(connector))
    }

    pub fn spawn_shared(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let emitter = EventEmitter::with_capacity(config.event_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = ClientTask {
            supervisor: ConnectionSupervisor::new(&config, connector, emitter.clone()),
            ledger: ExecutionLedger::new(
                emitter.clone(),
                config.completed_grace,
                config.max_steps,
            ),
            arbiter: ConfirmationArbiter::new(emitter.clone(), config.default_confirmation_timeout),
            timers: TimerRegistry::new(),
            commands: commands_rx,
            emitter: emitter.clone(),
            config,
        };
        tokio::spawn(task.run());
        Self {
            commands: commands_tx,
            emitter,
        }
    }

    /// Client over the WebSocket transport at `config.url`.
    pub fn connect_ws(config: ClientConfig) -> Result<Self, TransportError> {
        let connector = WsConnector::new(&config.url, config.link_capacity)?;
        Ok(Self::spawn(config, connector))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.emitter.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)
    }

    /// Answers a live confirmation. `Ok(false)` when `id` is not live.
    pub async fn respond(
        &self,
        id: impl Into<String>,
        response: impl Into<String>,
        remember: RememberScope,
    ) -> Result<bool, ClientError> {
        let id = id.into();
        let response = response.into();
        self.request(|reply| Command::Respond {
            id,
            response,
            remember,
            reply,
        })
        .await
    }

    pub async fn pause(&self, id: impl Into<String>) -> Result<bool, ClientError> {
        let id = id.into();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    pub async fn resume(&self, id: impl Into<String>) -> Result<bool, ClientError> {
        let id = id.into();
        self.request(|reply| Command::Resume { id, reply }).await
    }

    /// Connects now if disconnected, restarting an abandoned retry cycle.
    pub async fn connect(&self) -> Result<bool, ClientError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn snapshot(&self, id: impl Into<String>) -> Result<Option<Execution>, ClientError> {
        let id = id.into();
        self.request(|reply| Command::Snapshot { id, reply }).await
    }

    pub async fn list_running(&self) -> Result<Vec<Execution>, ClientError> {
        self.request(|reply| Command::ListRunning { reply }).await
    }

    pub async fn list_executions(&self) -> Result<Vec<Execution>, ClientError> {
        self.request(|reply| Command::ListExecutions { reply }).await
    }

    pub async fn list_pending(&self) -> Result<Vec<ConfirmationRequest>, ClientError> {
        self.request(|reply| Command::ListPending { reply }).await
    }

    /// Running executions quiet for longer than the configured `stale_after`.
    pub async fn list_stale(&self) -> Result<Vec<Execution>, ClientError> {
        self.request(|reply| Command::ListStale { reply }).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, ClientError> {
        self.request(|reply| Command::ConnectionState { reply }).await
    }

    /// Disposes the client and waits for it to finish. Returns `false` when
    /// it had already been shut down.
    pub async fn shutdown(&self) -> bool {
        self.request(|reply| Command::Shutdown { reply })
            .await
            .unwrap_or(false)
    }
}

struct ClientTask {
    config: ClientConfig,
    supervisor: ConnectionSupervisor,
    ledger: ExecutionLedger,
    arbiter: ConfirmationArbiter,
    timers: TimerRegistry<TimerKey>,
    commands: mpsc::Receiver<Command>,
    emitter: EventEmitter,
}

impl ClientTask {
    async fn run(mut self) {
        let _ = self.supervisor.connect(&mut self.timers);
        loop {
            // Due timers first so a busy link cannot push countdowns past
            // their deadline; frames already received still go before
            // commands queued after them.
            tokio::select! {
                biased;
                key = self.timers.next_expired() => self.on_timer(key),
                event = self.supervisor.next_event() => self.on_supervisor_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.dispose();
                        let _ = reply.send(true);
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.dispose();
                        return;
                    }
                },
            }
        }
    }

    fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Opened(link) => self.supervisor.on_opened(link, &mut self.timers),
            SupervisorEvent::ConnectFailed(reason) => {
                self.supervisor.on_connect_failed(&reason, &mut self.timers)
            }
            SupervisorEvent::Frame(frame) => self.on_frame(&frame),
            SupervisorEvent::Closed(reason) => self.supervisor.on_closed(&reason, &mut self.timers),
        }
    }

    fn on_frame(&mut self, frame: &str) {
        match decode_inbound(frame.as_bytes(), self.config.max_frame_bytes) {
            Ok(message) => self.dispatch(message),
            Err(err) => warn!(event = "frame_decode_error", error = %err, bytes = frame.len()),
        }
    }

    fn dispatch(&mut self, message: InboundMessage) {
        let timers = &mut self.timers;
        match message {
            InboundMessage::Connected(payload) => {
                info!(
                    event = "server_hello",
                    running = payload.running_executions.len(),
                    pending = payload.pending_confirmations.len()
                );
                for execution in &payload.running_executions {
                    self.ledger.on_started(execution, timers);
                }
                for confirmation in &payload.pending_confirmations {
                    let _ = self.arbiter.on_confirmation_required(confirmation, timers);
                }
            }
            InboundMessage::SkillStarted(payload) => self.ledger.on_started(&payload, timers),
            InboundMessage::StepStarted(payload) => self.ledger.on_step_started(&payload),
            InboundMessage::StepCompleted(payload) => self.ledger.on_step_completed(&payload),
            InboundMessage::StepFailed(payload) => self.ledger.on_step_failed(&payload),
            InboundMessage::SkillCompleted(payload) => {
                self.ledger.on_ended(&payload.skill_id, true, timers)
            }
            InboundMessage::SkillFailed(payload) => {
                self.ledger.on_ended(&payload.skill_id, false, timers)
            }
            InboundMessage::AutoHealTriggered(payload) => {
                let _ = self.emitter.emit(ClientEvent::AutoHealTriggered(payload));
            }
            InboundMessage::AutoHealCompleted(payload) => {
                let _ = self.emitter.emit(ClientEvent::AutoHealCompleted(payload));
            }
            InboundMessage::ConfirmationRequired(payload) => {
                let _ = self.arbiter.on_confirmation_required(&payload, timers);
            }
            InboundMessage::ConfirmationAnswered(payload) => {
                let _ = self
                    .arbiter
                    .on_server_resolved(&payload.id, ResolutionReason::Answered, timers);
            }
            InboundMessage::ConfirmationExpired(payload) => {
                let _ = self
                    .arbiter
                    .on_server_resolved(&payload.id, ResolutionReason::ServerExpired, timers);
            }
            InboundMessage::HeartbeatAck => debug!(event = "heartbeat_ack"),
            InboundMessage::Unrecognized { kind } => {
                debug!(event = "unrecognized_message", kind = %kind)
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Heartbeat => {
                let _ = self.supervisor.send(&OutboundMessage::Heartbeat);
            }
            TimerKey::Reconnect => {
                let _ = self.supervisor.connect(&mut self.timers);
            }
            TimerKey::Countdown(id) => self.arbiter.on_tick(&id, &mut self.timers),
            TimerKey::Removal(id) => {
                let _ = self.ledger.remove(&id);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Respond {
                id,
                response,
                remember,
                reply,
            } => {
                let acted = self.relay(|arbiter, timers| {
                    arbiter.respond(&id, &response, remember, timers)
                });
                let _ = reply.send(acted);
            }
            Command::Pause { id, reply } => {
                let acted = self.relay(|arbiter, timers| arbiter.pause(&id, timers));
                let _ = reply.send(acted);
            }
            Command::Resume { id, reply } => {
                let acted = self.relay(|arbiter, timers| arbiter.resume(&id, timers));
                let _ = reply.send(acted);
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.supervisor.reconnect_now(&mut self.timers));
            }
            Command::Snapshot { id, reply } => {
                let _ = reply.send(self.ledger.snapshot(&id));
            }
            Command::ListRunning { reply } => {
                let _ = reply.send(self.ledger.list_running());
            }
            Command::ListExecutions { reply } => {
                let _ = reply.send(self.ledger.list_all());
            }
            Command::ListPending { reply } => {
                let _ = reply.send(self.arbiter.list_pending());
            }
            Command::ListStale { reply } => {
                let _ = reply.send(self.ledger.list_stale(Utc::now(), self.config.stale_after));
            }
            Command::ConnectionState { reply } => {
                let _ = reply.send(self.supervisor.state());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(false);
            }
        }
    }

    /// Runs an arbiter action whose outcome goes to the orchestrator.
    ///
    /// Link space is claimed before the action runs: with a live but full
    /// link nothing changes and the caller sees `false`. With no link the
    /// action still applies locally and its message is dropped.
    fn relay<F>(&mut self, act: F) -> bool
    where
        F: FnOnce(
            &mut ConfirmationArbiter,
            &mut TimerRegistry<TimerKey>,
        ) -> Option<OutboundMessage>,
    {
        let slot = self.supervisor.reserve();
        if let SendSlot::Busy = slot {
            warn!(event = "command_rejected", error = "outbound buffer full");
            return false;
        }
        let Some(message) = act(&mut self.arbiter, &mut self.timers) else {
            return false;
        };
        match slot {
            SendSlot::Ready(permit) => {
                let _ = self.supervisor.send_reserved(permit, &message);
            }
            SendSlot::Busy | SendSlot::Offline => debug!(
                event = "send_dropped",
                kind = message.kind(),
                state = %self.supervisor.state()
            ),
        }
        true
    }

    fn dispose(&mut self) {
        let _ = self.supervisor.shutdown(&mut self.timers);
        let resolved = self.arbiter.shutdown(&mut self.timers);
        let cancelled = self.timers.cancel_all();
        let cleared = self.ledger.clear();
        self.commands.close();
        info!(
            event = "client_disposed",
            resolved_confirmations = resolved,
            cancelled_timers = cancelled,
            executions = cleared
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<crate::transport::Link, TransportError> {
            Err(TransportError::Connect("unreachable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_twice_reports_once() {
        let client = EventClient::spawn(ClientConfig::default(), Unreachable);
        let clone = client.clone();

        assert!(client.shutdown().await);
        assert!(!clone.shutdown().await);
        assert_eq!(client.list_running().await, Err(ClientError::Closed));
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_work_while_disconnected() {
        let client = EventClient::spawn(ClientConfig::default(), Unreachable);

        assert_eq!(client.list_pending().await, Ok(Vec::new()));
        assert_eq!(client.snapshot("s1").await, Ok(None));
        assert_eq!(client.respond("c1", "yes", RememberScope::None).await, Ok(false));
        assert!(matches!(
            client.connection_state().await,
            Ok(ConnectionState::Connecting | ConnectionState::Disconnected)
        ));
        assert!(client.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_stops_the_task() {
        let client = EventClient::spawn(ClientConfig::default(), Unreachable);
        let mut events = client.subscribe();
        drop(client);

        loop {
            match events.recv().await {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => continue,
            }
        }
    }
}
