use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use skillpulse_core::{encode_frame, OutboundMessage};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::OwnedPermit;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::events::{ClientEvent, EventEmitter};
use crate::timers::{TimerKey, TimerRegistry};
use crate::transport::{Connector, Link, LinkEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network outcome handed to the owner task.
#[derive(Debug)]
pub enum SupervisorEvent {
    Opened(Link),
    ConnectFailed(String),
    Frame(String),
    Closed(String),
}

/// Room for one outbound frame.
#[derive(Debug)]
pub enum SendSlot {
    /// No live link; a message sent now is dropped.
    Offline,
    /// The link is up but its outbound buffer is full.
    Busy,
    Ready(OwnedPermit<String>),
}

/// Owns the link and its lifecycle.
///
/// Lives inside the client's owner task. Connect attempts run on their own
/// task and report back through [`ConnectionSupervisor::next_event`]; the
/// heartbeat and reconnect timers are armed in the owner's registry.
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    endpoint: String,
    state: ConnectionState,
    backoff: Backoff,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    emitter: EventEmitter,
    link: Option<Link>,
    attempt: Option<JoinHandle<Result<Link, TransportError>>>,
}

impl ConnectionSupervisor {
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>, emitter: EventEmitter) -> Self {
        Self {
            connector,
            endpoint: config.url.clone(),
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(config.backoff),
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
            max_frame_bytes: config.max_frame_bytes,
            emitter,
            link: None,
            attempt: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Retries handed out since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// Waits for the next network outcome. Cancel safe; pending forever
    /// while there is neither an attempt in flight nor a live link.
    pub async fn next_event(&mut self) -> SupervisorEvent {
        if let Some(attempt) = self.attempt.as_mut() {
            let outcome = attempt.await;
            self.attempt = None;
            return match outcome {
                Ok(Ok(link)) => SupervisorEvent::Opened(link),
                Ok(Err(err)) => SupervisorEvent::ConnectFailed(err.to_string()),
                Err(err) => SupervisorEvent::ConnectFailed(format!("connect task failed: {err}")),
            };
        }
        if let Some(link) = self.link.as_mut() {
            return match link.inbound.recv().await {
                Some(LinkEvent::Frame(frame)) => SupervisorEvent::Frame(frame),
                Some(LinkEvent::Closed { reason }) => SupervisorEvent::Closed(reason),
                None => SupervisorEvent::Closed("link dropped".to_string()),
            };
        }
        std::future::pending().await
    }

    /// Starts a connect attempt if idle. Returns whether one was started.
    pub fn connect(&mut self, timers: &mut TimerRegistry<TimerKey>) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        let _ = timers.cancel(&TimerKey::Reconnect);
        self.state = ConnectionState::Connecting;
        info!(
            event = "connect_attempt",
            url = %self.endpoint,
            attempt = self.backoff.attempts()
        );
        let connector = Arc::clone(&self.connector);
        let limit = self.connect_timeout;
        self.attempt = Some(tokio::spawn(async move {
            tokio::time::timeout(limit, connector.connect())
                .await
                .unwrap_or(Err(TransportError::ConnectTimeout(limit)))
        }));
        true
    }

    /// Consumer-requested connect; also restarts an abandoned retry cycle.
    pub fn reconnect_now(&mut self, timers: &mut TimerRegistry<TimerKey>) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.backoff.reset();
        self.connect(timers)
    }

    pub fn on_opened(&mut self, link: Link, timers: &mut TimerRegistry<TimerKey>) {
        if self.state != ConnectionState::Connecting {
            debug!(event = "stale_link_discarded", state = %self.state);
            return;
        }
        self.state = ConnectionState::Connected;
        self.link = Some(link);
        self.backoff.reset();
        timers.schedule_every(TimerKey::Heartbeat, self.heartbeat_interval);
        info!(event = "connected", url = %self.endpoint);
        let _ = self.emitter.emit(ClientEvent::Connectivity { connected: true });
    }

    pub fn on_connect_failed(&mut self, reason: &str, timers: &mut TimerRegistry<TimerKey>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        warn!(event = "connect_failed", url = %self.endpoint, error = %reason);
        self.state = ConnectionState::Disconnected;
        self.schedule_reconnect(timers);
    }

    pub fn on_closed(&mut self, reason: &str, timers: &mut TimerRegistry<TimerKey>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.link = None;
        self.state = ConnectionState::Disconnected;
        let _ = timers.cancel(&TimerKey::Heartbeat);
        warn!(event = "link_closed", url = %self.endpoint, reason = %reason);
        let _ = self.emitter.emit(ClientEvent::Connectivity { connected: false });
        self.schedule_reconnect(timers);
    }

    fn schedule_reconnect(&mut self, timers: &mut TimerRegistry<TimerKey>) {
        if self.state == ConnectionState::Stopped {
            return;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    event = "reconnect_scheduled",
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempts()
                );
                timers.schedule_once(TimerKey::Reconnect, delay);
            }
            None => {
                warn!(
                    event = "reconnect_abandoned",
                    url = %self.endpoint,
                    attempts = self.backoff.attempts()
                );
            }
        }
    }

    /// Claims buffer space on the live link without waiting.
    pub fn reserve(&self) -> SendSlot {
        let Some(link) = self.link.as_ref().filter(|_| self.is_connected()) else {
            return SendSlot::Offline;
        };
        match link.outbound.clone().try_reserve_owned() {
            Ok(permit) => SendSlot::Ready(permit),
            Err(TrySendError::Full(_)) => SendSlot::Busy,
            Err(TrySendError::Closed(_)) => SendSlot::Offline,
        }
    }

    /// Encodes `message` into a slot taken from [`Self::reserve`].
    pub fn send_reserved(&self, permit: OwnedPermit<String>, message: &OutboundMessage) -> bool {
        match encode_frame(message, self.max_frame_bytes) {
            Ok(frame) => {
                let _ = permit.send(frame);
                true
            }
            Err(err) => {
                warn!(event = "frame_encode_error", kind = message.kind(), error = %err);
                false
            }
        }
    }

    /// Encodes and writes `message` when connected. Otherwise the message is
    /// dropped; nothing is queued for a later link.
    pub fn send(&mut self, message: &OutboundMessage) -> bool {
        match self.reserve() {
            SendSlot::Ready(permit) => self.send_reserved(permit, message),
            SendSlot::Busy => {
                warn!(event = "send_failed", kind = message.kind(), error = "outbound buffer full");
                false
            }
            SendSlot::Offline => {
                debug!(event = "send_dropped", kind = message.kind(), state = %self.state);
                false
            }
        }
    }

    /// Stops for good. Returns `false` if already stopped.
    pub fn shutdown(&mut self, timers: &mut TimerRegistry<TimerKey>) -> bool {
        if self.state == ConnectionState::Stopped {
            return false;
        }
        let was_connected = self.is_connected();
        self.state = ConnectionState::Stopped;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.link = None;
        let _ = timers.cancel(&TimerKey::Heartbeat);
        let _ = timers.cancel(&TimerKey::Reconnect);
        if was_connected {
            let _ = self.emitter.emit(ClientEvent::Connectivity { connected: false });
        }
        info!(event = "supervisor_stopped", url = %self.endpoint);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use async_trait::async_trait;
    use skillpulse_core::decode_frame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct Refusing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> Result<Link, TransportError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect("refused".to_string()))
        }
    }

    fn config(max_attempts: u32) -> ClientConfig {
        ClientConfig {
            backoff: BackoffPolicy {
                max_attempts,
                ..BackoffPolicy::default()
            },
            ..ClientConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_schedules_backoff_retry() {
        let connector = Arc::new(Refusing {
            calls: AtomicUsize::new(0),
        });
        let mut timers = TimerRegistry::new();
        let mut supervisor =
            ConnectionSupervisor::new(&config(2), connector.clone(), EventEmitter::new());

        assert!(supervisor.connect(&mut timers));
        assert!(!supervisor.connect(&mut timers));
        let SupervisorEvent::ConnectFailed(reason) = supervisor.next_event().await else {
            panic!("expected connect failure");
        };
        supervisor.on_connect_failed(&reason, &mut timers);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(timers.is_scheduled(&TimerKey::Reconnect));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        assert_eq!(timers.next_expired().await, TimerKey::Reconnect);
        assert!(supervisor.connect(&mut timers));
        let SupervisorEvent::ConnectFailed(reason) = supervisor.next_event().await else {
            panic!("expected connect failure");
        };
        supervisor.on_connect_failed(&reason, &mut timers);
        assert!(timers.is_scheduled(&TimerKey::Reconnect));

        assert_eq!(timers.next_expired().await, TimerKey::Reconnect);
        assert!(supervisor.connect(&mut timers));
        let SupervisorEvent::ConnectFailed(reason) = supervisor.next_event().await else {
            panic!("expected connect failure");
        };
        supervisor.on_connect_failed(&reason, &mut timers);
        assert!(!timers.is_scheduled(&TimerKey::Reconnect));
        assert_eq!(supervisor.attempts(), 2);

        assert!(supervisor.reconnect_now(&mut timers));
        assert_eq!(supervisor.attempts(), 0);
    }

    struct Silent;

    #[async_trait]
    impl Connector for Silent {
        async fn connect(&self) -> Result<Link, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out_into_backoff() {
        let mut timers = TimerRegistry::new();
        let settings = ClientConfig {
            connect_timeout: Duration::from_secs(4),
            ..config(10)
        };
        let mut supervisor =
            ConnectionSupervisor::new(&settings, Arc::new(Silent), EventEmitter::new());

        let start = tokio::time::Instant::now();
        assert!(supervisor.connect(&mut timers));
        let SupervisorEvent::ConnectFailed(reason) = supervisor.next_event().await else {
            panic!("expected connect failure");
        };
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_secs(4) && waited < Duration::from_secs(5),
            "gave up after {waited:?}"
        );
        assert_eq!(
            reason,
            TransportError::ConnectTimeout(Duration::from_secs(4)).to_string()
        );

        supervisor.on_connect_failed(&reason, &mut timers);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(timers.is_scheduled(&TimerKey::Reconnect));
        assert_eq!(timers.next_expired().await, TimerKey::Reconnect);
        assert!(supervisor.connect(&mut timers));
    }

    #[tokio::test(start_paused = true)]
    async fn full_link_reports_busy_until_drained() {
        let connector = Arc::new(Refusing {
            calls: AtomicUsize::new(0),
        });
        let mut timers = TimerRegistry::new();
        let mut supervisor =
            ConnectionSupervisor::new(&config(10), connector, EventEmitter::new());
        assert!(matches!(supervisor.reserve(), SendSlot::Offline));

        let (link, mut far_outbound, _far_inbound) = Link::pair(1);
        supervisor.state = ConnectionState::Connecting;
        supervisor.on_opened(link, &mut timers);

        assert!(supervisor.send(&OutboundMessage::Heartbeat));
        assert!(matches!(supervisor.reserve(), SendSlot::Busy));
        assert!(!supervisor.send(&OutboundMessage::Heartbeat));

        assert!(far_outbound.recv().await.is_some());
        let SendSlot::Ready(permit) = supervisor.reserve() else {
            panic!("expected a free slot");
        };
        assert!(supervisor.send_reserved(permit, &OutboundMessage::Heartbeat));
        assert!(far_outbound.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn open_link_sends_and_reports_close() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        let mut timers = TimerRegistry::new();
        let connector = Arc::new(Refusing {
            calls: AtomicUsize::new(0),
        });
        let mut supervisor = ConnectionSupervisor::new(&config(10), connector, emitter);

        assert!(!supervisor.send(&OutboundMessage::Heartbeat));

        let (link, mut far_outbound, far_inbound) = Link::pair(8);
        supervisor.state = ConnectionState::Connecting;
        supervisor.on_opened(link, &mut timers);
        assert!(supervisor.is_connected());
        assert!(timers.is_scheduled(&TimerKey::Heartbeat));

        assert!(supervisor.send(&OutboundMessage::Heartbeat));
        let frame = far_outbound.recv().await.expect("frame");
        let sent: OutboundMessage = decode_frame(frame.as_bytes(), 1024).expect("decode");
        assert_eq!(sent, OutboundMessage::Heartbeat);

        far_inbound
            .send(LinkEvent::Frame("{\"type\":\"heartbeat_ack\"}".to_string()))
            .await
            .expect("frame");
        far_inbound
            .send(LinkEvent::Closed {
                reason: "peer closed".to_string(),
            })
            .await
            .expect("close");
        assert!(matches!(supervisor.next_event().await, SupervisorEvent::Frame(_)));
        let SupervisorEvent::Closed(reason) = supervisor.next_event().await else {
            panic!("expected close");
        };
        supervisor.on_closed(&reason, &mut timers);

        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!timers.is_scheduled(&TimerKey::Heartbeat));
        assert!(timers.is_scheduled(&TimerKey::Reconnect));
        assert_eq!(
            drain(&mut rx),
            vec![
                ClientEvent::Connectivity { connected: true },
                ClientEvent::Connectivity { connected: false },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_terminal_and_idempotent() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        let mut timers = TimerRegistry::new();
        let connector = Arc::new(Refusing {
            calls: AtomicUsize::new(0),
        });
        let mut supervisor = ConnectionSupervisor::new(&config(10), connector, emitter);

        let (link, mut far_outbound, _far_inbound) = Link::pair(8);
        supervisor.state = ConnectionState::Connecting;
        supervisor.on_opened(link, &mut timers);
        let _ = drain(&mut rx);

        assert!(supervisor.shutdown(&mut timers));
        assert!(!supervisor.shutdown(&mut timers));
        assert_eq!(supervisor.state(), ConnectionState::Stopped);
        assert!(timers.is_empty());
        assert!(!supervisor.connect(&mut timers));
        assert!(!supervisor.send(&OutboundMessage::Heartbeat));
        assert_eq!(far_outbound.recv().await, None);
        assert_eq!(
            drain(&mut rx),
            vec![ClientEvent::Connectivity { connected: false }]
        );

        let (late, _, _) = Link::pair(1);
        supervisor.on_opened(late, &mut timers);
        assert_eq!(supervisor.state(), ConnectionState::Stopped);
    }
}
