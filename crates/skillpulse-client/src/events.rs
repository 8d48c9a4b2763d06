//! Notifications published to consumers of the client.

use serde::Serialize;
use skillpulse_core::{
    AutoHealPayload, ConfirmationRequest, Execution, ResolutionReason, Step,
};
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Every variant carries an owned snapshot; subscribers never see live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connectivity {
        connected: bool,
    },
    ExecutionStarted(Execution),
    ExecutionUpdated(Execution),
    ExecutionCompleted(Execution),
    ExecutionRemoved {
        execution_id: String,
    },
    StepUpdated {
        execution_id: String,
        step: Step,
    },
    ConfirmationRequired(ConfirmationRequest),
    ConfirmationTick {
        id: String,
        remaining_seconds: u64,
    },
    ConfirmationResolved {
        id: String,
        reason: ResolutionReason,
    },
    AutoHealTriggered(AutoHealPayload),
    AutoHealCompleted(AutoHealPayload),
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "connectivity",
            Self::ExecutionStarted(_) => "execution_started",
            Self::ExecutionUpdated(_) => "execution_updated",
            Self::ExecutionCompleted(_) => "execution_completed",
            Self::ExecutionRemoved { .. } => "execution_removed",
            Self::StepUpdated { .. } => "step_updated",
            Self::ConfirmationRequired(_) => "confirmation_required",
            Self::ConfirmationTick { .. } => "confirmation_tick",
            Self::ConfirmationResolved { .. } => "confirmation_resolved",
            Self::AutoHealTriggered(_) => "auto_heal_triggered",
            Self::AutoHealCompleted(_) => "auto_heal_completed",
        }
    }
}

/// Broadcast-based fan-out of [`ClientEvent`]s.
///
/// `emit` never blocks. A subscriber that falls more than the channel
/// capacity behind observes `RecvError::Lagged` instead of stalling the
/// client.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn emit(&self, event: ClientEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
