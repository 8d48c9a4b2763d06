//! Time-bounded confirmation requests the orchestrator is blocked on.
//!
//! Every request surfaced here is resolved exactly once: by a consumer
//! response, by the local countdown reaching zero, by an orchestrator
//! acknowledgment, or by shutdown. Resolution removes the request and its
//! countdown in the same step, so no later path can resolve it again.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skillpulse_core::{
    ConfirmationRequest, ConfirmationRequiredPayload, ConfirmationResponsePayload,
    OutboundMessage, RememberScope, ResolutionReason, TimerControlPayload,
};
use tracing::{debug, info};

use crate::events::{ClientEvent, EventEmitter};
use crate::timers::{TimerKey, TimerRegistry};

const TICK: Duration = Duration::from_secs(1);

pub struct ConfirmationArbiter {
    pending: HashMap<String, ConfirmationRequest>,
    emitter: EventEmitter,
    default_timeout: Duration,
}

impl ConfirmationArbiter {
    pub fn new(emitter: EventEmitter, default_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            emitter,
            default_timeout,
        }
    }

    /// Registers a new request and starts its countdown. A replay of a
    /// request that is still live is ignored.
    pub fn on_confirmation_required(
        &mut self,
        payload: &ConfirmationRequiredPayload,
        timers: &mut TimerRegistry<TimerKey>,
    ) -> bool {
        if self.pending.contains_key(&payload.id) {
            debug!(event = "confirmation_replay_ignored", confirmation_id = %payload.id);
            return false;
        }
        let timeout_seconds = payload
            .timeout_seconds
            .filter(|secs| *secs > 0)
            .unwrap_or_else(|| self.default_timeout.as_secs().max(1));
        let now = Utc::now();
        let created_at = payload
            .created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(now);
        let elapsed = u64::try_from(now.signed_duration_since(created_at).num_seconds()).unwrap_or(0);
        let remaining_seconds = timeout_seconds.saturating_sub(elapsed).max(1);

        let request = ConfirmationRequest {
            id: payload.id.clone(),
            execution_id: payload.skill_id.clone(),
            step_index: payload.step_index,
            prompt: payload.prompt.clone(),
            options: payload.options.clone(),
            suggestion: payload.claude_suggestion.clone(),
            timeout_seconds,
            created_at,
            remaining_seconds,
            paused: false,
        };
        timers.schedule_every(TimerKey::Countdown(request.id.clone()), TICK);
        let _ = self.pending.insert(request.id.clone(), request.clone());
        info!(
            event = "confirmation_required",
            confirmation_id = %request.id,
            execution_id = %request.execution_id,
            timeout_seconds,
            remaining_seconds
        );
        let _ = self.emitter.emit(ClientEvent::ConfirmationRequired(request));
        true
    }

    /// One countdown second elapsed for `id`.
    pub fn on_tick(&mut self, id: &str, timers: &mut TimerRegistry<TimerKey>) {
        let Some(request) = self.pending.get_mut(id) else {
            let _ = timers.cancel(&TimerKey::Countdown(id.to_string()));
            return;
        };
        if request.paused {
            return;
        }
        request.remaining_seconds = request.remaining_seconds.saturating_sub(1);
        let remaining_seconds = request.remaining_seconds;
        if remaining_seconds == 0 {
            let _ = self.resolve(id, ResolutionReason::Expired, timers);
            return;
        }
        let _ = self.emitter.emit(ClientEvent::ConfirmationTick {
            id: id.to_string(),
            remaining_seconds,
        });
    }

    /// Resolves `id` with the consumer's answer and hands back the frame to
    /// send. `None` when `id` is not live.
    pub fn respond(
        &mut self,
        id: &str,
        response: &str,
        remember: RememberScope,
        timers: &mut TimerRegistry<TimerKey>,
    ) -> Option<OutboundMessage> {
        if !self.resolve(id, ResolutionReason::Responded, timers) {
            debug!(event = "respond_unknown", confirmation_id = id);
            return None;
        }
        Some(OutboundMessage::ConfirmationResponse(ConfirmationResponsePayload {
            id: id.to_string(),
            response: response.to_string(),
            remember,
        }))
    }

    pub fn pause(&mut self, id: &str, timers: &mut TimerRegistry<TimerKey>) -> Option<OutboundMessage> {
        let request = self.pending.get_mut(id).filter(|request| !request.paused)?;
        request.paused = true;
        let _ = timers.cancel(&TimerKey::Countdown(id.to_string()));
        debug!(event = "confirmation_paused", confirmation_id = id);
        Some(OutboundMessage::PauseTimer(TimerControlPayload { id: id.to_string() }))
    }

    pub fn resume(&mut self, id: &str, timers: &mut TimerRegistry<TimerKey>) -> Option<OutboundMessage> {
        let request = self.pending.get_mut(id).filter(|request| request.paused)?;
        request.paused = false;
        timers.schedule_every(TimerKey::Countdown(id.to_string()), TICK);
        debug!(event = "confirmation_resumed", confirmation_id = id);
        Some(OutboundMessage::ResumeTimer(TimerControlPayload { id: id.to_string() }))
    }

    /// The orchestrator answered or expired `id` on its side.
    pub fn on_server_resolved(
        &mut self,
        id: &str,
        reason: ResolutionReason,
        timers: &mut TimerRegistry<TimerKey>,
    ) -> bool {
        self.resolve(id, reason, timers)
    }

    fn resolve(&mut self, id: &str, reason: ResolutionReason, timers: &mut TimerRegistry<TimerKey>) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        let _ = timers.cancel(&TimerKey::Countdown(id.to_string()));
        info!(event = "confirmation_resolved", confirmation_id = id, reason = %reason);
        let _ = self.emitter.emit(ClientEvent::ConfirmationResolved {
            id: id.to_string(),
            reason,
        });
        true
    }

    /// Resolves everything still live. Nothing is sent to the orchestrator.
    pub fn shutdown(&mut self, timers: &mut TimerRegistry<TimerKey>) -> usize {
        let ids: Vec<String> = self.list_pending().into_iter().map(|request| request.id).collect();
        ids.iter()
            .filter(|id| self.resolve(id, ResolutionReason::Shutdown, timers))
            .count()
    }

    /// Live requests, oldest first.
    pub fn list_pending(&self) -> Vec<ConfirmationRequest> {
        let mut pending: Vec<_> = self.pending.values().cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    pub fn get(&self, id: &str) -> Option<ConfirmationRequest> {
        self.pending.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
