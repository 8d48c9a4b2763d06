//! Live state of every execution the orchestrator reports.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skillpulse_core::{
    Execution, ExecutionStatus, SkillStartedPayload, StepCompletedPayload, StepFailedPayload,
    StepStartedPayload, StepStatus,
};
use tracing::{debug, info, warn};

use crate::events::{ClientEvent, EventEmitter};
use crate::timers::{TimerKey, TimerRegistry};

pub struct ExecutionLedger {
    executions: HashMap<String, Execution>,
    emitter: EventEmitter,
    grace: Duration,
    max_steps: usize,
}

impl ExecutionLedger {
    pub fn new(emitter: EventEmitter, grace: Duration, max_steps: usize) -> Self {
        Self {
            executions: HashMap::new(),
            emitter,
            grace,
            max_steps,
        }
    }

    /// Inserts a fresh record. An existing record under the same id is
    /// replaced and its pending removal cancelled. A `total_steps` above
    /// `max_steps` drops the event and leaves any existing record alone.
    pub fn on_started(&mut self, payload: &SkillStartedPayload, timers: &mut TimerRegistry<TimerKey>) {
        let id = payload.skill_id.clone();
        if payload.total_steps > self.max_steps {
            warn!(
                event = "total_steps_out_of_range",
                execution_id = %id,
                total_steps = payload.total_steps,
                max_steps = self.max_steps
            );
            return;
        }
        let _ = timers.cancel(&TimerKey::Removal(id.clone()));

        let mut execution = Execution::new(
            id.clone(),
            payload.skill_name.clone(),
            payload.total_steps,
            Utc::now(),
        );
        if let Some(index) = payload.current_step {
            if index < execution.total_steps {
                execution.current_step = Some(index);
            } else {
                warn!(
                    event = "current_step_out_of_range",
                    execution_id = %id,
                    step_index = index,
                    total_steps = execution.total_steps
                );
            }
        }
        if let Some(raw) = payload.status.as_deref() {
            match raw.parse::<ExecutionStatus>() {
                Ok(status) => execution.status = status,
                Err(err) => warn!(event = "unknown_execution_status", execution_id = %id, error = %err),
            }
        }
        if execution.status.is_terminal() {
            timers.schedule_once(TimerKey::Removal(id.clone()), self.grace);
        }

        let replaced = self.executions.insert(id.clone(), execution.clone()).is_some();
        info!(
            event = "execution_started",
            execution_id = %id,
            name = %execution.name,
            total_steps = execution.total_steps,
            replaced
        );
        let _ = self.emitter.emit(ClientEvent::ExecutionStarted(execution));
    }

    pub fn on_step_started(&mut self, payload: &StepStartedPayload) {
        let Some(execution) = self.executions.get_mut(&payload.skill_id) else {
            warn!(event = "unknown_execution", kind = "step_started", execution_id = %payload.skill_id);
            return;
        };
        if execution.status.is_terminal() {
            debug!(event = "step_after_end_ignored", execution_id = %payload.skill_id);
            return;
        }
        let total_steps = execution.total_steps;
        let Some(step) = execution.steps.get_mut(payload.step_index) else {
            warn!(
                event = "step_out_of_range",
                execution_id = %payload.skill_id,
                step_index = payload.step_index,
                total_steps
            );
            return;
        };
        if step.status.is_terminal() {
            debug!(
                event = "terminal_step_ignored",
                execution_id = %payload.skill_id,
                step_index = payload.step_index
            );
            return;
        }
        step.name = payload.step_name.clone();
        step.description = payload.description.clone();
        step.status = StepStatus::Running;
        let step = step.clone();

        execution.current_step = Some(payload.step_index);
        execution.current_step_name = Some(payload.step_name.clone());
        execution.current_step_description = payload.description.clone();
        execution.last_event_at = Utc::now();
        let snapshot = execution.clone();

        let _ = self.emitter.emit(ClientEvent::StepUpdated {
            execution_id: payload.skill_id.clone(),
            step,
        });
        let _ = self.emitter.emit(ClientEvent::ExecutionUpdated(snapshot));
    }

    pub fn on_step_completed(&mut self, payload: &StepCompletedPayload) {
        self.finish_step(
            &payload.skill_id,
            payload.step_index,
            StepStatus::Completed,
            Some(payload.duration_ms),
            None,
        );
    }

    pub fn on_step_failed(&mut self, payload: &StepFailedPayload) {
        self.finish_step(
            &payload.skill_id,
            payload.step_index,
            StepStatus::Failed,
            None,
            Some(payload.error.clone()),
        );
    }

    fn finish_step(
        &mut self,
        execution_id: &str,
        index: usize,
        status: StepStatus,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) {
        let Some(execution) = self.executions.get_mut(execution_id) else {
            warn!(event = "unknown_execution", kind = status.as_str(), execution_id);
            return;
        };
        if execution.status.is_terminal() {
            debug!(event = "step_after_end_ignored", execution_id);
            return;
        }
        let total_steps = execution.total_steps;
        let Some(step) = execution.steps.get_mut(index) else {
            warn!(event = "step_out_of_range", execution_id, step_index = index, total_steps);
            return;
        };
        if step.status.is_terminal() {
            return;
        }
        step.status = status;
        step.duration_ms = duration_ms;
        step.error = error;
        let step = step.clone();
        execution.last_event_at = Utc::now();

        let _ = self.emitter.emit(ClientEvent::StepUpdated {
            execution_id: execution_id.to_string(),
            step,
        });
    }

    /// Marks the execution terminal and arms its removal. A second terminal
    /// event for the same execution changes nothing.
    pub fn on_ended(&mut self, execution_id: &str, success: bool, timers: &mut TimerRegistry<TimerKey>) {
        let Some(execution) = self.executions.get_mut(execution_id) else {
            warn!(event = "unknown_execution", kind = "skill_ended", execution_id);
            return;
        };
        if execution.status.is_terminal() {
            debug!(event = "duplicate_end_ignored", execution_id);
            return;
        }
        execution.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        execution.last_event_at = Utc::now();
        let snapshot = execution.clone();

        timers.schedule_once(TimerKey::Removal(execution_id.to_string()), self.grace);
        info!(event = "execution_ended", execution_id, status = %snapshot.status);
        let _ = self.emitter.emit(ClientEvent::ExecutionCompleted(snapshot));
    }

    /// Drops a finished execution once its grace period is over. Running
    /// executions are kept.
    pub fn remove(&mut self, execution_id: &str) -> bool {
        let terminal = self
            .executions
            .get(execution_id)
            .is_some_and(|execution| execution.status.is_terminal());
        if !terminal {
            return false;
        }
        let _ = self.executions.remove(execution_id);
        debug!(event = "execution_removed", execution_id);
        let _ = self.emitter.emit(ClientEvent::ExecutionRemoved {
            execution_id: execution_id.to_string(),
        });
        true
    }

    pub fn snapshot(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id).cloned()
    }

    pub fn list_running(&self) -> Vec<Execution> {
        self.executions
            .values()
            .filter(|execution| execution.is_running())
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Execution> {
        self.executions.values().cloned().collect()
    }

    /// Running executions with no event for longer than `threshold`.
    pub fn list_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<Execution> {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return Vec::new();
        };
        self.executions
            .values()
            .filter(|execution| execution.is_running())
            .filter(|execution| now.signed_duration_since(execution.last_event_at) > threshold)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.executions.len();
        self.executions.clear();
        cleared
    }
}
