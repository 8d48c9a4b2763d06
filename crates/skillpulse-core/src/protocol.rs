use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::RememberScope;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Messages pushed by the orchestrator.
///
/// Frames are adjacently tagged: `{"type": "<kind>", "data": {...}}`. Kinds
/// this client does not know decode to [`InboundMessage::Unrecognized`]
/// instead of failing, see [`decode_inbound`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    Connected(ConnectedPayload),
    SkillStarted(SkillStartedPayload),
    StepStarted(StepStartedPayload),
    StepCompleted(StepCompletedPayload),
    StepFailed(StepFailedPayload),
    SkillCompleted(SkillRefPayload),
    SkillFailed(SkillRefPayload),
    AutoHealTriggered(AutoHealPayload),
    AutoHealCompleted(AutoHealPayload),
    ConfirmationRequired(ConfirmationRequiredPayload),
    ConfirmationAnswered(ConfirmationRefPayload),
    ConfirmationExpired(ConfirmationRefPayload),
    HeartbeatAck,
    #[serde(skip)]
    Unrecognized { kind: String },
}

impl InboundMessage {
    pub const KINDS: &'static [&'static str] = &[
        "connected",
        "skill_started",
        "step_started",
        "step_completed",
        "step_failed",
        "skill_completed",
        "skill_failed",
        "auto_heal_triggered",
        "auto_heal_completed",
        "confirmation_required",
        "confirmation_answered",
        "confirmation_expired",
        "heartbeat_ack",
    ];

    pub fn kind(&self) -> &str {
        match self {
            Self::Connected(_) => "connected",
            Self::SkillStarted(_) => "skill_started",
            Self::StepStarted(_) => "step_started",
            Self::StepCompleted(_) => "step_completed",
            Self::StepFailed(_) => "step_failed",
            Self::SkillCompleted(_) => "skill_completed",
            Self::SkillFailed(_) => "skill_failed",
            Self::AutoHealTriggered(_) => "auto_heal_triggered",
            Self::AutoHealCompleted(_) => "auto_heal_completed",
            Self::ConfirmationRequired(_) => "confirmation_required",
            Self::ConfirmationAnswered(_) => "confirmation_answered",
            Self::ConfirmationExpired(_) => "confirmation_expired",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Unrecognized { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConnectedPayload {
    #[serde(default, alias = "running_skills")]
    pub running_executions: Vec<SkillStartedPayload>,
    #[serde(default)]
    pub pending_confirmations: Vec<ConfirmationRequiredPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillStartedPayload {
    pub skill_id: String,
    #[serde(default, alias = "name")]
    pub skill_name: String,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepStartedPayload {
    pub skill_id: String,
    pub step_index: usize,
    #[serde(default, alias = "name")]
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepCompletedPayload {
    pub skill_id: String,
    pub step_index: usize,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailedPayload {
    pub skill_id: String,
    pub step_index: usize,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillRefPayload {
    pub skill_id: String,
}

/// Best-effort remediation side channel. Forwarded to subscribers only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoHealPayload {
    pub skill_id: String,
    #[serde(default)]
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub fix_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationRequiredPayload {
    pub id: String,
    #[serde(default)]
    pub skill_id: String,
    #[serde(default)]
    pub step_index: usize,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationRefPayload {
    pub id: String,
}

/// Messages this client sends to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Heartbeat,
    ConfirmationResponse(ConfirmationResponsePayload),
    PauseTimer(TimerControlPayload),
    ResumeTimer(TimerControlPayload),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::ConfirmationResponse(_) => "confirmation_response",
            Self::PauseTimer(_) => "pause_timer",
            Self::ResumeTimer(_) => "resume_timer",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationResponsePayload {
    pub id: String,
    pub response: String,
    #[serde(default)]
    pub remember: RememberScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerControlPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame has no message type")]
    MissingKind,
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes one inbound frame.
///
/// A frame whose `type` is not one of [`InboundMessage::KINDS`] is not an
/// error: it comes back as `Unrecognized` so newer orchestrators can add
/// message kinds without breaking older clients.
pub fn decode_inbound(bytes: &[u8], max_frame_bytes: usize) -> Result<InboundMessage, FrameError> {
    let value: Value = decode_frame(bytes, max_frame_bytes)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingKind)?
        .to_string();
    if !InboundMessage::KINDS.contains(&kind.as_str()) {
        return Ok(InboundMessage::Unrecognized { kind });
    }
    InboundMessage::deserialize(value).map_err(|err| FrameError::Decode(err.to_string()))
}
