pub mod model;
pub mod protocol;

pub use model::{
    ConfirmationRequest, Execution, ExecutionStatus, RememberScope, ResolutionReason, Step,
    StepStatus,
};
pub use protocol::{
    decode_frame, decode_inbound, encode_frame, AutoHealPayload, ConfirmationRefPayload,
    ConfirmationRequiredPayload, ConfirmationResponsePayload, ConnectedPayload, FrameError,
    InboundMessage, OutboundMessage, SkillRefPayload, SkillStartedPayload, StepCompletedPayload,
    StepFailedPayload, StepStartedPayload, TimerControlPayload, DEFAULT_MAX_FRAME_BYTES,
};
