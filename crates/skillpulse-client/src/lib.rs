//! Real-time execution-event client for the skillpulse orchestrator.
//!
//! One [`EventClient`] owns one connection. All state (the execution
//! ledger, outstanding confirmations, timers) lives on a single owner task;
//! the handle talks to it over a command channel and consumers observe it
//! through [`ClientEvent`] broadcasts.

pub mod arbiter;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod supervisor;
pub mod timers;
pub mod transport;

pub use arbiter::ConfirmationArbiter;
pub use backoff::{Backoff, BackoffPolicy};
pub use client::EventClient;
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, TransportError};
pub use events::{ClientEvent, EventEmitter};
pub use ledger::ExecutionLedger;
pub use supervisor::{ConnectionState, ConnectionSupervisor, SendSlot, SupervisorEvent};
pub use timers::{TimerKey, TimerRegistry};
pub use transport::{Connector, Link, LinkEvent, WsConnector};

pub use skillpulse_core::{
    ConfirmationRequest, Execution, ExecutionStatus, RememberScope, ResolutionReason, Step,
    StepStatus,
};
