//! # testbed-proto
//!
//! Control protocol spoken between a testbed client and the agent running
//! inside the sandbox.
//!
//! Each sandbox gets two one-way channels. The agent binds both ports and the
//! client connects to them with a mirrored [`ChannelBinding`]:
//!
//! ```text
//!   client                                   agent (in sandbox)
//! ┌───────────────────┐   exec_request    ┌───────────────────┐
//! │ publish ─ connect │ ────────────────▶ │ bind ─ subscribe  │ :5556
//! │                   │                   │                   │
//! │ subscribe ─ conn. │ ◀──────────────── │ bind ─ publish    │ :5555
//! └───────────────────┘   exec_status     └───────────────────┘
//! ```
//!
//! Every frame is a length-delimited JSON [`Message`] stamped with the owning
//! sandbox id. Receivers drop frames stamped with any other id, so several
//! sandboxes can share one transport.
//!
//! Delivery is best effort. Per-sender order is kept, but messages can be
//! dropped under pressure or while a connection is re-established. Callers
//! poll with a [`Waiter`] and resend where that is safe.

pub mod codec;
mod communicator;
mod error;
mod memory;
mod message;
mod payload;
mod record;
mod tcp;
mod waiter;

pub use communicator::{Communicator, CommunicatorExt, DEFAULT_POLL_WINDOW};
pub use error::{ProtoError, Result};
pub use memory::{MemoryBus, MemoryCommunicator};
pub use message::{Message, MessageType};
pub use payload::{ApplyPatchRequest, ErrorReport, ExecRequest, Ping, RunEvaluationRequest};
pub use record::{ExecutionKind, ExecutionRecord, ExecutionStatus};
pub use tcp::{ChannelBinding, Endpoint, EndpointPair, TcpCommunicator};
pub use waiter::Waiter;

/// Default port the agent publishes on.
pub const DEFAULT_PUBLISH_PORT: u16 = 5555;

/// Default port the agent subscribes on.
pub const DEFAULT_SUBSCRIBE_PORT: u16 = 5556;
