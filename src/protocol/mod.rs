//! Newline-delimited JSON-RPC client for the coding agent subprocess.

pub mod client;
pub mod events;
pub mod frame;
pub mod message;

pub use client::{AgentClient, ClientOptions, TokenUsage, TurnOutcome};
pub use events::{AgentEvent, EventBus};
pub use frame::{FrameDecoder, encode_frame};
pub use message::{IncomingMessage, OutgoingMessage, RpcError, approval_response};
