//! Chat engine: LLM streaming with MCP tool dispatch
//!
//! - `driver` -- the provider-agnostic [`ModelDriver`](driver::ModelDriver)
//!   seam and the OpenAI-compatible streaming implementation
//! - `engine` -- the per-turn loop: approval gates, dispatch via the client
//!   manager, synthetic error results, cancellation

pub mod driver;
pub mod engine;

pub use driver::{driver_for, ChatMessage, DriverEvent, DriverRequest, ModelDriver, ToolSpec};
pub use engine::{ApprovalDecision, ChatEngine, ChatTurnRequest};
