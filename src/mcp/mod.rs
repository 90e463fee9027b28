//! MCP (Model Context Protocol) client support
//!
//! This module provides the MCP client stack: wire types, a
//! transport-agnostic JSON-RPC client, the typed protocol lifecycle wrapper,
//! and the concrete transports. Session ownership, reconnection, and
//! notification routing live one layer up in [`crate::manager`].
//!
//! # Module Layout
//!
//! - `types`     -- MCP protocol types and JSON-RPC primitives
//! - `client`    -- Transport-agnostic async JSON-RPC 2.0 client
//! - `protocol`  -- Typed MCP lifecycle wrapper over `JsonRpcClient`
//! - `transport` -- `Transport` trait and concrete implementations (stdio,
//!   HTTP, fake)

pub mod client;
pub mod protocol;
pub mod transport;
pub mod types;
