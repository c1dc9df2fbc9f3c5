//! MCPHub: a multiplexing gateway that aggregates many upstream MCP
//! servers behind a single set of streaming endpoints.
//!
//! Downstream clients open one bidirectional session (SSE or streamable
//! HTTP) and transparently reach tools, prompts, and resources exported by
//! any number of upstream MCP servers. The hub adds session routing, group
//! scoping, per-tool toggles, OAuth-based upstream authentication, runtime
//! configuration reload, and an optional smart-routing layer that
//! vector-indexes tool descriptions behind two meta-tools.

pub mod dispatch;
pub mod error;
pub mod http;
pub mod oauth;
pub mod registry;
pub mod sessions;
pub mod settings;
pub mod upstream;
pub mod vector;

pub use error::{HubError, Result};
