//! MCP (Model Context Protocol) client and tool bridge
//!
//! Launches stdio MCP servers, speaks JSON-RPC 2.0 to them in either of the
//! two framings found in the wild, and exposes every remote tool as a local
//! [`toolbridge_core::Tool`] with a collision-free name.
//!
//! ```text
//! create_tools ──► normalize_server_specs ──► McpClient::launch (per server)
//!                                                  │  line framing, then header framing
//!                                                  ▼
//!                                         StdioTransport ─► RpcConnection
//!                                                  │
//!              McpToolSet { tools, cleanup } ◄── tools/list + ToolNameRegistry
//! ```

pub mod client;
pub mod connection;
pub mod conversions;
pub mod framing;
pub mod manager;
pub mod naming;
pub mod spec;
pub mod tool_wrapper;
pub mod transport;
pub mod types;

pub use client::{ClientState, McpClient};
pub use connection::RpcConnection;
pub use framing::{encode_frame, FrameDecoder, FrameError, Framing, MAX_FRAME_LEN};
pub use manager::{create_tools, CreateToolsOptions, McpToolSet};
pub use naming::{normalize_segment, ToolNameRegistry, MAX_TOOL_NAME_LEN};
pub use spec::{normalize_server_specs, ServerSpec};
pub use tool_wrapper::McpToolWrapper;
pub use transport::{StdioTransport, Transport};
pub use types::RemoteToolDescriptor;
