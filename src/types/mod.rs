//! Wire-level and protocol types.

pub mod jsonrpc;
pub mod protocol;

pub use jsonrpc::{
    parse_message, JSONRPCError, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, Message,
    RequestId, JSONRPC_VERSION,
};
pub use protocol::{Implementation, InitializeResult, ListToolsResult, ToolInfo};
