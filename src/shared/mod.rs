//! Shared protocol plumbing and transport implementations.

pub mod http;
pub mod retry;
pub mod rpc;
pub mod sse;
pub mod sse_parser;
pub mod stdio;
pub mod streamable_http;
pub mod transport;

pub use http::HttpTransport;
pub use retry::{with_retry, RetryPolicy};
pub use sse::SseTransport;
pub use sse_parser::{SseEvent, SseParser};
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;
pub use transport::{McpTransport, NotificationHandler, TransportState};
