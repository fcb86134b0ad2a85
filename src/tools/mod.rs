//! 工具层：提供方边界、会话多路复用、目录发现与摘要

pub mod multiplexer;
pub mod provider;
pub mod registry;
pub mod result;
pub mod schema;
pub mod summary;

pub use multiplexer::{MultiplexerSettings, SessionMultiplexer, QUALIFIER};
pub use provider::{
    ProviderConnector, ProviderEndpoint, ProviderError, ProviderSession, RemoteCallOutcome,
    RemoteTool,
};
pub use registry::{DegradedProvider, ResolveError, ToolCatalog, ToolDescriptor, ToolRegistry};
pub use result::ToolCallResult;
pub use schema::tool_call_schema_json;
pub use summary::{filter_by_hints, summarize_tools};
