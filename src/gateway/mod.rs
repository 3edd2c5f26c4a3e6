//! Gateway server implementation

mod admin;
pub mod pipeline;
pub mod proxy;
mod router;
mod server;
pub mod trace;

pub use pipeline::{BufferedBody, McpCall, McpTarget};
pub use proxy::{CostModel, ForwardContext, Forwarded, Operation, ProxyForwarder, StaticPricing};
pub use router::{AppState, create_router};
pub use server::Gateway;
pub use trace::TraceContext;
