pub mod cache;
pub mod envelope;
pub mod frontend;
pub mod proxy;

pub use cache::Cache;
pub use envelope::{restore_id, rewrite_id, Envelope, MessageKind, MAX_LINE_BYTES};
pub use frontend::{Frontend, FrontendMessage};
pub use proxy::Proxy;
