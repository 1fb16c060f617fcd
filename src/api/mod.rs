pub mod cloudflare;
pub mod expression;
pub mod memory;
pub mod types;

pub use self::cloudflare::CloudflareClient;
pub use self::memory::{Call, CallKind, MemoryGateway, MemoryList};
pub use self::types::{GatewayApi, ListInfo, PolicyInfo, PolicySpec};
