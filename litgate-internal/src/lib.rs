pub mod auth; // API key registry and authentication middleware
pub mod clock; // injectable time source
pub mod config_parser; // litgate config file
pub mod endpoints; // router assembly and gated operation handlers
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // log setup
pub mod rate_limit; // request rate limiting
pub mod redis_client; // live account registry
pub mod usage_limit; // tiered usage metering

pub const LITGATE_VERSION: &str = env!("CARGO_PKG_VERSION");
