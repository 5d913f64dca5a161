//! Public interface to the msgrelay core library, linked by the proxy
//! executable and by integration tests.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod proxy;

pub use proxy::{ProxyConfig, ProxyServer};
pub use utils::ProxyError;
