//! Network resilience layer
//!
//! Streams document bytes over HTTP with retry, exponential backoff and
//! signed-URL refresh. The transport and the refresh callback are traits so
//! the hosting service decides how requests are sent and how expired URLs
//! are reissued.

mod refresh;
mod resilience;
mod transport;
mod types;

pub use refresh::{FnUrlRefresher, HttpUrlRefresher, UrlRefresher};
pub use resilience::NetworkResilience;
pub use transport::{ByteStream, HttpTransport, ReqwestTransport, TransportResponse};
pub use types::{
    FetchRequest, FetchResponse, NetworkCondition, NetworkConfig, RefreshError, TransportError,
};

#[cfg(test)]
pub(crate) use transport::mock;
