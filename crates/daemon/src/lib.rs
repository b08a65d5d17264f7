/// mobileproxy daemon library
///
/// The local HTTP and SOCKS5 proxies whose upstream traffic leaves over
/// cellular, and the status API served next to them.

pub mod api;
pub mod proxy;

pub use api::{ApiServer, AppState};
pub use proxy::{HttpProxyServer, ProxyAddrs, ProxyCounters, ProxyManager, Socks5ProxyServer};
