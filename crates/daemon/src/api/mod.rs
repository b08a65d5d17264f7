/// Local status API
///
/// Read-only telemetry for whatever reports the device upstream:
/// - Radio state and addresses
/// - Proxy ports and byte counters
/// - Tunnel state and assigned IP
/// - Recent rotation attempts, plus a trigger for a new rotation

pub mod handlers;
pub mod responses;
pub mod server;

pub use handlers::AppState;
pub use responses::*;
pub use server::ApiServer;
