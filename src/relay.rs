//! WebSocket relay pairing one teacher with many students per room

mod actor;
mod messages;
mod registry;
mod server;
mod types;

pub use actor::RelayHandle;
pub use messages::{ErrorNotice, MISSING_PARAMS_REASON};
pub use server::{DEFAULT_RELAY_PORT, RelayServer};
pub use types::{ConnId, Outbound, RelayError, Role, RoomId};
