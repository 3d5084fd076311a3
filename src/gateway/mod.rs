//! Session Gateway
//!
//! WebSocket front door: authenticates `(user, session)`, subscribes the
//! connection to the event bus, and turns inbound frames into chat turns or
//! structured commands.
//!
//! - `protocol` - frame parsing and rendering, connect-time auth
//! - `commands` - one handler per structured command
//! - `rate_limit` - per-connection token bucket
//! - `server` - axum router and the per-connection read/write loops

pub mod commands;
pub mod protocol;
pub mod rate_limit;
pub mod server;

pub use commands::DirEntry;
pub use protocol::{parse_frame, Command, ConnectParams, Identity, Inbound};
pub use rate_limit::RateLimiter;
pub use server::{router, serve, ConnectionState};
