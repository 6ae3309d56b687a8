pub mod context;
pub mod delivery;
pub mod error;
pub mod eventloop;
pub mod media;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;

pub use context::ServerContext;
pub use error::{InvariantKind, RelayError, Result};
pub use media::{LiveFeed, MediaSource, TrackInfo};
pub use queue::{BufferUnit, Consumer, Packet, Track};
pub use server::{Server, ServerConfig};
