//! Network Layer
//!
//! WebSocket server, wire protocol and the coordinator that turns
//! connections into rooms.

pub mod channel;
pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod server;

pub use channel::{local_channel, ChannelError, MessageSink, MessageSource};
pub use coordinator::{CoordinatorConfig, CoordinatorError, ErrorClass, SessionCoordinator};
pub use protocol::{ClientMessage, Envelope, ProtocolError, ServerMessage};
pub use registry::{Connection, ConnectionRegistry};
pub use server::{GameServer, GameServerError, ServerConfig};
