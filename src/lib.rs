//! # Chess Rooms Server
//!
//! Real-time session orchestration for two-player chess rooms: presence,
//! invitations with expiry, room lifecycle, per-room clocks and move relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CHESS ROOMS SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Room state                                │
//! │  ├── session.rs  - Session state machine and store           │
//! │  ├── clock.rs    - Per-session countdown                     │
//! │  ├── invitation.rs - Pending invitations and expiry timers   │
//! │  └── directory.rs  - User directory interface                │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── protocol.rs - Envelope and payload types                │
//! │  ├── channel.rs  - Message sinks and sources                 │
//! │  ├── registry.rs - Username to connection registry           │
//! │  ├── coordinator.rs - Invitation, move and disconnect flow   │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Connections, sessions and pending invitations each live in their own
//! arena behind their own lock, and every session has its own lock. State is
//! copied out under a lock and written to the network only after the lock
//! is released. No two of these locks are ever held together across an
//! await.
//!
//! The server never validates chess moves. Positions and moves are relayed
//! exactly as clients send them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::directory::{InMemoryDirectory, UserDirectory, UserRecord};
pub use game::session::{Move, Session, SessionStatus, SessionStore, Side};
pub use network::coordinator::{CoordinatorConfig, SessionCoordinator};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Starting position handed to both players in `game_start`
pub const INITIAL_POSITION: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Seconds before an unanswered invitation expires
pub const INVITATION_TIMEOUT_SECS: u64 = 20;
