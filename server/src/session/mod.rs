//! Session Coordination Core
//!
//! Room membership, peer bookkeeping and handle ownership. The media side
//! of every operation is delegated to the engine boundary; this module owns
//! who-belongs-where and guarantees consistent cleanup on disconnect.

pub mod error;
mod peer;
mod registry;
mod room;

pub use error::SessionError;
pub use peer::PeerSession;
pub use registry::RoomRegistry;
pub use room::Room;
