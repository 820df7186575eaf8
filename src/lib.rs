//! Mesh video-call orchestration.
//!
//! Participants in a room find each other through a shared rendezvous store,
//! exchange offers, answers and candidates through it, and then talk over
//! direct peer links.  [`session::CallSession`] is the entry point.

pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod notes;
pub mod peer;
pub mod presence;
pub mod room;
pub mod rtc;
pub mod signaling;
pub mod sim;
pub mod store;
pub mod session;

pub use config::Config;
pub use error::{CallError, CallResult, StoreError};
pub use events::{CallEvent, EventBus, EventType};
pub use room::{PeerId, Role, RoomId};
pub use session::{CallSession, SessionView};
