//! Client-side state for a parley conversation: who is signed in, and the
//! duplicate-free view of a room built from fetched history plus live events.

pub mod session;
pub mod timeline;

pub use session::{Session, SessionError};
pub use timeline::{Entry, EntryState, Timeline};
