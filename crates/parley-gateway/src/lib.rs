//! Real-time side of parley: who is connected, who is in which room, and how
//! a chat message gets from one participant's socket to the other's.

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod notify;
pub mod registry;
pub mod relay;
pub mod store;

pub use dispatcher::Dispatcher;
pub use error::GatewayError;
pub use registry::ConnectionId;
pub use relay::{OutboundMessage, RelayConfig};
pub use store::{Appended, MessageStore, StoreError};
