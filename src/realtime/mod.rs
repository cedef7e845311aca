//! Live change notifications over WebSocket.
//!
//! Producers call [`EventBus::publish`] after a mutation commits. The bus
//! routes each event to rooms through the [`SessionManager`], and every
//! connected [`SubscriberSession`] drains its own bounded mailbox.

pub mod bus;
pub mod events;
pub mod registry;
pub mod session;

pub use bus::{BusError, EventBus, MAILBOX_CAPACITY};
pub use events::{ChangeEvent, DeletedTask, Room, Target};
pub use registry::{CloseReason, FanoutReport, Mailbox, SessionManager, SubscriberId};
pub use session::{ClientMessage, SessionReply, SessionState, SubscriberSession, serve_socket};
