//! # parley-relay
//!
//! Connection registry and delivery engine for Parley direct messaging.
//!
//! Clients hold one duplex transport each, keyed by user identity. A
//! message read on the sender's connection is persisted best-effort,
//! recorded in the session cache's recent log, and written to the
//! recipient's connection if the recipient is currently online.
//!
//! ## Architecture
//!
//! - **Connection**: one transport per user. The read half is owned by the
//!   dispatch loop; the write half is owned by a writer task fed through a
//!   bounded queue, so writes from many senders never interleave.
//! - **Registry**: `UserId -> Connection` map shared by every dispatch loop.
//! - **Relay**: spawns the per-connection dispatch loop and performs
//!   lookup + delivery.
//! - **Collaborators**: [`DurableStore`] and [`SessionCache`] are supplied by
//!   the embedding server.

pub mod cache;
pub mod connection;
pub mod dispatch;
pub mod registry;
pub mod store;
pub mod transport;

mod error;
mod message;

pub use cache::{advisory, session_key, CacheError, SessionCache};
pub use connection::{Connection, ConnectionId, ConnectionOptions, ConnectionReader};
pub use dispatch::{
    CloseReason, ConnectionSummary, ConnectionTask, Delivery, DispatchState, Relay, RelayConfig,
};
pub use error::RelayError;
pub use message::{Message, UserId};
pub use registry::ConnectionRegistry;
pub use store::{DurableStore, NewUser, StoreError, User};
pub use transport::{Frame, FrameSink, FrameSource};
