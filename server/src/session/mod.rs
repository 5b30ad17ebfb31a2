//! Logged-in users, their transmission channels, and the loops that run
//! after a successful handshake.

pub mod registry;
pub mod service;
pub mod user;

pub use registry::SessionRegistry;
pub use service::{IdleService, SessionService};
pub use user::{ChannelGuard, User};
