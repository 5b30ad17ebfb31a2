//! Personal cloud-storage server library.
//! Exposes the connection core and the content store for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod server;
pub mod session;
pub mod state;
pub mod transmit;
