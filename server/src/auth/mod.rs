//! Token issuance, the connection cipher, and the login/reconnect handshake.

pub mod cipher;
pub mod handshake;
pub mod token;

pub use handshake::{HandshakeOutcome, ROOT_PATH};
pub use token::{generate_token, SecurityLevel, Token};
