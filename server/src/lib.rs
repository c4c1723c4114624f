//! Authoritative server: connection records, per-match lobby runtimes,
//! and the front-door admission socket.

pub mod connection;
pub mod error;
pub mod frontdoor;
pub mod lobby;

pub use connection::Connection;
pub use error::ServerError;
pub use frontdoor::FrontDoor;
pub use lobby::{Lobby, Phase};
