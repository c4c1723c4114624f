pub mod error;
pub mod transport;

pub use error::ClientError;
pub use transport::{Client, ClientConfig};
