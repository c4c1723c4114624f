pub mod error;
pub mod relay;

pub use error::GatewayError;
pub use relay::{Gateway, GatewayConfig};
