//! Wire codec, retransmit cache, and location/identity utilities shared
//! by the server, client, and gateway.

pub mod cache;
pub mod codec;
pub mod error;
pub mod location;
pub mod multicast;
pub mod routing;

pub use cache::RetransmitCache;
pub use codec::{Change, MessageType, Payload, HEADER_LEN, MAX_DATA_LEN};
pub use error::WireError;
pub use location::{NodeLocation, NodeLocator, StaticNodeLocator};
pub use multicast::{bind_dtn_socket, DTN_GROUP, DTN_HOP_LIMIT, DTN_PORT};
pub use routing::{preferred_next_hop, NeighborInfo, NeighborMap};
