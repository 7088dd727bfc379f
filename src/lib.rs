mod bucket;
mod common;
mod contact;
mod engine;
mod error;
mod id;
mod lookup;
mod message;
mod node;
mod peer_store;
mod routing_table;
mod timer;
mod token;
mod transaction;
mod transport;

pub use crate::error::Error;
pub use crate::id::NodeId;
pub use crate::node::{resolve_v4, Event, Node, NodeConfig};

pub type Result<T, E = Error> = std::result::Result<T, E>;
