#![doc = include_str!("../README.md")]

// Public modules
pub mod cache;
mod common;
mod error;
pub mod maintenance;
mod node;
pub mod rpc;
pub mod signing;
pub mod validator;

pub use crate::common::{
    is_valid_key, messages, parse_timestamp, Avatar, Id, Listing, Metadata, Peer, PeerStatus,
    ProviderRegistry, Rating, Record, RoutingTable, Sealed, User, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use error::Error;
pub use node::{Node, NodeBuilder};
pub use rpc::{Config, Info};
