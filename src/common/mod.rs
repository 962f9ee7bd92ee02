//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;
mod peer;
mod providers;
mod record;
mod routing_table;

pub use id::*;
pub use messages::*;
pub use peer::*;
pub use providers::*;
pub use record::*;
pub use routing_table::*;
