//! Server cursors, statements and connection lifecycle for TDS clients
//!
//! A [`sync::Conn`] wraps an already-authenticated channel. Statements run
//! either through a server cursor, giving scrollable and updatable
//! [`sync::ResultSet`]s, or directly with rows streamed from the reply.

pub mod buffer;
pub mod buffer_pool;
pub mod col;
pub mod constant;
pub mod cursor;
pub mod demux;
pub mod error;
mod opts;
pub mod param;
pub mod protocol;
pub mod row;
pub mod sync;
pub mod timer;
pub mod value;

pub use opts::{MAX_PACKET_SIZE, MIN_PACKET_SIZE, Opts};
