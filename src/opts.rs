use std::sync::Arc;

use smart_default::SmartDefault;

use crate::buffer_pool::{BufferPool, GLOBAL_BUFFER_POOL};
use crate::error::{Error, Result};

/// Smallest packet size a server accepts
pub const MIN_PACKET_SIZE: usize = 512;
/// Largest packet size a server accepts
pub const MAX_PACKET_SIZE: usize = 32767;

/// A configuration for connection
///
/// ```rs
/// let mut opts = Opts::default();
/// opts.query_timeout = Some(5);
/// opts.use_cursors = true;
/// ```
#[derive(Debug, Clone, SmartDefault)]
pub struct Opts {
    /// Size of outbound packets including the 8-byte header
    #[default(4096)]
    pub packet_size: usize,

    /// Default query timeout of new statements, in whole seconds
    pub query_timeout: Option<u32>,

    /// Open a server cursor even for forward-only read-only selects
    pub use_cursors: bool,

    /// Upper bound on live statements of one connection
    #[default(Some(1 << 20))]
    pub max_statements: Option<usize>,

    /// Execute directly when the server refuses a cursor for the statement
    #[default(true)]
    pub cursor_fallback: bool,

    #[default(Arc::clone(&GLOBAL_BUFFER_POOL))]
    pub buffer_pool: Arc<BufferPool>,
}

impl Opts {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::BadConfigError(format!(
                "packet_size {} is outside {}..={}",
                self.packet_size, MIN_PACKET_SIZE, MAX_PACKET_SIZE
            )));
        }
        if self.max_statements == Some(0) {
            return Err(Error::BadConfigError(
                "max_statements must allow at least one statement".to_string(),
            ));
        }
        Ok(())
    }
}
