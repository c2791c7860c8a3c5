mod channel;
mod conn;
mod exchange;
mod registry;
mod result_set;
mod statement;
mod stream;

use std::sync::{Mutex, MutexGuard};

pub use channel::{Attention, Channel, ChannelRead};
pub use conn::Conn;
pub use result_set::{Capabilities, ResultSet};
pub use statement::Statement;
pub use stream::Stream;

/// Lock a mutex, recovering the data of a poisoned one
///
/// A panic in another thread leaves the protected state consistent at every
/// await-free boundary this crate locks at, so the guard is still usable.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
