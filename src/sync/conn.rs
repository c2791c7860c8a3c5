use std::sync::{Arc, Mutex, TryLockError, Weak};

use crate::constant::{Concurrency, ScrollMode};
use crate::error::Result;
use crate::opts::Opts;
use crate::sync::channel::Channel;
use crate::sync::exchange::{ConnShared, Exchange};
use crate::sync::lock;
use crate::sync::registry::HandleTable;
use crate::sync::statement::{Statement, StatementShared};

/// Lock order: `registry`, then a statement's state, then a result set, then
/// a reply, then `exchange`. Backlogs and warnings are leaves.
pub(crate) struct ConnInner {
    pub opts: Opts,
    pub exchange: Mutex<Exchange>,
    pub shared: Arc<ConnShared>,
    pub registry: Mutex<HandleTable<Weak<StatementShared>>>,
}

/// A connection over an already-established channel
///
/// Clones refer to the same connection. Statements keep the connection's
/// resources alive until the last of them is dropped.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    /// Take over a channel that has completed login
    pub fn new(channel: impl Channel + 'static, opts: Opts) -> Result<Self> {
        opts.validate()?;
        let attention = channel.attention()?;
        let shared = Arc::new(ConnShared::new(attention));
        let buffers = opts.buffer_pool.get_buffer_set();
        let exchange = Exchange::new(
            Box::new(channel),
            buffers,
            opts.packet_size,
            Arc::clone(&shared),
        );
        let registry = HandleTable::new(opts.max_statements);
        Ok(Self {
            inner: Arc::new(ConnInner {
                opts,
                exchange: Mutex::new(exchange),
                shared,
                registry: Mutex::new(registry),
            }),
        })
    }

    pub fn opts(&self) -> &Opts {
        &self.inner.opts
    }

    /// A forward-only, read-only statement
    pub fn create_statement(&self) -> Result<Statement> {
        self.create_statement_with(ScrollMode::Forward, Concurrency::ReadOnly)
    }

    pub fn create_statement_with(
        &self,
        scroll: ScrollMode,
        concurrency: Concurrency,
    ) -> Result<Statement> {
        Statement::register(&self.inner, scroll, concurrency)
    }

    /// Statements created on this connection and not yet closed or dropped
    pub fn open_statements(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Close every statement, then the channel
    ///
    /// A request in flight on another thread is aborted; that thread sees an
    /// I/O error. Closing twice is a no-op.
    #[tracing::instrument(skip_all)]
    pub fn close(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.shared.mark_closed() {
            return Ok(());
        }
        let busy = matches!(inner.exchange.try_lock(), Err(TryLockError::WouldBlock));
        if busy {
            tracing::debug!("request in flight, aborting channel");
            inner.shared.abort();
        }

        let statements = lock(&inner.registry).drain();
        let mut first_error = None;
        for statement in statements.iter().filter_map(Weak::upgrade) {
            match statement.close() {
                Ok(()) => {}
                Err(e) if e.is_expected_close_race(true) => {
                    tracing::debug!(error = %e, "statement close raced connection close");
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        lock(&inner.exchange).shutdown();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("closed", &self.is_closed())
            .field("open_statements", &self.open_statements())
            .finish()
    }
}
