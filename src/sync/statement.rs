use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError, Weak};

use crate::col::Columns;
use crate::constant::{Concurrency, PacketType, ProcId, ScrollMode};
use crate::cursor::{CursorClient, exec_text, execute_sql_params};
use crate::demux::{ResponseStream, ResponseUnit, TokenSource};
use crate::error::{Error, Result, Warning};
use crate::param::ParamDescriptor;
use crate::protocol::rpc::{write_rpc, write_sql_batch};
use crate::sync::conn::ConnInner;
use crate::sync::exchange::{CallContext, ConnShared, ExchangeCall, ReplySource};
use crate::sync::lock;
use crate::sync::registry::HandleId;
use crate::sync::result_set::{Reply, ResultSet, ResultSetShared};

/// Server errors refusing a cursor for the statement shape
const CURSOR_REFUSED: [i32; 3] = [16937, 16954, 16955];

enum Next {
    Rows { columns: Columns, unit: usize },
    Count(u64),
    End,
}

/// Move `stream` to the next row set or update count, collecting info
/// messages on the way as warnings
fn next_result<S: TokenSource + ?Sized>(
    stream: &mut ResponseStream,
    src: &mut S,
    ctx: &CallContext,
) -> Result<Next> {
    loop {
        if !stream.advance(src)? {
            return Ok(Next::End);
        }
        match stream.current() {
            Some(ResponseUnit::RowSet { columns, .. }) => {
                return Ok(Next::Rows {
                    columns: Columns::clone(columns),
                    unit: stream.unit_index(),
                });
            }
            Some(ResponseUnit::UpdateCount(n)) => return Ok(Next::Count(*n)),
            Some(ResponseUnit::Message(msg)) => ctx.add_warning(Warning::from(msg.clone())),
            _ => {}
        }
    }
}

fn is_select(sql: &str) -> bool {
    let head = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    head.get(..6)
        .is_some_and(|word| word.eq_ignore_ascii_case("select"))
}

struct StatementState {
    scroll: ScrollMode,
    concurrency: Concurrency,
    /// Reply of the last direct execution
    reply: Option<Arc<Mutex<Reply>>>,
    /// Every result set of the last execution
    results: Vec<Weak<ResultSetShared>>,
    current: Option<ResultSet>,
    update_count: Option<u64>,
}

impl StatementState {
    fn push(&mut self, rs: ResultSet) {
        self.results.retain(|w| w.strong_count() > 0);
        self.results.push(rs.downgrade());
        self.current = Some(rs);
    }

    fn close_current(&mut self) -> Result<()> {
        self.update_count = None;
        match self.current.take() {
            Some(rs) => rs.close(),
            None => Ok(()),
        }
    }

    /// Close the results of the last execution and let go of its reply
    fn discard(&mut self, shared: &ConnShared) -> Result<()> {
        self.current = None;
        self.update_count = None;
        let mut first_error = None;
        for rs in self.results.drain(..).filter_map(|w| w.upgrade()) {
            if let Err(e) = rs.close() {
                if e.is_expected_close_race(shared.is_closed()) {
                    tracing::debug!(error = %e, "result set close raced connection close");
                } else {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(reply) = self.reply.take() {
            lock(&reply).backlog.abandon();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub(crate) struct StatementShared {
    conn: Arc<ConnInner>,
    id: OnceLock<HandleId>,
    closed: AtomicBool,
    ctx: Arc<CallContext>,
    state: Mutex<StatementState>,
}

impl StatementShared {
    fn lock_open(&self) -> Result<MutexGuard<'_, StatementState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StatementClosed);
        }
        let state = lock(&self.state);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StatementClosed);
        }
        Ok(state)
    }

    /// Mark closed, close the result sets, then leave the registry
    ///
    /// If another thread is executing on this statement, its request is
    /// interrupted first so the state lock frees up promptly.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                if self.ctx.cancel(&self.conn.shared) {
                    tracing::debug!("interrupted request of closing statement");
                }
                lock(&self.state)
            }
        };
        let result = state.discard(&self.conn.shared);
        drop(state);
        self.unregister();
        result
    }

    fn unregister(&self) {
        if let Some(id) = self.id.get() {
            lock(&self.conn.registry).remove(*id);
        }
    }

    fn apply(&self, state: &mut StatementState, reply: &Arc<Mutex<Reply>>, next: Next) -> bool {
        match next {
            Next::Rows { columns, unit } => {
                let rs = ResultSet::stream(
                    Arc::clone(&self.conn),
                    Arc::clone(&self.ctx),
                    Arc::clone(reply),
                    unit,
                    columns,
                );
                state.push(rs);
                true
            }
            Next::Count(n) => {
                state.update_count = Some(n);
                false
            }
            Next::End => false,
        }
    }

    /// Open a server cursor; `None` when the server refused one and the
    /// statement should run directly
    fn open_cursor(
        &self,
        state: &mut StatementState,
        sql: &str,
        proc_name: Option<&str>,
        params: &[ParamDescriptor],
    ) -> Result<Option<ResultSet>> {
        let mut client = CursorClient::new(ExchangeCall::new(&self.conn.exchange, &self.ctx));
        let opened = client.open(sql, proc_name, params, state.scroll, state.concurrency);
        self.ctx.add_warnings(client.take_warnings());
        match opened {
            Ok(opened) => Ok(Some(ResultSet::cursor(
                Arc::clone(&self.conn),
                Arc::clone(&self.ctx),
                opened,
            ))),
            Err(Error::ServerError(msg))
                if self.conn.opts.cursor_fallback && CURSOR_REFUSED.contains(&msg.number) =>
            {
                tracing::debug!(number = msg.number, "cursor refused, executing directly");
                self.ctx.add_warning(Warning::new(format!(
                    "Server cursor not available, executing directly: {}",
                    msg.message
                )));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send the statement without a cursor and read up to its first result
    fn execute_direct(
        &self,
        state: &mut StatementState,
        sql: &str,
        params: &[ParamDescriptor],
    ) -> Result<bool> {
        let exchange = &self.conn.exchange;
        let (guard, backlog) = if params.is_empty() {
            self.ctx.begin(exchange, PacketType::SqlBatch, |out| {
                write_sql_batch(out, sql);
                Ok(())
            })?
        } else {
            let request = execute_sql_params(sql, params);
            self.ctx.begin(exchange, PacketType::Rpc, |out| {
                write_rpc(out, ProcId::ExecuteSql, &request)
            })?
        };
        let mut reply = Reply::new(backlog);
        let next = {
            let Reply { stream, backlog } = &mut reply;
            let mut src = ReplySource::locked(exchange, guard, backlog);
            next_result(stream, &mut src, &self.ctx)
        };
        let reply = Arc::new(Mutex::new(reply));
        state.reply = Some(Arc::clone(&reply));
        Ok(self.apply(state, &reply, next?))
    }

    #[tracing::instrument(skip_all)]
    fn execute(&self, sql: &str, proc_name: Option<&str>, params: &[ParamDescriptor]) -> Result<bool> {
        let mut state = self.lock_open()?;
        state.discard(&self.conn.shared)?;
        self.ctx.clear_warnings();

        let requested = state.scroll != ScrollMode::Forward
            || state.concurrency != Concurrency::ReadOnly;
        let cursor_shape = proc_name.is_some() || is_select(sql);
        if cursor_shape && (requested || self.conn.opts.use_cursors) {
            if let Some(rs) = self.open_cursor(&mut state, sql, proc_name, params)? {
                state.push(rs);
                return Ok(true);
            }
        } else if requested {
            self.ctx.add_warning(Warning::new(
                "Server cursors are only opened for selects and procedure calls, executing directly",
            ));
        }

        match proc_name {
            Some(name) => self.execute_direct(&mut state, &exec_text(name, params), params),
            None => self.execute_direct(&mut state, sql, params),
        }
    }
}

impl Drop for StatementShared {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(error = %e, "failed to close dropped statement");
        }
    }
}

/// A unit of execution on a connection
///
/// Each execution replaces the results of the previous one. Requests with a
/// non-default scroll or concurrency mode run through a server cursor; the
/// rest are streamed from the reply.
#[derive(Clone)]
pub struct Statement {
    shared: Arc<StatementShared>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.shared.id.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Statement {
    pub(crate) fn register(
        conn: &Arc<ConnInner>,
        scroll: ScrollMode,
        concurrency: Concurrency,
    ) -> Result<Self> {
        let timeout = conn.opts.query_timeout.unwrap_or(0);
        let shared = Arc::new(StatementShared {
            conn: Arc::clone(conn),
            id: OnceLock::new(),
            closed: AtomicBool::new(false),
            ctx: Arc::new(CallContext::new(timeout)),
            state: Mutex::new(StatementState {
                scroll,
                concurrency,
                reply: None,
                results: Vec::new(),
                current: None,
                update_count: None,
            }),
        });
        {
            let mut registry = lock(&conn.registry);
            if conn.shared.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            let id = registry.insert(Arc::downgrade(&shared))?;
            let _ = shared.id.set(id);
        }
        Ok(Self { shared })
    }

    /// Execute `sql`; returns `true` if the first result is a result set
    pub fn execute(&self, sql: &str) -> Result<bool> {
        self.shared.execute(sql, None, &[])
    }

    /// Execute `sql` and return its first result set, skipping update counts
    pub fn execute_query(&self, sql: &str) -> Result<ResultSet> {
        self.execute_query_with(sql, &[])
    }

    /// Execute `sql` with `@P0`-style arguments
    pub fn execute_query_with(&self, sql: &str, params: &[ParamDescriptor]) -> Result<ResultSet> {
        self.shared.execute(sql, None, params)?;
        self.first_result_set()
    }

    /// Call a stored procedure and return its first result set
    pub fn execute_procedure_query(
        &self,
        proc_name: &str,
        params: &[ParamDescriptor],
    ) -> Result<ResultSet> {
        self.shared.execute("", Some(proc_name), params)?;
        self.first_result_set()
    }

    /// Execute `sql` and return its first update count, 0 if there is none
    pub fn execute_update(&self, sql: &str) -> Result<u64> {
        if self.shared.execute(sql, None, &[])? {
            return Err(Error::BadUsageError(
                "execute_update produced a result set".to_string(),
            ));
        }
        Ok(self.update_count()?.unwrap_or(0))
    }

    fn first_result_set(&self) -> Result<ResultSet> {
        loop {
            if let Some(rs) = self.result_set()? {
                return Ok(rs);
            }
            if self.update_count()?.is_none() {
                return Err(Error::NoResultSet);
            }
            self.get_more_results()?;
        }
    }

    /// The current result set, if the current result is one
    pub fn result_set(&self) -> Result<Option<ResultSet>> {
        Ok(self.shared.lock_open()?.current.clone())
    }

    /// The current update count, if the current result is one
    pub fn update_count(&self) -> Result<Option<u64>> {
        Ok(self.shared.lock_open()?.update_count)
    }

    /// Close the current result set and move to the next result
    ///
    /// Returns `true` if the next result is a result set. Result sets of
    /// earlier units stay closed; units not reached yet are unaffected.
    pub fn get_more_results(&self) -> Result<bool> {
        let shared = &*self.shared;
        let mut state = shared.lock_open()?;
        state.close_current()?;
        let Some(reply) = state.reply.clone() else {
            return Ok(false);
        };
        let next = {
            let mut guard = lock(&reply);
            let Reply { stream, backlog } = &mut *guard;
            let mut src = ReplySource::new(&shared.conn.exchange, backlog);
            next_result(stream, &mut src, &shared.ctx)?
        };
        Ok(shared.apply(&mut state, &reply, next))
    }

    /// Another row set or update count follows the current one
    ///
    /// Info messages passed over on the way become warnings.
    pub fn has_more_results(&self) -> Result<bool> {
        let shared = &*self.shared;
        let state = shared.lock_open()?;
        let Some(reply) = state.reply.as_ref() else {
            return Ok(false);
        };
        let mut guard = lock(reply);
        let Reply { stream, backlog } = &mut *guard;
        let mut src = ReplySource::new(&shared.conn.exchange, backlog);
        stream.has_more_results(&mut src, |msg| {
            shared.ctx.add_warning(Warning::from(msg.clone()))
        })
    }

    /// Warnings of the last execution and of its result sets
    pub fn warnings(&self) -> Vec<Warning> {
        self.shared.ctx.warnings()
    }

    pub fn clear_warnings(&self) {
        self.shared.ctx.clear_warnings();
    }

    /// Seconds before a request is cancelled; 0 waits forever
    pub fn query_timeout(&self) -> u32 {
        self.shared.ctx.query_timeout()
    }

    pub fn set_query_timeout(&self, secs: u32) {
        self.shared.ctx.set_query_timeout(secs);
    }

    /// Interrupt the request in flight; it fails with [`Error::Cancelled`]
    pub fn cancel(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StatementClosed);
        }
        if self.shared.ctx.cancel(&self.shared.conn.shared) {
            tracing::debug!("attention sent");
        }
        Ok(())
    }

    /// Requested scroll mode; a result set reports what the server granted
    pub fn scroll(&self) -> Result<ScrollMode> {
        Ok(self.shared.lock_open()?.scroll)
    }

    pub fn concurrency(&self) -> Result<Concurrency> {
        Ok(self.shared.lock_open()?.concurrency)
    }

    /// Close the statement and every result set of its last execution
    ///
    /// Closing twice, or after the connection closed, is a no-op.
    #[tracing::instrument(skip_all)]
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
