use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::col::{ColumnDescriptor, Columns, visible_count};
use crate::constant::{Concurrency, POS_AFTER_LAST, ScrollMode};
use crate::cursor::{CursorClient, CursorState, OpenedCursor};
use crate::demux::ResponseStream;
use crate::error::{Error, Result};
use crate::row::RowBuffer;
use crate::sync::conn::ConnInner;
use crate::sync::exchange::{Backlog, CallContext, Exchange, ExchangeCall, ReplySource};
use crate::sync::lock;
use crate::value::{FromValue, Value};

bitflags::bitflags! {
    /// What a result set supports, fixed when it is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const SCROLLABLE = 0x01;
        const UPDATABLE = 0x02;
        const SERVER_CURSOR = 0x04;
        const FORWARD_ONLY = 0x08;
    }
}

impl Capabilities {
    fn for_cursor(scroll: ScrollMode, concurrency: Concurrency) -> Self {
        let mut caps = Self::SERVER_CURSOR;
        if scroll.is_scrollable() {
            caps |= Self::SCROLLABLE;
        } else {
            caps |= Self::FORWARD_ONLY;
        }
        if concurrency.is_updatable() {
            caps |= Self::UPDATABLE;
        }
        caps
    }
}

/// A reply being demultiplexed, shared by a statement and its streamed results
pub(crate) struct Reply {
    pub stream: ResponseStream,
    pub backlog: Arc<Backlog>,
}

impl Reply {
    pub fn new(backlog: Arc<Backlog>) -> Self {
        Self {
            stream: ResponseStream::new(),
            backlog,
        }
    }
}

/// Rows of one unit of a directly executed reply
struct StreamRows {
    reply: Arc<Mutex<Reply>>,
    unit: usize,
    row: Option<RowBuffer>,
    row_num: i32,
    done: bool,
}

impl StreamRows {
    fn next(&mut self, exchange: &Mutex<Exchange>) -> Result<bool> {
        self.row = None;
        if self.done {
            return Ok(false);
        }
        let mut guard = lock(&self.reply);
        let Reply { stream, backlog } = &mut *guard;
        // the statement moved on to a later unit
        if stream.unit_index() != self.unit {
            self.done = true;
            return Ok(false);
        }
        let mut src = ReplySource::new(exchange, backlog);
        let fetched = stream.next_row(&mut src);
        let values = match fetched {
            Ok(values) => values,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        match values {
            Some(values) => {
                self.row = Some(RowBuffer::new(values));
                self.row_num += 1;
                Ok(true)
            }
            None => {
                self.done = true;
                Ok(false)
            }
        }
    }
}

enum Strategy {
    Cursor(Box<CursorState>),
    Stream(StreamRows),
}

struct Inner {
    strategy: Strategy,
    was_null: bool,
}

impl Inner {
    fn value(&self, index: usize, visible: usize) -> Result<&Value> {
        match &self.strategy {
            Strategy::Cursor(state) => state.value(index),
            Strategy::Stream(rows) => {
                if index == 0 || index > visible {
                    return Err(Error::InvalidColumnIndex(index));
                }
                rows.row
                    .as_ref()
                    .and_then(|row| row.get(index - 1))
                    .map(|cell| cell.value())
                    .ok_or(Error::NoCurrentRow)
            }
        }
    }
}

pub(crate) struct ResultSetShared {
    conn: Arc<ConnInner>,
    ctx: Arc<CallContext>,
    capabilities: Capabilities,
    columns: Columns,
    visible: usize,
    closed: AtomicBool,
    inner: Mutex<Inner>,
}

impl ResultSetShared {
    fn lock_open(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ResultSetClosed);
        }
        let inner = lock(&self.inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ResultSetClosed);
        }
        Ok(inner)
    }

    /// Run a server cursor operation; `otherwise` is raised for streamed results
    fn with_cursor<R>(
        &self,
        otherwise: Error,
        op: impl FnOnce(&mut CursorState, &mut CursorClient<ExchangeCall<'_>>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.lock_open()?;
        let Strategy::Cursor(state) = &mut inner.strategy else {
            return Err(otherwise);
        };
        let mut client = CursorClient::new(ExchangeCall::new(&self.conn.exchange, &self.ctx));
        let result = op(state, &mut client);
        self.ctx.add_warnings(client.take_warnings());
        result
    }

    /// Mark closed, then release the server cursor
    ///
    /// A release that loses the race against the connection closing is
    /// treated as done.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut inner = lock(&self.inner);
        match &mut inner.strategy {
            Strategy::Cursor(state) => {
                let release = !self.conn.shared.is_closed();
                let mut client =
                    CursorClient::new(ExchangeCall::new(&self.conn.exchange, &self.ctx));
                let result = state.close(&mut client, release);
                self.ctx.add_warnings(client.take_warnings());
                match result {
                    Err(e) if e.is_expected_close_race(self.conn.shared.is_closed()) => {
                        tracing::debug!(error = %e, handle = state.handle(), "cursor closed by connection teardown");
                        Ok(())
                    }
                    other => other,
                }
            }
            Strategy::Stream(rows) => {
                // unread rows are drained when the statement advances
                rows.row = None;
                rows.done = true;
                Ok(())
            }
        }
    }
}

impl Drop for ResultSetShared {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.close() {
            tracing::debug!(error = %e, "failed to close dropped result set");
        }
    }
}

/// Rows produced by a statement
///
/// Backed either by a server cursor, which may be scrollable and updatable,
/// or by the statement's reply stream, which is forward-only and read-only.
/// Column indexes are 1-based. Clones share the same position.
#[derive(Clone)]
pub struct ResultSet {
    shared: Arc<ResultSetShared>,
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("capabilities", &self.shared.capabilities)
            .field("columns", &self.shared.visible)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ResultSet {
    pub(crate) fn cursor(conn: Arc<ConnInner>, ctx: Arc<CallContext>, opened: OpenedCursor) -> Self {
        let capabilities = Capabilities::for_cursor(opened.scroll, opened.concurrency);
        let columns = Columns::clone(&opened.columns);
        let visible = visible_count(&columns);
        Self::from_parts(
            conn,
            ctx,
            capabilities,
            columns,
            visible,
            Strategy::Cursor(Box::new(CursorState::new(opened))),
        )
    }

    pub(crate) fn stream(
        conn: Arc<ConnInner>,
        ctx: Arc<CallContext>,
        reply: Arc<Mutex<Reply>>,
        unit: usize,
        columns: Columns,
    ) -> Self {
        let visible = visible_count(&columns);
        Self::from_parts(
            conn,
            ctx,
            Capabilities::FORWARD_ONLY,
            columns,
            visible,
            Strategy::Stream(StreamRows {
                reply,
                unit,
                row: None,
                row_num: 0,
                done: false,
            }),
        )
    }

    fn from_parts(
        conn: Arc<ConnInner>,
        ctx: Arc<CallContext>,
        capabilities: Capabilities,
        columns: Columns,
        visible: usize,
        strategy: Strategy,
    ) -> Self {
        Self {
            shared: Arc::new(ResultSetShared {
                conn,
                ctx,
                capabilities,
                columns,
                visible,
                closed: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    strategy,
                    was_null: false,
                }),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ResultSetShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    /// Visible columns; the hidden row status column of a cursor is left out
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.shared.columns[..self.shared.visible]
    }

    pub fn column_count(&self) -> usize {
        self.shared.visible
    }

    /// 1-based index of the column named `name`, ignoring ASCII case
    pub fn find_column(&self, name: &str) -> Result<usize> {
        self.columns()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .map(|i| i + 1)
            .ok_or_else(|| Error::UnknownColumn(name.to_string()))
    }

    pub fn next(&self) -> Result<bool> {
        let shared = &*self.shared;
        let mut inner = shared.lock_open()?;
        match &mut inner.strategy {
            Strategy::Cursor(state) => {
                let mut client =
                    CursorClient::new(ExchangeCall::new(&shared.conn.exchange, &shared.ctx));
                let result = CursorState::next(state, &mut client);
                shared.ctx.add_warnings(client.take_warnings());
                result
            }
            Strategy::Stream(rows) => rows.next(&shared.conn.exchange),
        }
    }

    pub fn previous(&self) -> Result<bool> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.previous(client))
    }

    pub fn first(&self) -> Result<bool> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.first(client))
    }

    pub fn last(&self) -> Result<bool> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.last(client))
    }

    /// Move to row `n`; negative `n` counts back from the last row
    pub fn absolute(&self, n: i32) -> Result<bool> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.absolute(client, n))
    }

    pub fn relative(&self, n: i32) -> Result<bool> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.relative(client, n))
    }

    pub fn before_first(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.before_first(client))
    }

    pub fn after_last(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ForwardOnly, |state, client| state.after_last(client))
    }

    /// Current 1-based row number, 0 when not on a row
    pub fn row(&self) -> Result<i32> {
        let inner = self.shared.lock_open()?;
        Ok(match &inner.strategy {
            Strategy::Cursor(state) => state.row(),
            Strategy::Stream(rows) if rows.row.is_some() => rows.row_num,
            Strategy::Stream(_) => 0,
        })
    }

    pub fn is_before_first(&self) -> Result<bool> {
        let inner = self.shared.lock_open()?;
        Ok(match &inner.strategy {
            Strategy::Cursor(state) => state.is_before_first(),
            Strategy::Stream(rows) => rows.row_num == 0 && !rows.done,
        })
    }

    pub fn is_after_last(&self) -> Result<bool> {
        let inner = self.shared.lock_open()?;
        Ok(match &inner.strategy {
            Strategy::Cursor(state) => state.is_after_last(),
            Strategy::Stream(rows) => rows.done && rows.row_num > 0,
        })
    }

    pub fn is_first(&self) -> Result<bool> {
        let inner = self.shared.lock_open()?;
        Ok(match &inner.strategy {
            Strategy::Cursor(state) => state.is_first(),
            Strategy::Stream(rows) => rows.row.is_some() && rows.row_num == 1,
        })
    }

    /// Needs the row count, so streamed results cannot answer it
    pub fn is_last(&self) -> Result<bool> {
        let inner = self.shared.lock_open()?;
        match &inner.strategy {
            Strategy::Cursor(state) => Ok(state.is_last()),
            Strategy::Stream(_) => Err(Error::ForwardOnly),
        }
    }

    /// Value of column `index` (1-based) converted to `T`
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let mut inner = self.shared.lock_open()?;
        let value = inner.value(index, self.shared.visible)?;
        let was_null = value.is_null();
        let converted = T::from_value(value);
        inner.was_null = was_null;
        converted
    }

    pub fn get_value(&self, index: usize) -> Result<Value> {
        self.get(index)
    }

    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        self.get(self.find_column(name)?)
    }

    /// The last value read was NULL
    pub fn was_null(&self) -> Result<bool> {
        Ok(self.shared.lock_open()?.was_null)
    }

    /// Stage a value for column `index` on the insert row or the current row
    pub fn update(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.shared
            .with_cursor(Error::ReadOnly, move |state, _| state.update(index, value))
    }

    pub fn update_by_name(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.update(self.find_column(name)?, value)
    }

    pub fn move_to_insert_row(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, _| state.move_to_insert_row())
    }

    pub fn move_to_current_row(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, _| state.move_to_current_row())
    }

    pub fn insert_row(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, client| state.insert_row(client))
    }

    pub fn update_row(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, client| state.update_row(client))
    }

    pub fn delete_row(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, client| state.delete_row(client))
    }

    pub fn refresh_row(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, client| state.refresh_row(client))
    }

    pub fn cancel_row_updates(&self) -> Result<()> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, client| state.cancel_row_updates(client))
    }

    pub fn row_deleted(&self) -> Result<bool> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, _| state.row_deleted())
    }

    pub fn row_inserted(&self) -> Result<bool> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, _| state.row_inserted())
    }

    pub fn row_updated(&self) -> Result<bool> {
        self.shared
            .with_cursor(Error::ReadOnly, |state, _| state.row_updated())
    }

    /// Server cursor position, `POS_AFTER_LAST` or `POS_BEFORE_FIRST` off the rows
    pub fn position(&self) -> Result<i32> {
        let inner = self.shared.lock_open()?;
        Ok(match &inner.strategy {
            Strategy::Cursor(state) => state.position(),
            Strategy::Stream(rows) if rows.done && rows.row_num > 0 => POS_AFTER_LAST,
            Strategy::Stream(rows) => rows.row_num,
        })
    }

    /// Close the result set; closing twice is a no-op
    #[tracing::instrument(skip_all)]
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
