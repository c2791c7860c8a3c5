use crate::col::{ColumnDescriptor, Columns, visible_count};
use crate::constant::{
    Concurrency, CursorOp, FetchType, POS_AFTER_LAST, POS_BEFORE_FIRST, RowStatus, ScrollMode,
};
use crate::cursor::client::OpenedCursor;
use crate::error::{Error, Result};
use crate::row::RowBuffer;
use crate::value::{FromValue, Value};

/// Result of one `sp_cursorfetch`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// The fetched row, absent when the fetch moved off the result set
    pub row: Option<RowBuffer>,
    /// Reported by FETCH_INFO only
    pub position: Option<i32>,
    /// Reported by FETCH_INFO only
    pub row_count: Option<i32>,
}

/// Server cursor operations the state machine drives
pub trait CursorProtocol {
    fn fetch(&mut self, handle: i32, fetch: FetchType) -> Result<FetchOutcome>;

    fn modify(
        &mut self,
        handle: i32,
        op: CursorOp,
        columns: &[ColumnDescriptor],
        row: Option<&RowBuffer>,
    ) -> Result<()>;

    fn close(&mut self, handle: i32) -> Result<()>;
}

/// Client-side view of one open server cursor
///
/// `pos` is 1-based while on a row, [`POS_BEFORE_FIRST`] before the first
/// row and [`POS_AFTER_LAST`] after the last one.
#[derive(Debug)]
pub struct CursorState {
    handle: i32,
    scroll: ScrollMode,
    concurrency: Concurrency,
    columns: Columns,
    visible: usize,
    pos: i32,
    row_count: i32,
    current: Option<RowBuffer>,
    insert_row: Option<RowBuffer>,
    on_insert_row: bool,
    closed: bool,
}

impl CursorState {
    pub fn new(opened: OpenedCursor) -> Self {
        let visible = visible_count(&opened.columns);
        Self {
            handle: opened.handle,
            scroll: opened.scroll,
            concurrency: opened.concurrency,
            columns: opened.columns,
            visible,
            pos: POS_BEFORE_FIRST,
            row_count: opened.row_count,
            current: None,
            insert_row: None,
            on_insert_row: false,
            closed: false,
        }
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn scroll(&self) -> ScrollMode {
        self.scroll
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Columns exposed to callers; the hidden row status column is not
    pub fn column_count(&self) -> usize {
        self.visible
    }

    pub fn position(&self) -> i32 {
        self.pos
    }

    pub fn row_count(&self) -> i32 {
        self.row_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_on_insert_row(&self) -> bool {
        self.on_insert_row
    }

    /// Current 1-based row number, 0 when not on a row
    pub fn row(&self) -> i32 {
        if self.pos > 0 { self.pos } else { 0 }
    }

    pub fn is_before_first(&self) -> bool {
        self.pos == POS_BEFORE_FIRST && self.row_count != 0
    }

    pub fn is_after_last(&self) -> bool {
        self.pos == POS_AFTER_LAST && self.row_count != 0
    }

    pub fn is_first(&self) -> bool {
        self.pos == 1
    }

    pub fn is_last(&self) -> bool {
        self.pos == self.row_count && self.row_count != 0
    }

    pub fn current_row(&self) -> Option<&RowBuffer> {
        self.current.as_ref()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ResultSetClosed);
        }
        Ok(())
    }

    fn check_scrollable(&self) -> Result<()> {
        self.check_open()?;
        if !self.scroll.is_scrollable() {
            return Err(Error::ForwardOnly);
        }
        Ok(())
    }

    fn check_updatable(&self) -> Result<()> {
        self.check_open()?;
        if !self.concurrency.is_updatable() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<usize> {
        if index == 0 || index > self.visible {
            return Err(Error::InvalidColumnIndex(index));
        }
        Ok(index - 1)
    }

    /// Issue a fetch and take its row
    ///
    /// FETCH_INFO refreshes position and row count and leaves the row alone.
    fn fetch<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P, fetch: FetchType) -> Result<bool> {
        let outcome = proto.fetch(self.handle, fetch)?;
        if fetch == FetchType::Info {
            if let Some(pos) = outcome.position {
                self.pos = pos;
            }
            if let Some(count) = outcome.row_count {
                self.row_count = count;
            }
            return Ok(true);
        }
        self.current = outcome.row;
        Ok(self.current.is_some())
    }

    fn leave_insert_row(&mut self) {
        self.on_insert_row = false;
    }

    pub fn next<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<bool> {
        self.check_open()?;
        self.leave_insert_row();
        if self.pos == POS_AFTER_LAST {
            self.current = None;
            return Ok(false);
        }
        if self.fetch(proto, FetchType::Next)? {
            self.pos += 1;
            Ok(true)
        } else {
            self.pos = POS_AFTER_LAST;
            Ok(false)
        }
    }

    pub fn previous<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<bool> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.fetch(proto, FetchType::Previous)? {
            self.pos -= if self.pos < 0 {
                self.pos - self.row_count
            } else {
                1
            };
            Ok(true)
        } else {
            self.pos = POS_BEFORE_FIRST;
            Ok(false)
        }
    }

    /// Move to row `n`; negative `n` counts back from the last row
    pub fn absolute<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P, n: i32) -> Result<bool> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.fetch(proto, FetchType::Absolute(n))? {
            self.pos = if n < 0 { self.row_count + n + 1 } else { n };
            Ok(true)
        } else {
            self.pos = if n > 0 { POS_AFTER_LAST } else { POS_BEFORE_FIRST };
            Ok(false)
        }
    }

    pub fn relative<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P, n: i32) -> Result<bool> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.fetch(proto, FetchType::Relative(n))? {
            if self.pos < 0 {
                self.pos = self.row_count + 1;
            }
            self.pos += n;
            Ok(true)
        } else {
            self.pos = if n > 0 { POS_AFTER_LAST } else { POS_BEFORE_FIRST };
            Ok(false)
        }
    }

    pub fn first<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<bool> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.fetch(proto, FetchType::First)? {
            self.pos = 1;
            Ok(true)
        } else {
            self.pos = POS_BEFORE_FIRST;
            Ok(false)
        }
    }

    pub fn last<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<bool> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.fetch(proto, FetchType::Last)? {
            self.pos = self.row_count;
            Ok(true)
        } else {
            self.pos = POS_BEFORE_FIRST;
            Ok(false)
        }
    }

    pub fn before_first<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.pos != POS_BEFORE_FIRST {
            self.fetch(proto, FetchType::Absolute(0))?;
            self.pos = POS_BEFORE_FIRST;
        }
        self.current = None;
        Ok(())
    }

    pub fn after_last<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.check_scrollable()?;
        self.leave_insert_row();
        if self.pos != POS_AFTER_LAST {
            self.fetch(proto, FetchType::Absolute(self.row_count + 1))?;
            self.pos = POS_AFTER_LAST;
        }
        self.current = None;
        Ok(())
    }

    /// Value of visible column `index` (1-based) on the current or insert row
    pub fn value(&self, index: usize) -> Result<&Value> {
        self.check_open()?;
        let i = self.check_index(index)?;
        let row = if self.on_insert_row {
            self.insert_row.as_ref()
        } else {
            self.current.as_ref()
        };
        row.and_then(|r| r.get(i))
            .map(|cell| cell.value())
            .ok_or(Error::NoCurrentRow)
    }

    /// Stage a new value for visible column `index` (1-based)
    pub fn update(&mut self, index: usize, value: Value) -> Result<()> {
        self.check_updatable()?;
        let i = self.check_index(index)?;
        let row = if self.on_insert_row {
            self.insert_row.as_mut()
        } else {
            self.current.as_mut()
        };
        let cell = row.and_then(|r| r.get_mut(i)).ok_or(Error::NoCurrentRow)?;
        cell.set(value);
        Ok(())
    }

    pub fn move_to_insert_row(&mut self) -> Result<()> {
        self.check_updatable()?;
        self.insert_row = Some(RowBuffer::empty(self.columns.len()));
        self.on_insert_row = true;
        Ok(())
    }

    pub fn move_to_current_row(&mut self) -> Result<()> {
        self.check_updatable()?;
        self.on_insert_row = false;
        Ok(())
    }

    pub fn insert_row<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.check_updatable()?;
        if !self.on_insert_row {
            return Err(Error::NotOnInsertRow);
        }
        proto.modify(
            self.handle,
            CursorOp::Insert,
            &self.columns,
            self.insert_row.as_ref(),
        )?;
        self.fetch(proto, FetchType::Info)?;
        self.insert_row = Some(RowBuffer::empty(self.columns.len()));
        Ok(())
    }

    pub fn update_row<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.check_updatable()?;
        if self.on_insert_row {
            return Err(Error::OnInsertRow);
        }
        if self.current.is_none() {
            return Err(Error::NoCurrentRow);
        }
        proto.modify(
            self.handle,
            CursorOp::Update,
            &self.columns,
            self.current.as_ref(),
        )?;
        self.fetch(proto, FetchType::Info)?;
        self.fetch(proto, FetchType::Repeat)?;
        Ok(())
    }

    pub fn delete_row<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.check_updatable()?;
        if self.on_insert_row {
            return Err(Error::OnInsertRow);
        }
        if self.current.is_none() {
            return Err(Error::NoCurrentRow);
        }
        proto.modify(self.handle, CursorOp::Delete, &self.columns, None)?;
        self.fetch(proto, FetchType::Repeat)?;
        Ok(())
    }

    /// Re-read the current row from the server
    pub fn refresh_row<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.check_updatable()?;
        if self.on_insert_row {
            return Err(Error::OnInsertRow);
        }
        self.fetch(proto, FetchType::Repeat)?;
        Ok(())
    }

    /// Discard staged updates by refetching the current row
    pub fn cancel_row_updates<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P) -> Result<()> {
        self.refresh_row(proto)
    }

    fn row_status(&self) -> Result<Option<RowStatus>> {
        self.check_updatable()?;
        let row = self.current.as_ref().ok_or(Error::NoCurrentRow)?;
        let last = self.columns.len().checked_sub(1);
        match (last, self.columns.last()) {
            (Some(i), Some(col)) if col.is_hidden() => match row.get(i) {
                Some(cell) => Ok(RowStatus::from_i32(i32::from_value(cell.value())?)),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    pub fn row_deleted(&self) -> Result<bool> {
        Ok(self.row_status()? == Some(RowStatus::Deleted))
    }

    pub fn row_inserted(&self) -> Result<bool> {
        Ok(self.row_status()? == Some(RowStatus::Added))
    }

    pub fn row_updated(&self) -> Result<bool> {
        Ok(self.row_status()? == Some(RowStatus::Updated))
    }

    /// Mark the cursor closed, then release it on the server
    ///
    /// With `release == false` the server side is left alone, as when the
    /// connection is already gone. Closing twice is a no-op.
    pub fn close<P: CursorProtocol + ?Sized>(&mut self, proto: &mut P, release: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        self.insert_row = None;
        self.on_insert_row = false;
        if release {
            proto.close(self.handle)?;
        }
        Ok(())
    }
}
