//! Splits one reply into an ordered sequence of [`ResponseUnit`]s
//!
//! The stream is decoupled from where tokens come from: every call takes the
//! [`TokenSource`] to pull from, so a reply can be read partly from the wire
//! and partly from an in-memory backlog.

use std::collections::VecDeque;

use crate::col::Columns;
use crate::error::{Error, Result, ServerMessage, eyre};
use crate::protocol::token::{AltMetadata, DoneKind, ReturnValue, Token};
use crate::value::Value;

pub trait TokenSource {
    /// Next token of the reply, `None` once the reply is complete
    fn next_token(&mut self) -> Result<Option<Token>>;

    /// Error reported when the server acknowledges an attention
    fn interruption(&self) -> Error {
        Error::Cancelled
    }
}

impl TokenSource for VecDeque<Token> {
    fn next_token(&mut self) -> Result<Option<Token>> {
        Ok(self.pop_front())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseUnit {
    /// Rows of a SELECT, or of one compute clause when `compute` is set
    RowSet {
        columns: Columns,
        compute: Option<u16>,
    },
    UpdateCount(u64),
    Message(ServerMessage),
    /// End of the reply
    Done,
}

impl ResponseUnit {
    pub fn columns(&self) -> Option<&Columns> {
        match self {
            ResponseUnit::RowSet { columns, .. } => Some(columns),
            _ => None,
        }
    }
}

enum RowStep {
    Take,
    Absorb,
    Terminate,
    Interrupted,
    Stop,
}

#[derive(Debug, Default)]
pub struct ResponseStream {
    current: Option<ResponseUnit>,
    unit_index: usize,
    /// The current row set may have rows left on the source
    in_rows: bool,
    /// Rows of the current unit already pulled from the source
    cached: VecDeque<Vec<Value>>,
    peeked: Option<Token>,
    /// Columns of the last COLMETADATA, resumed by rows after a compute row
    base_columns: Option<Columns>,
    alt: Vec<AltMetadata>,
    return_status: Option<i32>,
    out_params: Vec<ReturnValue>,
    finished: bool,
    cancelled: bool,
}

impl ResponseStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ResponseUnit> {
        self.current.as_ref()
    }

    /// 1-based position of the current unit, 0 before the first advance
    pub fn unit_index(&self) -> usize {
        self.unit_index
    }

    pub fn columns(&self) -> Option<&Columns> {
        self.current.as_ref().and_then(ResponseUnit::columns)
    }

    pub fn update_count(&self) -> Option<u64> {
        match self.current {
            Some(ResponseUnit::UpdateCount(n)) => Some(n),
            _ => None,
        }
    }

    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    pub fn output_params(&self) -> &[ReturnValue] {
        &self.out_params
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Move to the next unit, draining unread rows of the current one
    ///
    /// Returns `false` at the end of the reply. Reaching an error message
    /// makes it current and returns it as `Err`; a later call moves past it.
    pub fn advance<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.skip_rows(src)?;
        loop {
            let Some(token) = self.pull(src)? else {
                self.finish();
                return Ok(false);
            };
            if let Some(unit) = self.unit_for(token, src)? {
                self.unit_index += 1;
                let error = match &unit {
                    ResponseUnit::Message(msg) if msg.is_error() => Some(msg.clone()),
                    _ => None,
                };
                self.current = Some(unit);
                return match error {
                    Some(msg) => Err(Error::ServerError(msg)),
                    None => Ok(true),
                };
            }
        }
    }

    /// Next row of the current row set
    pub fn next_row<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<Option<Vec<Value>>> {
        if let Some(row) = self.cached.pop_front() {
            return Ok(Some(row));
        }
        self.read_row(src)
    }

    /// Discard the rest of the current row set
    pub fn skip_rows<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<()> {
        self.cached.clear();
        while self.read_row(src)?.is_some() {}
        Ok(())
    }

    /// Another unit follows the current one
    ///
    /// Rows of the current unit that are still on the source are pulled into
    /// memory so they stay readable.
    pub fn has_more<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.look_ahead(src, |_| false)
    }

    /// Another row set, update count or error follows the current unit
    ///
    /// Info messages in between are consumed and handed to `on_info`.
    pub fn has_more_results<S, F>(&mut self, src: &mut S, mut on_info: F) -> Result<bool>
    where
        S: TokenSource + ?Sized,
        F: FnMut(&ServerMessage),
    {
        self.look_ahead(src, |msg| {
            on_info(msg);
            true
        })
    }

    fn look_ahead<S, F>(&mut self, src: &mut S, mut absorb_info: F) -> Result<bool>
    where
        S: TokenSource + ?Sized,
        F: FnMut(&ServerMessage) -> bool,
    {
        while let Some(row) = self.read_row(src)? {
            self.cached.push_back(row);
        }
        loop {
            let absorb = match self.peek(src)? {
                None => return Ok(false),
                Some(Token::Info(msg)) => absorb_info(msg),
                Some(Token::ColMetadata(columns)) => columns.is_empty(),
                Some(Token::AltMetadata(_) | Token::ReturnStatus(_) | Token::ReturnValue(_)) => true,
                Some(Token::Done(done)) => {
                    !done.is_attention() && !(done.has_count() && done.kind != DoneKind::Proc)
                }
                Some(_) => false,
            };
            if !absorb {
                return Ok(true);
            }
            if let Some(token) = self.peeked.take() {
                self.unit_for(token, src)?;
            }
        }
    }

    /// Run the reply to its end and return every message in it
    ///
    /// Error messages are returned, not raised; an interrupted reply is.
    pub fn drain<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<Vec<ServerMessage>> {
        let mut messages = Vec::new();
        loop {
            match self.advance(src) {
                Ok(false) => return Ok(messages),
                Ok(true) => {
                    if let Some(ResponseUnit::Message(msg)) = &self.current {
                        messages.push(msg.clone());
                    }
                }
                Err(Error::ServerError(msg)) => messages.push(msg),
                Err(e) => return Err(e),
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.in_rows = false;
        self.current = Some(ResponseUnit::Done);
    }

    fn pull<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<Option<Token>> {
        if let Some(token) = self.peeked.take() {
            return Ok(Some(token));
        }
        if self.finished {
            return Ok(None);
        }
        src.next_token()
    }

    fn peek<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<Option<&Token>> {
        if self.peeked.is_none() && !self.finished {
            self.peeked = src.next_token()?;
        }
        Ok(self.peeked.as_ref())
    }

    fn read_row<S: TokenSource + ?Sized>(&mut self, src: &mut S) -> Result<Option<Vec<Value>>> {
        if !self.in_rows {
            return Ok(None);
        }
        let compute = matches!(
            self.current,
            Some(ResponseUnit::RowSet {
                compute: Some(_),
                ..
            })
        );
        loop {
            let step = match self.peek(src)? {
                Some(Token::Row(_)) if !compute => RowStep::Take,
                // compute metadata sits between COLMETADATA and the first row
                Some(Token::AltMetadata(_)) => RowStep::Absorb,
                Some(Token::Done(done)) if done.is_attention() => RowStep::Interrupted,
                Some(Token::Done(_)) => RowStep::Terminate,
                _ => RowStep::Stop,
            };
            return match step {
                RowStep::Take => match self.peeked.take() {
                    Some(Token::Row(values)) => Ok(Some(values)),
                    _ => Err(Error::LibraryBug(eyre!("peeked token changed under read_row"))),
                },
                RowStep::Absorb => {
                    if let Some(token) = self.peeked.take() {
                        self.unit_for(token, src)?;
                    }
                    continue;
                }
                RowStep::Terminate => {
                    self.peeked = None;
                    self.in_rows = false;
                    Ok(None)
                }
                RowStep::Interrupted => {
                    self.peeked = None;
                    self.cancelled = true;
                    self.finish();
                    Err(src.interruption())
                }
                RowStep::Stop => {
                    self.in_rows = false;
                    Ok(None)
                }
            };
        }
    }

    /// Apply a token; returns the unit it starts, if any
    fn unit_for<S: TokenSource + ?Sized>(
        &mut self,
        token: Token,
        src: &S,
    ) -> Result<Option<ResponseUnit>> {
        Ok(match token {
            Token::ColMetadata(columns) if columns.is_empty() => None,
            Token::ColMetadata(columns) => {
                self.alt.clear();
                self.base_columns = Some(Columns::clone(&columns));
                self.in_rows = true;
                Some(ResponseUnit::RowSet {
                    columns,
                    compute: None,
                })
            }
            Token::AltMetadata(alt) => {
                self.alt.retain(|a| a.id != alt.id);
                self.alt.push(alt);
                None
            }
            Token::Row(values) => {
                let columns = self.base_columns.clone().ok_or(Error::InvalidPacket)?;
                self.cached.push_back(values);
                self.in_rows = true;
                Some(ResponseUnit::RowSet {
                    columns,
                    compute: None,
                })
            }
            Token::AltRow { id, values } => {
                let columns = self
                    .alt
                    .iter()
                    .find(|a| a.id == id)
                    .map(|a| Columns::clone(&a.columns))
                    .ok_or(Error::InvalidPacket)?;
                self.cached.push_back(values);
                self.in_rows = true;
                Some(ResponseUnit::RowSet {
                    columns,
                    compute: Some(id),
                })
            }
            Token::Done(done) if done.is_attention() => {
                self.cancelled = true;
                self.finish();
                return Err(src.interruption());
            }
            Token::Done(done) if done.has_count() && done.kind != DoneKind::Proc => {
                Some(ResponseUnit::UpdateCount(done.row_count))
            }
            Token::Done(_) => None,
            Token::ReturnStatus(status) => {
                self.return_status = Some(status);
                None
            }
            Token::ReturnValue(rv) => {
                self.out_params.push(rv);
                None
            }
            Token::Error(msg) | Token::Info(msg) => Some(ResponseUnit::Message(msg)),
        })
    }
}
