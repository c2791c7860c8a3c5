use std::sync::Arc;

use crate::col::{Aggregate, ColumnDescriptor, Columns};
use crate::constant::{ColumnFlags, DoneStatus, ParamStatus, TokenType};
use crate::error::{Error, Result, ServerMessage};
use crate::protocol::primitive::*;
use crate::protocol::type_info::TypeInfo;
use crate::value::Value;

/// COLMETADATA count announcing that no metadata follows
const NO_METADATA: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKind {
    /// DONE: end of a SQL statement
    Done,
    /// DONEPROC: end of a stored procedure
    Proc,
    /// DONEINPROC: end of a statement inside a stored procedure
    InProc,
}

impl DoneKind {
    fn token_type(self) -> TokenType {
        match self {
            DoneKind::Done => TokenType::Done,
            DoneKind::Proc => TokenType::DoneProc,
            DoneKind::InProc => TokenType::DoneInProc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub kind: DoneKind,
    pub status: DoneStatus,
    pub cur_cmd: u16,
    pub row_count: u64,
}

impl Done {
    pub fn new(kind: DoneKind, status: DoneStatus, row_count: u64) -> Self {
        Self {
            kind,
            status,
            cur_cmd: 0,
            row_count,
        }
    }

    /// The row count is valid
    pub fn has_count(&self) -> bool {
        self.status.contains(DoneStatus::COUNT)
    }

    /// Acknowledges an attention signal
    pub fn is_attention(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    pub fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }
}

/// Metadata of a compute (aggregate) row set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltMetadata {
    pub id: u16,
    /// Columns of the owning row set the compute clause groups by
    pub by_cols: Vec<u16>,
    pub columns: Columns,
}

/// An output parameter or UDF return value
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    pub ordinal: u16,
    pub name: String,
    pub status: u8,
    pub type_info: TypeInfo,
    pub value: Value,
}

/// A decoded token of a tabular result stream
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    ColMetadata(Columns),
    AltMetadata(AltMetadata),
    Row(Vec<Value>),
    AltRow { id: u16, values: Vec<Value> },
    Done(Done),
    ReturnStatus(i32),
    ReturnValue(ReturnValue),
    Error(ServerMessage),
    Info(ServerMessage),
}

/// Stateful decoder of one connection's inbound token stream
///
/// ROW and ALTROW carry no self-description, so the decoder keeps the most
/// recent COLMETADATA and ALTMETADATA.
#[derive(Debug, Default)]
pub struct TokenDecoder {
    columns: Option<Columns>,
    alt: Vec<AltMetadata>,
    scratch: Vec<u8>,
}

impl TokenDecoder {
    /// Forget metadata of the previous reply
    pub fn reset(&mut self) {
        self.columns = None;
        self.alt.clear();
    }

    pub fn decode<R: WireRead + ?Sized>(&mut self, r: &mut R) -> Result<Token> {
        loop {
            let tag = r.read_int_1()?;
            let ty = TokenType::from_u8(tag).ok_or(Error::UnknownToken(tag))?;
            if ty.is_skippable() {
                let len = r.read_int_2()? as usize;
                r.skip(len)?;
                continue;
            }
            return match ty {
                TokenType::ColMetadata => self.decode_colmetadata(r),
                TokenType::AltMetadata => self.decode_altmetadata(r),
                TokenType::Row => {
                    let columns = self.columns.clone().ok_or(Error::InvalidPacket)?;
                    Ok(Token::Row(self.decode_values(r, &columns)?))
                }
                TokenType::AltRow => {
                    let id = r.read_int_2()?;
                    let columns = self
                        .alt
                        .iter()
                        .find(|alt| alt.id == id)
                        .map(|alt| Arc::clone(&alt.columns))
                        .ok_or(Error::InvalidPacket)?;
                    let values = self.decode_values(r, &columns)?;
                    Ok(Token::AltRow { id, values })
                }
                TokenType::Done | TokenType::DoneProc | TokenType::DoneInProc => {
                    let kind = match ty {
                        TokenType::Done => DoneKind::Done,
                        TokenType::DoneProc => DoneKind::Proc,
                        _ => DoneKind::InProc,
                    };
                    let status = DoneStatus::from_bits_retain(r.read_int_2()?);
                    let cur_cmd = r.read_int_2()?;
                    let row_count = r.read_int_8()?;
                    Ok(Token::Done(Done {
                        kind,
                        status,
                        cur_cmd,
                        row_count,
                    }))
                }
                TokenType::ReturnStatus => Ok(Token::ReturnStatus(r.read_i32()?)),
                TokenType::ReturnValue => {
                    let ordinal = r.read_int_2()?;
                    let name = r.read_b_varchar()?;
                    let status = r.read_int_1()?;
                    let _user_type = r.read_int_4()?;
                    let _flags = r.read_int_2()?;
                    let type_info = TypeInfo::read(r)?;
                    let value = type_info.read_value(r, &mut self.scratch)?;
                    Ok(Token::ReturnValue(ReturnValue {
                        ordinal,
                        name,
                        status,
                        type_info,
                        value,
                    }))
                }
                TokenType::Error => Ok(Token::Error(read_message(r)?)),
                TokenType::Info => Ok(Token::Info(read_message(r)?)),
                other => Err(Error::UnknownToken(other as u8)),
            };
        }
    }

    fn decode_colmetadata<R: WireRead + ?Sized>(&mut self, r: &mut R) -> Result<Token> {
        let count = r.read_int_2()?;
        self.alt.clear();
        if count == NO_METADATA {
            let columns: Columns = Arc::from(Vec::new());
            self.columns = Some(Arc::clone(&columns));
            return Ok(Token::ColMetadata(columns));
        }
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let user_type = r.read_int_4()?;
            let flags = ColumnFlags::from_bits_retain(r.read_int_2()?);
            let type_info = TypeInfo::read(r)?;
            let name = r.read_b_varchar()?;
            columns.push(ColumnDescriptor {
                name,
                type_info,
                flags,
                user_type,
                aggregate: None,
            });
        }
        let columns: Columns = Arc::from(columns);
        self.columns = Some(Arc::clone(&columns));
        Ok(Token::ColMetadata(columns))
    }

    fn decode_altmetadata<R: WireRead + ?Sized>(&mut self, r: &mut R) -> Result<Token> {
        let count = r.read_int_2()?;
        let id = r.read_int_2()?;
        let by_count = r.read_int_1()?;
        let mut by_cols = Vec::with_capacity(by_count as usize);
        for _ in 0..by_count {
            by_cols.push(r.read_int_2()?);
        }
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let op = r.read_int_1()?;
            let operand = r.read_int_2()?;
            let user_type = r.read_int_4()?;
            let flags = ColumnFlags::from_bits_retain(r.read_int_2()?);
            let type_info = TypeInfo::read(r)?;
            let name = r.read_b_varchar()?;
            columns.push(ColumnDescriptor {
                name,
                type_info,
                flags,
                user_type,
                aggregate: Some(Aggregate { op, operand }),
            });
        }
        let alt = AltMetadata {
            id,
            by_cols,
            columns: Arc::from(columns),
        };
        self.alt.retain(|a| a.id != id);
        self.alt.push(alt.clone());
        Ok(Token::AltMetadata(alt))
    }

    fn decode_values<R: WireRead + ?Sized>(
        &mut self,
        r: &mut R,
        columns: &[ColumnDescriptor],
    ) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(columns.len());
        for col in columns {
            values.push(col.type_info.read_value(r, &mut self.scratch)?);
        }
        Ok(values)
    }
}

fn read_message<R: WireRead + ?Sized>(r: &mut R) -> Result<ServerMessage> {
    let _len = r.read_int_2()?;
    let number = r.read_i32()?;
    let state = r.read_int_1()?;
    let class = r.read_int_1()?;
    let message = r.read_us_varchar()?;
    let server = r.read_b_varchar()?;
    let procedure = r.read_b_varchar()?;
    let line = r.read_i32()?;
    Ok(ServerMessage {
        number,
        state,
        class,
        message,
        server,
        procedure,
        line,
    })
}

// Encoders for the server side of a channel.

pub fn write_colmetadata(out: &mut Vec<u8>, columns: &[ColumnDescriptor]) -> Result<()> {
    write_int_1(out, TokenType::ColMetadata as u8);
    write_int_2(out, column_count(columns.len())?);
    for col in columns {
        write_int_4(out, col.user_type);
        write_int_2(out, col.flags.bits());
        col.type_info.write(out);
        write_b_varchar(out, &col.name)?;
    }
    Ok(())
}

pub fn write_row(out: &mut Vec<u8>, columns: &[ColumnDescriptor], values: &[Value]) -> Result<()> {
    write_int_1(out, TokenType::Row as u8);
    write_values(out, columns, values)
}

pub fn write_altmetadata(out: &mut Vec<u8>, alt: &AltMetadata) -> Result<()> {
    write_int_1(out, TokenType::AltMetadata as u8);
    write_int_2(out, column_count(alt.columns.len())?);
    write_int_2(out, alt.id);
    let by_count = u8::try_from(alt.by_cols.len())
        .map_err(|_| Error::BadUsageError("too many compute BY columns".to_string()))?;
    write_int_1(out, by_count);
    for col in &alt.by_cols {
        write_int_2(out, *col);
    }
    for col in alt.columns.iter() {
        let aggregate = col.aggregate.unwrap_or(Aggregate {
            op: Aggregate::SUM,
            operand: 1,
        });
        write_int_1(out, aggregate.op);
        write_int_2(out, aggregate.operand);
        write_int_4(out, col.user_type);
        write_int_2(out, col.flags.bits());
        col.type_info.write(out);
        write_b_varchar(out, &col.name)?;
    }
    Ok(())
}

pub fn write_altrow(out: &mut Vec<u8>, alt: &AltMetadata, values: &[Value]) -> Result<()> {
    write_int_1(out, TokenType::AltRow as u8);
    write_int_2(out, alt.id);
    write_values(out, &alt.columns, values)
}

pub fn write_done(out: &mut Vec<u8>, done: &Done) {
    write_int_1(out, done.kind.token_type() as u8);
    write_int_2(out, done.status.bits());
    write_int_2(out, done.cur_cmd);
    write_int_8(out, done.row_count);
}

pub fn write_return_status(out: &mut Vec<u8>, status: i32) {
    write_int_1(out, TokenType::ReturnStatus as u8);
    write_i32(out, status);
}

pub fn write_return_value(out: &mut Vec<u8>, rv: &ReturnValue) -> Result<()> {
    write_int_1(out, TokenType::ReturnValue as u8);
    write_int_2(out, rv.ordinal);
    write_b_varchar(out, &rv.name)?;
    write_int_1(out, rv.status);
    write_int_4(out, 0);
    write_int_2(out, 0);
    rv.type_info.write(out);
    rv.type_info.write_value(out, &rv.value)
}

pub fn write_error(out: &mut Vec<u8>, msg: &ServerMessage) -> Result<()> {
    write_message(out, TokenType::Error, msg)
}

pub fn write_info(out: &mut Vec<u8>, msg: &ServerMessage) -> Result<()> {
    write_message(out, TokenType::Info, msg)
}

fn write_message(out: &mut Vec<u8>, ty: TokenType, msg: &ServerMessage) -> Result<()> {
    let mut body = Vec::new();
    write_i32(&mut body, msg.number);
    write_int_1(&mut body, msg.state);
    write_int_1(&mut body, msg.class);
    write_us_varchar(&mut body, &msg.message)?;
    write_b_varchar(&mut body, &msg.server)?;
    write_b_varchar(&mut body, &msg.procedure)?;
    write_i32(&mut body, msg.line);
    let len = u16::try_from(body.len())
        .map_err(|_| Error::BadUsageError("server message too long".to_string()))?;
    write_int_1(out, ty as u8);
    write_int_2(out, len);
    out.extend_from_slice(&body);
    Ok(())
}

fn write_values(out: &mut Vec<u8>, columns: &[ColumnDescriptor], values: &[Value]) -> Result<()> {
    if columns.len() != values.len() {
        return Err(Error::BadUsageError(format!(
            "{} values for {} columns",
            values.len(),
            columns.len()
        )));
    }
    for (col, value) in columns.iter().zip(values) {
        col.type_info.write_value(out, value)?;
    }
    Ok(())
}

fn column_count(len: usize) -> Result<u16> {
    u16::try_from(len)
        .ok()
        .filter(|n| *n != NO_METADATA)
        .ok_or_else(|| Error::BadUsageError(format!("{} columns", len)))
}

/// RETURNVALUE status of an output parameter
pub const RETURN_VALUE_OUTPUT: u8 = ParamStatus::BY_REF_VALUE.bits();
