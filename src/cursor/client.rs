use crate::col::{ColumnDescriptor, Columns, visible_count};
use crate::constant::{Concurrency, CursorOp, FetchType, ProcId, ScrollMode};
use crate::cursor::state::{CursorProtocol, FetchOutcome};
use crate::demux::{ResponseStream, ResponseUnit, TokenSource};
use crate::error::{Error, Result, ServerMessage, Warning};
use crate::param::ParamDescriptor;
use crate::protocol::token::ReturnValue;
use crate::protocol::type_info::TypeInfo;
use crate::row::RowBuffer;
use crate::value::{FromValue, Value};

/// Ordinals of the `sp_cursoropen` output parameters
const OPEN_HANDLE: u16 = 0;
const OPEN_SCROLL: u16 = 2;
const OPEN_CONCURRENCY: u16 = 3;
const OPEN_ROW_COUNT: u16 = 4;
/// Ordinals of the `sp_cursorfetch` FETCH_INFO output parameters
const INFO_POSITION: u16 = 2;
const INFO_ROW_COUNT: u16 = 3;

/// Everything a fully drained RPC reply carried
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallReply {
    /// Columns of the first row set
    pub columns: Option<Columns>,
    /// First row of the first row set
    pub first_row: Option<Vec<Value>>,
    pub return_status: Option<i32>,
    pub out_params: Vec<ReturnValue>,
    /// Info and error messages in arrival order
    pub messages: Vec<ServerMessage>,
}

impl CallReply {
    /// Drain a reply to its end
    pub fn collect<S: TokenSource + ?Sized>(src: &mut S) -> Result<Self> {
        let mut stream = ResponseStream::new();
        let mut reply = CallReply::default();
        loop {
            match stream.advance(src) {
                Ok(false) => break,
                Ok(true) => match stream.current().cloned() {
                    Some(ResponseUnit::RowSet { columns, .. }) if reply.columns.is_none() => {
                        reply.columns = Some(columns);
                        reply.first_row = stream.next_row(src)?;
                    }
                    Some(ResponseUnit::Message(msg)) => reply.messages.push(msg),
                    _ => {}
                },
                Err(Error::ServerError(msg)) => reply.messages.push(msg),
                Err(e) => return Err(e),
            }
        }
        reply.return_status = stream.return_status();
        reply.out_params = stream.output_params().to_vec();
        Ok(reply)
    }

    fn out_value(&self, ordinal: u16) -> Option<&Value> {
        self.out_params
            .iter()
            .find(|rv| rv.ordinal == ordinal)
            .map(|rv| &rv.value)
    }

    fn out_int(&self, ordinal: u16) -> Option<i32> {
        self.out_value(ordinal)
            .and_then(|v| Option::<i32>::from_value(v).ok().flatten())
    }
}

/// One request/response exchange on the connection
///
/// Implementations send the request, bound it by the statement's deadline,
/// and drain the reply before returning.
pub trait RpcCall {
    fn call(&mut self, proc_id: ProcId, params: &[ParamDescriptor]) -> Result<CallReply>;
}

/// The server's answer to `sp_cursoropen`
#[derive(Debug, Clone)]
pub struct OpenedCursor {
    pub handle: i32,
    pub scroll: ScrollMode,
    pub concurrency: Concurrency,
    pub row_count: i32,
    pub columns: Columns,
}

fn int_param(value: i32) -> ParamDescriptor {
    ParamDescriptor::typed(TypeInfo::int(), value)
}

fn text_param(text: &str) -> ParamDescriptor {
    ParamDescriptor::typed(TypeInfo::nvarchar_max(), text)
}

fn placeholder(index: usize, param: &ParamDescriptor) -> String {
    if param.name.is_empty() {
        format!("@P{}", index)
    } else {
        param.name.clone()
    }
}

/// Parameters of `sp_cursoropen`
///
/// With `proc_name`, the statement becomes `exec <proc> @P0,...`. Arguments
/// are declared in a trailing declaration parameter and flagged with
/// [`ScrollMode::PARAMETERIZED_STMT`].
pub fn open_params(
    sql: &str,
    proc_name: Option<&str>,
    params: &[ParamDescriptor],
    scroll: ScrollMode,
    concurrency: Concurrency,
) -> Vec<ParamDescriptor> {
    let stmt = match proc_name {
        Some(name) => exec_text(name, params),
        None => sql.to_string(),
    };
    let mut scroll_opt = scroll.code();
    if !params.is_empty() {
        scroll_opt |= ScrollMode::PARAMETERIZED_STMT;
    }

    let mut out = Vec::with_capacity(5 + params.len() + 1);
    out.push(ParamDescriptor::output(TypeInfo::int()));
    out.push(text_param(&stmt));
    out.push(ParamDescriptor {
        value: Value::Int(scroll_opt),
        ..ParamDescriptor::output(TypeInfo::int())
    });
    out.push(ParamDescriptor {
        value: Value::Int(concurrency.code()),
        ..ParamDescriptor::output(TypeInfo::int())
    });
    out.push(ParamDescriptor::output(TypeInfo::int()));

    if !params.is_empty() {
        out.push(text_param(&declarations(params)));
        out.extend(params.iter().cloned());
    }
    out
}

/// `exec <proc>` followed by one placeholder per argument
pub fn exec_text(proc_name: &str, params: &[ParamDescriptor]) -> String {
    if params.is_empty() {
        return format!("exec {}", proc_name);
    }
    let args: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(i, p)| placeholder(i, p))
        .collect();
    format!("exec {} {}", proc_name, args.join(","))
}

/// Declaration text of the arguments, e.g. `@P0 int,@P1 nvarchar(4000)`
pub fn declarations(params: &[ParamDescriptor]) -> String {
    let decls: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{} {}", placeholder(i, p), p.type_info.sql_decl()))
        .collect();
    decls.join(",")
}

/// Parameters of `sp_executesql` running `stmt` directly
pub fn execute_sql_params(stmt: &str, params: &[ParamDescriptor]) -> Vec<ParamDescriptor> {
    let mut out = Vec::with_capacity(2 + params.len());
    out.push(text_param(stmt));
    out.push(text_param(&declarations(params)));
    out.extend(params.iter().cloned());
    out
}

/// Parameters of `sp_cursorfetch`
///
/// FETCH_INFO turns `rownum` and `nrows` into output parameters sent as NULL.
pub fn fetch_params(handle: i32, fetch: FetchType) -> Vec<ParamDescriptor> {
    let mut out = vec![int_param(handle), int_param(fetch.code())];
    if fetch == FetchType::Info {
        out.push(ParamDescriptor::output(TypeInfo::int()));
        out.push(ParamDescriptor::output(TypeInfo::int()));
    } else {
        out.push(int_param(fetch.row_num()));
        out.push(int_param(1));
    }
    out
}

/// Parameters of `sp_cursor`, or `None` when no column qualifies
///
/// Insert and update send one `@<column>` parameter per writable column
/// whose value was changed. Delete always proceeds.
pub fn modify_params(
    handle: i32,
    op: CursorOp,
    columns: &[ColumnDescriptor],
    row: Option<&RowBuffer>,
) -> Result<Option<Vec<ParamDescriptor>>> {
    let mut out = vec![int_param(handle), int_param(op as i32), int_param(1)];
    if op == CursorOp::Delete {
        return Ok(Some(out));
    }
    let row = row.ok_or(Error::UpdateRequiresRow)?;
    out.push(ParamDescriptor::typed(TypeInfo::nvarchar(128), ""));
    let header_len = out.len();

    for (i, col) in columns.iter().enumerate().take(visible_count(columns)) {
        let Some(cell) = row.get(i) else { break };
        if col.is_writable() && cell.is_updated() {
            out.push(
                ParamDescriptor::typed(col.type_info.clone(), cell.value().clone())
                    .named(format!("@{}", col.name)),
            );
        } else if op == CursorOp::Insert && !cell.is_null() {
            return Err(Error::ReadOnlyColumn {
                index: i + 1,
                name: col.name.clone(),
            });
        }
    }
    Ok((out.len() > header_len).then_some(out))
}

pub fn close_params(handle: i32) -> Vec<ParamDescriptor> {
    vec![int_param(handle)]
}

/// Cursor sub-protocol over one connection exchange
///
/// Info messages of every call are kept as warnings; the first error message
/// is raised after the reply has been drained.
pub struct CursorClient<T> {
    rpc: T,
    warnings: Vec<Warning>,
}

impl<T: RpcCall> CursorClient<T> {
    pub fn new(rpc: T) -> Self {
        Self {
            rpc,
            warnings: Vec::new(),
        }
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    #[tracing::instrument(skip_all, fields(proc = proc_id.name()))]
    fn call(&mut self, proc_id: ProcId, params: &[ParamDescriptor]) -> Result<CallReply> {
        let mut reply = self.rpc.call(proc_id, params)?;
        let mut first_error = None;
        for msg in reply.messages.drain(..) {
            if msg.is_error() {
                first_error.get_or_insert(msg);
            } else {
                self.warnings.push(Warning::from(msg));
            }
        }
        match first_error {
            Some(msg) => Err(Error::ServerError(msg)),
            None => Ok(reply),
        }
    }

    pub fn open(
        &mut self,
        sql: &str,
        proc_name: Option<&str>,
        params: &[ParamDescriptor],
        scroll: ScrollMode,
        concurrency: Concurrency,
    ) -> Result<OpenedCursor> {
        let request = open_params(sql, proc_name, params, scroll, concurrency);
        let reply = self.call(ProcId::CursorOpen, &request)?;
        let columns = reply.columns.clone().ok_or(Error::NoResultSet)?;
        if reply.return_status != Some(0) {
            return Err(Error::CursorOpenFailed(match reply.return_status {
                Some(status) => format!("sp_cursoropen returned {}", status),
                None => "sp_cursoropen returned no status".to_string(),
            }));
        }
        let out = |ordinal| {
            reply.out_int(ordinal).ok_or_else(|| {
                Error::CursorOpenFailed(format!("output parameter {} missing", ordinal))
            })
        };
        let handle = out(OPEN_HANDLE)?;
        let granted_scroll = out(OPEN_SCROLL)? & !ScrollMode::PARAMETERIZED_STMT;
        let granted_cc = out(OPEN_CONCURRENCY)?;
        let row_count = out(OPEN_ROW_COUNT)?;

        let mut actual_scroll = scroll;
        let mut actual_cc = concurrency;
        if granted_scroll != scroll.code() || granted_cc != concurrency.code() {
            let mut detail = Vec::new();
            match ScrollMode::from_code(granted_scroll) {
                Some(mode) => actual_scroll = mode,
                None => detail.push(format!("unknown scroll option {}", granted_scroll)),
            }
            match Concurrency::from_code(granted_cc) {
                Some(mode) => actual_cc = mode,
                None => detail.push(format!("unknown concurrency option {}", granted_cc)),
            }
            let mut message = format!(
                "The cursor type/concurrency was changed: requested {:?}/{:?}, granted {:?}/{:?}",
                scroll, concurrency, actual_scroll, actual_cc
            );
            if !detail.is_empty() {
                message.push_str(&format!(" ({})", detail.join(", ")));
            }
            tracing::warn!(handle, "{}", message);
            self.warnings.push(Warning::new(message));
        }
        tracing::debug!(
            handle,
            scroll = ?actual_scroll,
            concurrency = ?actual_cc,
            row_count,
            "cursor opened"
        );
        Ok(OpenedCursor {
            handle,
            scroll: actual_scroll,
            concurrency: actual_cc,
            row_count,
            columns,
        })
    }
}

impl<T: RpcCall> CursorProtocol for CursorClient<T> {
    fn fetch(&mut self, handle: i32, fetch: FetchType) -> Result<FetchOutcome> {
        let reply = self.call(ProcId::CursorFetch, &fetch_params(handle, fetch))?;
        if fetch == FetchType::Info {
            return Ok(FetchOutcome {
                row: None,
                position: reply.out_int(INFO_POSITION),
                row_count: reply.out_int(INFO_ROW_COUNT),
            });
        }
        Ok(FetchOutcome {
            row: reply.first_row.map(RowBuffer::new),
            position: None,
            row_count: None,
        })
    }

    fn modify(
        &mut self,
        handle: i32,
        op: CursorOp,
        columns: &[ColumnDescriptor],
        row: Option<&RowBuffer>,
    ) -> Result<()> {
        let Some(params) = modify_params(handle, op, columns, row)? else {
            return Ok(());
        };
        self.call(ProcId::Cursor, &params)?;
        Ok(())
    }

    fn close(&mut self, handle: i32) -> Result<()> {
        self.call(ProcId::CursorClose, &close_params(handle))?;
        Ok(())
    }
}
