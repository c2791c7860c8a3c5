//! In-process server speaking enough TDS to drive a `Conn` end to end
//!
//! Understands a small SQL dialect over in-memory tables, `sp_executesql`,
//! and the `sp_cursor*` procedures. `waitfor delay` and cross joins block
//! until their time runs out or an attention arrives.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use zero_tds::Opts;
use zero_tds::col::{Aggregate, ColumnDescriptor};
use zero_tds::constant::{
    ColumnFlags, CursorOp, DoneStatus, FetchType, PacketType, ProcId, ROW_STATUS_COLUMN,
    RowStatus, ScrollMode,
};
use zero_tds::error::ServerMessage;
use zero_tds::param::ParamDescriptor;
use zero_tds::protocol::packet::{attention_packet, frame_message, read_message};
use zero_tds::protocol::rpc::{DecodedRpc, RpcTarget, read_rpc, read_sql_batch};
use zero_tds::protocol::token::{
    AltMetadata, Done, DoneKind, ReturnValue, write_altmetadata, write_altrow, write_colmetadata,
    write_done, write_error, write_info, write_return_status, write_return_value, write_row,
};
use zero_tds::protocol::type_info::TypeInfo;
use zero_tds::sync::{Attention, Channel, Conn};
use zero_tds::value::{FromValue, Value};

/// How long a cross join of several tables takes
pub const CROSS_JOIN_DELAY: Duration = Duration::from_secs(30);
const PACKET_SIZE: usize = 4096;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

// ---------------------------------------------------------------------------
// In-memory duplex pipe

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Clone, Default)]
struct Pipe(Arc<(Mutex<PipeState>, Condvar)>);

impl Pipe {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        let (lock, cv) = &*self.0;
        let mut st = lock.lock().unwrap();
        if st.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        st.buf.extend(data);
        cv.notify_all();
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        let (lock, cv) = &*self.0;
        let mut st = lock.lock().unwrap();
        while st.buf.is_empty() && !st.closed {
            st = cv.wait(st).unwrap();
        }
        let n = out.len().min(st.buf.len());
        for (dst, src) in out.iter_mut().zip(st.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&self) {
        let (lock, cv) = &*self.0;
        lock.lock().unwrap().closed = true;
        cv.notify_all();
    }
}

struct PipeReader(Pipe);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Client end of a simulated connection
pub struct PipeChannel {
    up: Pipe,
    down: Pipe,
    writer: Arc<Mutex<()>>,
}

impl Channel for PipeChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.down.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let _writer = self.writer.lock().unwrap();
        self.up.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn attention(&self) -> io::Result<Arc<dyn Attention>> {
        Ok(Arc::new(PipeAttention {
            up: self.up.clone(),
            down: self.down.clone(),
            writer: Arc::clone(&self.writer),
        }))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.up.close();
        self.down.close();
        Ok(())
    }
}

struct PipeAttention {
    up: Pipe,
    down: Pipe,
    writer: Arc<Mutex<()>>,
}

impl Attention for PipeAttention {
    fn send_attention(&self) -> io::Result<()> {
        let _writer = self.writer.lock().unwrap();
        self.up.write(&attention_packet())
    }

    fn abort(&self) -> io::Result<()> {
        self.up.close();
        self.down.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server state

#[derive(Debug, Clone)]
struct ColumnDef {
    name: String,
    type_info: TypeInfo,
    identity: bool,
    unique: bool,
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<ColumnDef>,
    rows: Vec<Option<Vec<Value>>>,
    next_identity: i32,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn descriptors(&self) -> Vec<ColumnDescriptor> {
        self.columns
            .iter()
            .map(|c| {
                let mut flags = ColumnFlags::NULLABLE;
                if c.identity {
                    flags |= ColumnFlags::IDENTITY;
                } else {
                    flags |= ColumnFlags::UPDATEABLE;
                }
                ColumnDescriptor::new(c.name.clone(), c.type_info.clone(), flags)
            })
            .collect()
    }
}

struct CursorRow {
    values: Vec<Value>,
    status: RowStatus,
    /// Row index in the base table
    key: Option<usize>,
}

struct ServerCursor {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<CursorRow>,
    table: Option<String>,
    pos: i32,
    concurrency: i32,
}

impl ServerCursor {
    fn len(&self) -> i32 {
        self.rows.len() as i32
    }

    /// Move to `target`, clamping to 0 and `len + 1`
    fn move_to(&mut self, target: i32) -> Option<usize> {
        if target < 1 {
            self.pos = 0;
            None
        } else if target > self.len() {
            self.pos = self.len() + 1;
            None
        } else {
            self.pos = target;
            Some((target - 1) as usize)
        }
    }

    fn wire_columns(&self) -> Vec<ColumnDescriptor> {
        let mut columns = self.columns.clone();
        columns.push(ColumnDescriptor::new(
            ROW_STATUS_COLUMN,
            TypeInfo::int(),
            ColumnFlags::HIDDEN,
        ));
        columns
    }
}

#[derive(Default)]
pub struct ServerState {
    tables: HashMap<String, Table>,
    procs: HashMap<String, String>,
    cursors: HashMap<i32, ServerCursor>,
    next_handle: i32,
    /// Requested (scroll, concurrency) codes mapped to granted ones
    grants: Vec<((i32, i32), (i32, i32))>,
    /// One line per request, e.g. `sp_cursorfetch` or `batch: select 1`
    requests: Vec<String>,
    attentions: usize,
    /// Client-to-server pipe of every connection
    links: Vec<Pipe>,
}

/// A simulated database shared by every connection made from it
#[derive(Clone, Default)]
pub struct Server {
    state: Arc<Mutex<ServerState>>,
}

impl Server {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    pub fn connect(&self) -> Conn {
        self.connect_with(Opts::default())
    }

    pub fn connect_with(&self, opts: Opts) -> Conn {
        let up = Pipe::default();
        let down = Pipe::default();
        let (tx, rx) = mpsc::channel();

        self.state.lock().unwrap().links.push(up.clone());
        let reader_pipe = up.clone();
        thread::spawn(move || {
            let mut reader = PipeReader(reader_pipe);
            while let Ok(message) = read_message(&mut reader) {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        let session = Session {
            state: Arc::clone(&self.state),
            rx,
            down: down.clone(),
            pending: VecDeque::new(),
        };
        thread::spawn(move || session.run());

        let channel = PipeChannel {
            up,
            down,
            writer: Arc::new(Mutex::new(())),
        };
        Conn::new(channel, opts).unwrap()
    }

    /// Grant `granted` codes whenever `requested` codes are asked for
    pub fn grant(&self, requested: (i32, i32), granted: (i32, i32)) {
        self.state.lock().unwrap().grants.push((requested, granted));
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().unwrap().cursors.len()
    }

    /// Cut every connection as a network failure would
    ///
    /// Client writes fail from now on; the connections are not closed.
    pub fn sever(&self) {
        for link in self.state.lock().unwrap().links.drain(..) {
            link.close();
        }
    }

    pub fn attentions(&self) -> usize {
        self.state.lock().unwrap().attentions
    }

    /// Rows of `table` in storage order
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

pub fn message(number: i32, class: u8, text: impl Into<String>) -> ServerMessage {
    ServerMessage {
        number,
        state: 1,
        class,
        message: text.into(),
        server: "sim".to_string(),
        procedure: String::new(),
        line: 1,
    }
}

fn syntax_error(near: &str) -> ServerMessage {
    message(102, 15, format!("Incorrect syntax near '{}'.", near))
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Lex {
    Word(String),
    Str(String),
    Num(i64),
    Punct(char),
}

fn lex(sql: &str) -> Result<Vec<Lex>, ServerMessage> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(message(105, 15, "Unclosed quotation mark")),
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        s.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            out.push(Lex::Str(s));
        } else if c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = i;
            i += 1;
            while chars.get(i).is_some_and(|d| d.is_ascii_digit()) {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push(Lex::Num(text.parse().map_err(|_| syntax_error(&text))?));
        } else if c.is_alphanumeric() || c == '_' || c == '#' || c == '@' {
            let start = i;
            while chars
                .get(i)
                .is_some_and(|d| d.is_alphanumeric() || matches!(d, '_' | '#' | '@' | '.'))
            {
                i += 1;
            }
            out.push(Lex::Word(chars[start..i].iter().collect()));
        } else {
            out.push(Lex::Punct(c));
            i += 1;
        }
    }
    Ok(out)
}

struct Parser<'a> {
    toks: Vec<Lex>,
    at: usize,
    params: &'a HashMap<String, Value>,
}

impl<'a> Parser<'a> {
    fn new(sql: &str, params: &'a HashMap<String, Value>) -> Result<Self, ServerMessage> {
        Ok(Self {
            toks: lex(sql)?,
            at: 0,
            params,
        })
    }

    fn peek(&self) -> Option<&Lex> {
        self.toks.get(self.at)
    }

    fn done(&self) -> bool {
        self.at >= self.toks.len()
    }

    fn next(&mut self) -> Option<Lex> {
        let tok = self.toks.get(self.at).cloned();
        self.at += 1;
        tok
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Lex::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), ServerMessage> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(syntax_error(kw))
        }
    }

    fn eat_punct(&mut self, p: char) -> bool {
        if self.peek() == Some(&Lex::Punct(p)) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: char) -> Result<(), ServerMessage> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(syntax_error(&p.to_string()))
        }
    }

    fn ident(&mut self) -> Result<String, ServerMessage> {
        match self.next() {
            Some(Lex::Word(w)) => Ok(w),
            other => Err(syntax_error(&format!("{:?}", other))),
        }
    }

    fn value(&mut self) -> Result<Value, ServerMessage> {
        match self.next() {
            Some(Lex::Num(n)) => Ok(i32::try_from(n).map_or(Value::BigInt(n), Value::Int)),
            Some(Lex::Str(s)) => Ok(Value::String(s)),
            Some(Lex::Word(w)) if w.eq_ignore_ascii_case("null") => Ok(Value::Null),
            Some(Lex::Word(w)) if w.starts_with('@') => self
                .params
                .get(&w.to_ascii_lowercase())
                .cloned()
                .ok_or_else(|| message(137, 15, format!("Must declare the scalar variable \"{}\".", w))),
            other => Err(syntax_error(&format!("{:?}", other))),
        }
    }
}

fn coerce(value: Value, type_info: &TypeInfo) -> Value {
    match (type_info, value) {
        (_, Value::Null) => Value::Null,
        (TypeInfo::IntN(4), v) => i32::from_value(&v).map_or(v, Value::Int),
        (TypeInfo::NVarChar { .. }, Value::String(s)) => Value::String(s),
        (TypeInfo::NVarChar { .. }, v) => Value::String(v.to_string()),
        (_, v) => v,
    }
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => std::cmp::Ordering::Equal,
        (Value::Null, _) => std::cmp::Ordering::Less,
        (_, Value::Null) => std::cmp::Ordering::Greater,
        _ => match (i64::from_value(a), i64::from_value(b)) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

fn same(a: &Value, b: &Value) -> bool {
    !a.is_null() && compare(a, b) == std::cmp::Ordering::Equal
}

// ---------------------------------------------------------------------------
// Queries

struct Compute {
    by: usize,
    sum: usize,
}

struct Query {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<Value>>,
    table: Option<String>,
    keys: Vec<Option<usize>>,
    compute: Option<Compute>,
}

/// Parsed `select`, evaluated once any delay has passed
struct Select {
    items: Option<Vec<String>>,
    literals: Vec<Value>,
    tables: Vec<String>,
    filter: Option<(String, Value)>,
    order: Vec<(String, bool)>,
    compute: Option<(String, String)>,
}

impl Select {
    fn parse(p: &mut Parser<'_>) -> Result<Self, ServerMessage> {
        p.expect_kw("select")?;
        let mut select = Select {
            items: None,
            literals: Vec::new(),
            tables: Vec::new(),
            filter: None,
            order: Vec::new(),
            compute: None,
        };
        if p.eat_punct('*') {
            select.items = None;
        } else if matches!(p.peek(), Some(Lex::Num(_) | Lex::Str(_))) {
            loop {
                select.literals.push(p.value()?);
                if !p.eat_punct(',') {
                    break;
                }
            }
            return Ok(select);
        } else {
            let mut items = Vec::new();
            loop {
                items.push(p.ident()?);
                if !p.eat_punct(',') {
                    break;
                }
            }
            select.items = Some(items);
        }
        p.expect_kw("from")?;
        loop {
            select.tables.push(p.ident()?.to_ascii_lowercase());
            if !p.eat_punct(',') {
                break;
            }
        }
        if p.eat_kw("where") {
            let col = p.ident()?;
            p.expect_punct('=')?;
            select.filter = Some((col, p.value()?));
        }
        if p.eat_kw("order") {
            p.expect_kw("by")?;
            loop {
                let col = p.ident()?;
                let desc = p.eat_kw("desc");
                if !desc {
                    p.eat_kw("asc");
                }
                select.order.push((col, desc));
                if !p.eat_punct(',') {
                    break;
                }
            }
        }
        if p.eat_kw("compute") {
            p.expect_kw("sum")?;
            p.expect_punct('(')?;
            let sum = p.ident()?;
            p.expect_punct(')')?;
            p.expect_kw("by")?;
            let by = p.ident()?;
            select.compute = Some((sum, by));
        }
        Ok(select)
    }

    fn is_slow(&self) -> bool {
        self.tables.len() > 1
    }

    fn eval(&self, state: &ServerState) -> Result<Query, ServerMessage> {
        if self.tables.is_empty() {
            let columns = self
                .literals
                .iter()
                .map(|v| {
                    let ti = match v {
                        Value::String(_) => TypeInfo::nvarchar(4000),
                        _ => TypeInfo::int(),
                    };
                    ColumnDescriptor::new("", ti, ColumnFlags::NULLABLE)
                })
                .collect();
            return Ok(Query {
                columns,
                rows: vec![self.literals.clone()],
                table: None,
                keys: vec![None],
                compute: None,
            });
        }

        let mut columns: Vec<ColumnDescriptor> = Vec::new();
        let mut rows: Vec<(Vec<Value>, Option<usize>)> = vec![(Vec::new(), None)];
        for name in &self.tables {
            let table = state
                .tables
                .get(name)
                .ok_or_else(|| message(208, 16, format!("Invalid object name '{}'.", name)))?;
            columns.extend(table.descriptors());
            let single = self.tables.len() == 1;
            let mut joined = Vec::new();
            for (prefix, _) in &rows {
                for (key, row) in table.rows.iter().enumerate() {
                    if let Some(row) = row {
                        let mut values = prefix.clone();
                        values.extend(row.iter().cloned());
                        joined.push((values, single.then_some(key)));
                    }
                }
            }
            rows = joined;
        }
        let index_of = |name: &str| {
            columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| message(207, 16, format!("Invalid column name '{}'.", name)))
        };

        if let Some((col, value)) = &self.filter {
            let i = index_of(col)?;
            rows.retain(|(row, _)| same(&row[i], value));
        }
        let order: Vec<(usize, bool)> = self
            .order
            .iter()
            .map(|(col, desc)| index_of(col).map(|i| (i, *desc)))
            .collect::<Result<_, _>>()?;
        rows.sort_by(|(a, _), (b, _)| {
            for (i, desc) in &order {
                let ord = compare(&a[*i], &b[*i]);
                let ord = if *desc { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });

        let compute = match &self.compute {
            Some((sum, by)) => Some(Compute {
                by: index_of(by)?,
                sum: index_of(sum)?,
            }),
            None => None,
        };

        let (columns, rows) = match &self.items {
            None => (columns, rows),
            Some(items) => {
                let picks: Vec<usize> = items
                    .iter()
                    .map(|c| index_of(c))
                    .collect::<Result<_, _>>()?;
                let projected = picks.iter().map(|&i| columns[i].clone()).collect();
                let rows = rows
                    .into_iter()
                    .map(|(row, key)| (picks.iter().map(|&i| row[i].clone()).collect(), key))
                    .collect();
                (projected, rows)
            }
        };
        let (rows, keys) = rows.into_iter().unzip();
        Ok(Query {
            columns,
            rows,
            table: (self.tables.len() == 1).then(|| self.tables[0].clone()),
            keys,
            compute,
        })
    }
}

// ---------------------------------------------------------------------------
// Session

enum Flow {
    Continue,
    /// The reply is complete, including its closing DONEPROC
    Finished,
    Interrupted,
}

struct Reply {
    out: Vec<u8>,
    in_proc: bool,
}

impl Reply {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            in_proc: false,
        }
    }

    fn done(&mut self, status: DoneStatus, count: Option<u64>) {
        let kind = if self.in_proc {
            DoneKind::InProc
        } else {
            DoneKind::Done
        };
        let mut status = status;
        if count.is_some() {
            status |= DoneStatus::COUNT;
        }
        write_done(&mut self.out, &Done::new(kind, status, count.unwrap_or(0)));
    }

    fn done_proc(&mut self) {
        write_done(
            &mut self.out,
            &Done::new(DoneKind::Proc, DoneStatus::empty(), 0),
        );
    }

    fn error(&mut self, msg: &ServerMessage) {
        write_error(&mut self.out, msg).unwrap();
        self.done(DoneStatus::ERROR, None);
    }

    fn return_value(&mut self, ordinal: u16, value: i32) {
        write_return_value(
            &mut self.out,
            &ReturnValue {
                ordinal,
                name: String::new(),
                status: 1,
                type_info: TypeInfo::int(),
                value: Value::Int(value),
            },
        )
        .unwrap();
    }

    fn rows(&mut self, query: &Query) {
        write_colmetadata(&mut self.out, &query.columns).unwrap();
        let Some(compute) = &query.compute else {
            for row in &query.rows {
                write_row(&mut self.out, &query.columns, row).unwrap();
            }
            self.done(DoneStatus::empty(), Some(query.rows.len() as u64));
            return;
        };
        let alt = AltMetadata {
            id: 1,
            by_cols: vec![compute.by as u16 + 1],
            columns: Arc::from(vec![ColumnDescriptor {
                aggregate: Some(Aggregate {
                    op: Aggregate::SUM,
                    operand: compute.sum as u16 + 1,
                }),
                ..ColumnDescriptor::new("sum", TypeInfo::int(), ColumnFlags::NULLABLE)
            }]),
        };
        write_altmetadata(&mut self.out, &alt).unwrap();
        let mut i = 0;
        while i < query.rows.len() {
            let group = query.rows[i][compute.by].clone();
            let mut sum = 0i32;
            while i < query.rows.len() && same(&query.rows[i][compute.by], &group) {
                write_row(&mut self.out, &query.columns, &query.rows[i]).unwrap();
                sum += i32::from_value(&query.rows[i][compute.sum]).unwrap_or(0);
                i += 1;
            }
            write_altrow(&mut self.out, &alt, &[Value::Int(sum)]).unwrap();
        }
        self.done(DoneStatus::empty(), Some(query.rows.len() as u64));
    }
}

struct Session {
    state: Arc<Mutex<ServerState>>,
    rx: Receiver<(PacketType, Vec<u8>)>,
    down: Pipe,
    pending: VecDeque<(PacketType, Vec<u8>)>,
}

impl Session {
    fn run(mut self) {
        loop {
            let next = match self.pending.pop_front() {
                Some(message) => message,
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => return,
                },
            };
            let (ty, payload) = next;
            let reply = match ty {
                PacketType::Attention => {
                    self.state.lock().unwrap().attentions += 1;
                    let mut reply = Reply::new();
                    reply.done(DoneStatus::ATTN, None);
                    reply
                }
                PacketType::SqlBatch => {
                    let sql = read_sql_batch(&payload).unwrap();
                    self.log(format!("batch: {}", sql));
                    let mut reply = Reply::new();
                    self.batch(&mut reply, &sql, &HashMap::new());
                    reply
                }
                PacketType::Rpc => {
                    let rpc = read_rpc(&payload).unwrap();
                    let mut reply = Reply::new();
                    self.rpc(&mut reply, rpc);
                    reply
                }
                _ => continue,
            };
            if self.send(&reply.out).is_err() {
                return;
            }
        }
    }

    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut framed = Vec::new();
        frame_message(
            &mut framed,
            PacketType::TabularResult as u8,
            payload,
            PACKET_SIZE,
        );
        self.down.write(&framed)
    }

    fn log(&self, line: String) {
        self.state.lock().unwrap().requests.push(line);
    }

    /// Block for `duration`; `true` if an attention cut it short
    fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok((PacketType::Attention, _)) => {
                    self.state.lock().unwrap().attentions += 1;
                    return true;
                }
                Ok(other) => self.pending.push_back(other),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }

    fn interrupted(reply: &mut Reply) -> Flow {
        let in_proc = reply.in_proc;
        reply.in_proc = false;
        reply.done(DoneStatus::ATTN, None);
        reply.in_proc = in_proc;
        Flow::Interrupted
    }

    fn batch(&mut self, reply: &mut Reply, sql: &str, params: &HashMap<String, Value>) -> Flow {
        let trimmed = sql.trim();
        let statements: Vec<&str> = if trimmed
            .get(..16)
            .is_some_and(|head| head.eq_ignore_ascii_case("create procedure"))
        {
            vec![trimmed]
        } else {
            trimmed
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        };
        for stmt in statements {
            if let Flow::Interrupted = self.statement(reply, stmt, params) {
                return Flow::Interrupted;
            }
        }
        Flow::Continue
    }

    fn statement(&mut self, reply: &mut Reply, sql: &str, params: &HashMap<String, Value>) -> Flow {
        match self.try_statement(reply, sql, params) {
            Ok(flow) => flow,
            Err(msg) => {
                reply.error(&msg);
                Flow::Continue
            }
        }
    }

    fn try_statement(
        &mut self,
        reply: &mut Reply,
        sql: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Flow, ServerMessage> {
        let lower = sql.to_ascii_lowercase();
        if lower.starts_with("create procedure") {
            let as_at = lower.find(" as ").ok_or_else(|| syntax_error("as"))?;
            let name = sql[16..as_at].trim().to_ascii_lowercase();
            let mut body = sql[as_at + 4..].trim();
            if body.to_ascii_lowercase().starts_with("begin") {
                body = body[5..].trim();
                if body.to_ascii_lowercase().ends_with("end") {
                    body = body[..body.len() - 3].trim();
                }
            }
            self.state
                .lock()
                .unwrap()
                .procs
                .insert(name, body.to_string());
            reply.done(DoneStatus::empty(), None);
            return Ok(Flow::Continue);
        }

        let mut p = Parser::new(sql, params)?;
        if p.is_kw("select") {
            let select = Select::parse(&mut p)?;
            if select.is_slow() && self.sleep(CROSS_JOIN_DELAY) {
                return Ok(Self::interrupted(reply));
            }
            let query = select.eval(&self.state.lock().unwrap())?;
            reply.rows(&query);
            return Ok(Flow::Continue);
        }
        if p.eat_kw("waitfor") {
            p.expect_kw("delay")?;
            let Some(Lex::Str(spec)) = p.next() else {
                return Err(syntax_error("delay"));
            };
            let secs = spec
                .split(':')
                .map(|part| part.parse::<u64>().unwrap_or(0))
                .fold(0, |acc, part| acc * 60 + part);
            if self.sleep(Duration::from_secs(secs)) {
                return Ok(Self::interrupted(reply));
            }
            reply.done(DoneStatus::empty(), None);
            return Ok(Flow::Continue);
        }
        if p.eat_kw("exec") {
            let name = p.ident()?.to_ascii_lowercase();
            let body = self
                .state
                .lock()
                .unwrap()
                .procs
                .get(&name)
                .cloned()
                .ok_or_else(|| message(2812, 16, format!("Could not find stored procedure '{}'.", name)))?;
            let outer = reply.in_proc;
            reply.in_proc = true;
            let flow = self.batch(reply, &body, params);
            reply.in_proc = outer;
            if let Flow::Interrupted = flow {
                return Ok(flow);
            }
            write_return_status(&mut reply.out, 0);
            reply.done_proc();
            return Ok(Flow::Continue);
        }
        if p.eat_kw("print") {
            let text = p.value()?.to_string();
            write_info(&mut reply.out, &message(0, 0, text)).unwrap();
            return Ok(Flow::Continue);
        }
        if p.eat_kw("raiserror") {
            p.expect_punct('(')?;
            let text = p.value()?.to_string();
            p.expect_punct(',')?;
            let class = i32::from_value(&p.value()?).unwrap_or(16);
            return Err(message(50000, class as u8, text));
        }

        let mut state = self.state.lock().unwrap();
        if p.eat_kw("create") {
            p.expect_kw("table")?;
            let name = p.ident()?.to_ascii_lowercase();
            p.expect_punct('(')?;
            let mut table = Table {
                next_identity: 1,
                ..Table::default()
            };
            loop {
                let col = p.ident()?;
                let ty = p.ident()?.to_ascii_lowercase();
                let type_info = match ty.as_str() {
                    "int" => TypeInfo::int(),
                    "varchar" | "nvarchar" => {
                        p.expect_punct('(')?;
                        let ti = match p.next() {
                            Some(Lex::Num(n)) => TypeInfo::nvarchar(n.clamp(1, 4000) as u16),
                            _ => TypeInfo::nvarchar_max(),
                        };
                        p.expect_punct(')')?;
                        ti
                    }
                    other => return Err(message(2715, 16, format!("Cannot find data type {}.", other))),
                };
                let mut def = ColumnDef {
                    name: col,
                    type_info,
                    identity: false,
                    unique: false,
                };
                loop {
                    if p.eat_kw("identity") {
                        def.identity = true;
                    } else if p.eat_kw("unique") {
                        def.unique = true;
                    } else if p.eat_kw("primary") {
                        p.expect_kw("key")?;
                        def.unique = true;
                    } else {
                        break;
                    }
                }
                table.columns.push(def);
                if !p.eat_punct(',') {
                    break;
                }
            }
            p.expect_punct(')')?;
            if state.tables.contains_key(&name) {
                return Err(message(2714, 16, format!("There is already an object named '{}'.", name)));
            }
            state.tables.insert(name, table);
            reply.done(DoneStatus::empty(), None);
            return Ok(Flow::Continue);
        }
        if p.eat_kw("drop") {
            p.expect_kw("table")?;
            let name = p.ident()?.to_ascii_lowercase();
            state.tables.remove(&name);
            reply.done(DoneStatus::empty(), None);
            return Ok(Flow::Continue);
        }
        if p.eat_kw("insert") {
            p.expect_kw("into")?;
            let name = p.ident()?.to_ascii_lowercase();
            let mut named = None;
            if p.eat_punct('(') {
                let mut cols = Vec::new();
                loop {
                    cols.push(p.ident()?);
                    if !p.eat_punct(',') {
                        break;
                    }
                }
                p.expect_punct(')')?;
                named = Some(cols);
            }
            p.expect_kw("values")?;
            p.expect_punct('(')?;
            let mut values = Vec::new();
            loop {
                values.push(p.value()?);
                if !p.eat_punct(',') {
                    break;
                }
            }
            p.expect_punct(')')?;
            let table = table_mut(&mut state, &name)?;
            let assignments: Vec<(String, Value)> = match named {
                Some(cols) => cols.into_iter().zip(values).collect(),
                None => table
                    .columns
                    .iter()
                    .filter(|c| !c.identity)
                    .map(|c| c.name.clone())
                    .zip(values)
                    .collect(),
            };
            insert(table, &name, assignments)?;
            reply.done(DoneStatus::empty(), Some(1));
            return Ok(Flow::Continue);
        }
        if p.eat_kw("update") {
            let name = p.ident()?.to_ascii_lowercase();
            p.expect_kw("set")?;
            let mut sets = Vec::new();
            loop {
                let col = p.ident()?;
                p.expect_punct('=')?;
                sets.push((col, p.value()?));
                if !p.eat_punct(',') {
                    break;
                }
            }
            let filter = if p.eat_kw("where") {
                let col = p.ident()?;
                p.expect_punct('=')?;
                Some((col, p.value()?))
            } else {
                None
            };
            let table = table_mut(&mut state, &name)?;
            let filter = match filter {
                Some((col, v)) => Some((column_of(table, &col)?, v)),
                None => None,
            };
            let sets: Vec<(usize, Value)> = sets
                .into_iter()
                .map(|(col, v)| {
                    let i = column_of(table, &col)?;
                    Ok((i, coerce(v, &table.columns[i].type_info)))
                })
                .collect::<Result<_, ServerMessage>>()?;
            let mut count = 0;
            for row in table.rows.iter_mut().flatten() {
                if filter.as_ref().is_none_or(|(i, v)| same(&row[*i], v)) {
                    for (i, v) in &sets {
                        row[*i] = v.clone();
                    }
                    count += 1;
                }
            }
            reply.done(DoneStatus::empty(), Some(count));
            return Ok(Flow::Continue);
        }
        if p.eat_kw("delete") {
            p.eat_kw("from");
            let name = p.ident()?.to_ascii_lowercase();
            let filter = if p.eat_kw("where") {
                let col = p.ident()?;
                p.expect_punct('=')?;
                Some((col, p.value()?))
            } else {
                None
            };
            let table = table_mut(&mut state, &name)?;
            let filter = match filter {
                Some((col, v)) => Some((column_of(table, &col)?, v)),
                None => None,
            };
            let mut count = 0;
            for slot in table.rows.iter_mut() {
                let hit = slot
                    .as_ref()
                    .is_some_and(|row| filter.as_ref().is_none_or(|(i, v)| same(&row[*i], v)));
                if hit {
                    *slot = None;
                    count += 1;
                }
            }
            reply.done(DoneStatus::empty(), Some(count));
            return Ok(Flow::Continue);
        }
        Err(syntax_error(sql.split_whitespace().next().unwrap_or("")))
    }

    fn rpc(&mut self, reply: &mut Reply, rpc: DecodedRpc) {
        let name = match &rpc.target {
            RpcTarget::Id(id) => id.name().to_string(),
            RpcTarget::Name(name) => name.clone(),
        };
        self.log(name);
        let result = match rpc.proc_id() {
            Some(ProcId::ExecuteSql) => self.execute_sql(reply, &rpc.params),
            Some(ProcId::CursorOpen) => self.cursor_open(reply, &rpc.params),
            Some(ProcId::CursorFetch) => self.cursor_fetch(reply, &rpc.params),
            Some(ProcId::Cursor) => self.cursor_modify(&rpc.params),
            Some(ProcId::CursorClose) => self.cursor_close(&rpc.params),
            _ => Err(message(2812, 16, "Could not find stored procedure.")),
        };
        match result {
            Ok(Flow::Finished | Flow::Interrupted) => return,
            Ok(Flow::Continue) => write_return_status(&mut reply.out, 0),
            Err(msg) => {
                write_error(&mut reply.out, &msg).unwrap();
                write_return_status(&mut reply.out, 1);
            }
        }
        reply.done_proc();
    }

    fn execute_sql(&mut self, reply: &mut Reply, params: &[ParamDescriptor]) -> Result<Flow, ServerMessage> {
        let sql = text_arg(params, 0)?;
        self.log(format!("executesql: {}", sql));
        let bound = bind(&params[2.min(params.len())..]);
        Ok(self.batch(reply, &sql, &bound))
    }

    fn cursor_open(&mut self, reply: &mut Reply, params: &[ParamDescriptor]) -> Result<Flow, ServerMessage> {
        let stmt = text_arg(params, 1)?;
        let scroll_opt = int_arg(params, 2)?;
        let cc_opt = int_arg(params, 3)?;
        let bound = bind(&params[6.min(params.len())..]);
        self.log(format!("cursoropen: {}", stmt));

        let lower = stmt.to_ascii_lowercase();
        let select_text = if let Some(rest) = lower.strip_prefix("exec ") {
            let name = rest.split_whitespace().next().unwrap_or("");
            let body = self
                .state
                .lock()
                .unwrap()
                .procs
                .get(name)
                .cloned()
                .ok_or_else(|| message(2812, 16, format!("Could not find stored procedure '{}'.", name)))?;
            let parts: Vec<&str> = body.split(';').map(str::trim).filter(|s| !s.is_empty()).collect();
            if parts.len() != 1 {
                return Err(message(
                    16937,
                    16,
                    "A server cursor is not allowed on a stored procedure with more than one statement.",
                ));
            }
            parts[0].to_string()
        } else {
            stmt.clone()
        };
        if !select_text.trim_start().to_ascii_lowercase().starts_with("select") {
            return Err(message(16954, 16, "Executing SQL directly; no cursor."));
        }

        let mut p = Parser::new(&select_text, &bound)?;
        let select = Select::parse(&mut p)?;
        if select.compute.is_some() {
            return Err(message(16955, 16, "Could not create a cursor over a COMPUTE clause."));
        }
        if select.is_slow() && self.sleep(CROSS_JOIN_DELAY) {
            return Ok(Self::interrupted(reply));
        }

        let mut state = self.state.lock().unwrap();
        let query = select.eval(&state)?;
        let requested = (scroll_opt & !ScrollMode::PARAMETERIZED_STMT, cc_opt);
        let (scroll, cc) = state
            .grants
            .iter()
            .find(|(req, _)| *req == requested)
            .map(|(_, granted)| *granted)
            .unwrap_or(requested);

        state.next_handle += 1;
        let handle = 180_150_000 + state.next_handle;
        let cursor = ServerCursor {
            columns: query.columns,
            rows: query
                .rows
                .into_iter()
                .zip(query.keys)
                .map(|(values, key)| CursorRow {
                    values,
                    status: RowStatus::Success,
                    key,
                })
                .collect(),
            table: query.table,
            pos: 0,
            concurrency: cc,
        };
        write_colmetadata(&mut reply.out, &cursor.wire_columns()).unwrap();
        reply.in_proc = true;
        reply.done(DoneStatus::empty(), None);
        reply.in_proc = false;
        let row_count = cursor.len();
        state.cursors.insert(handle, cursor);
        drop(state);

        write_return_status(&mut reply.out, 0);
        reply.return_value(0, handle);
        reply.return_value(2, scroll | (scroll_opt & ScrollMode::PARAMETERIZED_STMT));
        reply.return_value(3, cc);
        reply.return_value(4, row_count);
        reply.done_proc();
        Ok(Flow::Finished)
    }

    fn cursor_fetch(&mut self, reply: &mut Reply, params: &[ParamDescriptor]) -> Result<Flow, ServerMessage> {
        let handle = int_arg(params, 0)?;
        let code = int_arg(params, 1)?;
        let row_num = int_arg(params, 2).unwrap_or(0);
        let fetch = FetchType::from_code(code, row_num)
            .ok_or_else(|| message(16902, 16, format!("Invalid fetch type {}.", code)))?;

        let mut state = self.state.lock().unwrap();
        let cursor = state.cursors.get_mut(&handle).ok_or_else(not_declared)?;
        let len = cursor.len();
        let target = match fetch {
            FetchType::Info => {
                let (pos, count) = (cursor.pos, len);
                drop(state);
                write_return_status(&mut reply.out, 0);
                reply.return_value(2, pos);
                reply.return_value(3, count);
                reply.done_proc();
                return Ok(Flow::Finished);
            }
            FetchType::First => 1,
            FetchType::Next => cursor.pos + 1,
            FetchType::Previous => cursor.pos - 1,
            FetchType::Last => len,
            FetchType::Absolute(n) if n < 0 => len + n + 1,
            FetchType::Absolute(n) => n,
            FetchType::Relative(n) => cursor.pos + n,
            FetchType::Repeat => cursor.pos,
        };
        let columns = cursor.wire_columns();
        let row = cursor.move_to(target).map(|i| {
            let row = &cursor.rows[i];
            let mut values = row.values.clone();
            values.push(Value::Int(row.status as i32));
            values
        });
        drop(state);

        write_colmetadata(&mut reply.out, &columns).unwrap();
        if let Some(values) = &row {
            write_row(&mut reply.out, &columns, values).unwrap();
        }
        reply.in_proc = true;
        reply.done(DoneStatus::empty(), Some(u64::from(row.is_some())));
        reply.in_proc = false;
        Ok(Flow::Continue)
    }

    fn cursor_modify(&mut self, params: &[ParamDescriptor]) -> Result<Flow, ServerMessage> {
        let handle = int_arg(params, 0)?;
        let op = int_arg(params, 1)?;
        let mut state = self.state.lock().unwrap();
        let ServerState {
            cursors, tables, ..
        } = &mut *state;
        let cursor = cursors.get_mut(&handle).ok_or_else(not_declared)?;
        if cursor.concurrency == 1 {
            return Err(message(16929, 16, "The cursor is READ ONLY."));
        }
        let assignments: Vec<(String, Value)> = params
            .iter()
            .skip(4)
            .map(|p| (p.name.trim_start_matches('@').to_string(), p.value.clone()))
            .collect();
        let current = (cursor.pos >= 1 && cursor.pos <= cursor.len()).then(|| (cursor.pos - 1) as usize);

        if op == CursorOp::Insert as i32 {
            let name = cursor.table.clone().ok_or_else(|| message(16933, 16, "The cursor does not include the table being modified."))?;
            let table = tables.get_mut(&name).ok_or_else(|| message(208, 16, "Invalid object name."))?;
            let key = insert(table, &name, assignments)?;
            let values = table.rows[key].clone().unwrap_or_default();
            cursor.rows.push(CursorRow {
                values,
                status: RowStatus::Added,
                key: Some(key),
            });
            return Ok(Flow::Continue);
        }

        let i = current.ok_or_else(|| message(16931, 16, "There are no rows in the current fetch buffer."))?;
        let row = &mut cursor.rows[i];
        let mut base = match (&cursor.table, row.key) {
            (Some(name), Some(key)) => tables
                .get_mut(name)
                .and_then(|t| t.rows.get_mut(key)),
            _ => None,
        };
        if op == CursorOp::Delete as i32 {
            if let Some(slot) = base {
                *slot = None;
            }
            row.status = RowStatus::Deleted;
        } else if op == CursorOp::Update as i32 {
            for (col, value) in assignments {
                let c = cursor
                    .columns
                    .iter()
                    .position(|d| d.name.eq_ignore_ascii_case(&col))
                    .ok_or_else(|| message(207, 16, format!("Invalid column name '{}'.", col)))?;
                let value = coerce(value, &cursor.columns[c].type_info);
                row.values[c] = value.clone();
                if let Some(Some(base_row)) = base.as_deref_mut() {
                    base_row[c] = value;
                }
            }
            row.status = RowStatus::Updated;
        } else {
            return Err(message(16932, 16, format!("Invalid cursor operation {}.", op)));
        }
        Ok(Flow::Continue)
    }

    fn cursor_close(&mut self, params: &[ParamDescriptor]) -> Result<Flow, ServerMessage> {
        let handle = int_arg(params, 0)?;
        self.state
            .lock()
            .unwrap()
            .cursors
            .remove(&handle)
            .map(|_| Flow::Continue)
            .ok_or_else(not_declared)
    }
}

fn not_declared() -> ServerMessage {
    message(16945, 16, "The cursor was not declared.")
}

fn table_mut<'a>(state: &'a mut ServerState, name: &str) -> Result<&'a mut Table, ServerMessage> {
    state
        .tables
        .get_mut(name)
        .ok_or_else(|| message(208, 16, format!("Invalid object name '{}'.", name)))
}

fn column_of(table: &Table, name: &str) -> Result<usize, ServerMessage> {
    table
        .column(name)
        .ok_or_else(|| message(207, 16, format!("Invalid column name '{}'.", name)))
}

/// Append a row; returns its index in the table
fn insert(table: &mut Table, name: &str, assignments: Vec<(String, Value)>) -> Result<usize, ServerMessage> {
    let mut row = vec![Value::Null; table.columns.len()];
    for (col, value) in assignments {
        let i = column_of(table, &col)?;
        if table.columns[i].identity {
            return Err(message(
                544,
                16,
                format!("Cannot insert explicit value for identity column in table '{}'.", name),
            ));
        }
        row[i] = coerce(value, &table.columns[i].type_info);
    }
    for (i, col) in table.columns.iter().enumerate() {
        if col.identity {
            row[i] = Value::Int(table.next_identity);
        }
        if col.unique
            && table
                .rows
                .iter()
                .flatten()
                .any(|existing| same(&existing[i], &row[i]))
        {
            return Err(message(
                2627,
                14,
                format!("Violation of UNIQUE KEY constraint. Cannot insert duplicate key in object '{}'.", name),
            ));
        }
    }
    if table.columns.iter().any(|c| c.identity) {
        table.next_identity += 1;
    }
    table.rows.push(Some(row));
    Ok(table.rows.len() - 1)
}

fn text_arg(params: &[ParamDescriptor], i: usize) -> Result<String, ServerMessage> {
    params
        .get(i)
        .and_then(|p| String::from_value(&p.value).ok())
        .ok_or_else(|| message(201, 16, format!("Parameter {} missing.", i)))
}

fn int_arg(params: &[ParamDescriptor], i: usize) -> Result<i32, ServerMessage> {
    params
        .get(i)
        .and_then(|p| i32::from_value(&p.value).ok())
        .ok_or_else(|| message(201, 16, format!("Parameter {} missing.", i)))
}

/// Map argument values to the placeholder names they bind
fn bind(args: &[ParamDescriptor]) -> HashMap<String, Value> {
    args.iter()
        .enumerate()
        .map(|(i, p)| {
            let name = if p.name.is_empty() {
                format!("@p{}", i)
            } else {
                p.name.to_ascii_lowercase()
            };
            (name, p.value.clone())
        })
        .collect()
}
