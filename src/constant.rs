/// TDS packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    SqlBatch = 0x01,
    Rpc = 0x03,
    TabularResult = 0x04,
    Attention = 0x06,
    BulkLoad = 0x07,
    TransactionManager = 0x0E,
    Login7 = 0x10,
    PreLogin = 0x12,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::SqlBatch),
            0x03 => Some(Self::Rpc),
            0x04 => Some(Self::TabularResult),
            0x06 => Some(Self::Attention),
            0x07 => Some(Self::BulkLoad),
            0x0E => Some(Self::TransactionManager),
            0x10 => Some(Self::Login7),
            0x12 => Some(Self::PreLogin),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Status byte of a packet header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketStatus: u8 {
        const END_OF_MESSAGE = 0x01;
        const IGNORE = 0x02;
        const RESET_CONNECTION = 0x08;
    }
}

/// Token types of a tabular result stream
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    ReturnStatus = 0x79,
    ColMetadata = 0x81,
    AltMetadata = 0x88,
    TabName = 0xA4,
    ColInfo = 0xA5,
    Order = 0xA9,
    Error = 0xAA,
    Info = 0xAB,
    ReturnValue = 0xAC,
    LoginAck = 0xAD,
    Row = 0xD1,
    AltRow = 0xD3,
    EnvChange = 0xE3,
    Sspi = 0xED,
    Done = 0xFD,
    DoneProc = 0xFE,
    DoneInProc = 0xFF,
}

impl TokenType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x79 => Some(Self::ReturnStatus),
            0x81 => Some(Self::ColMetadata),
            0x88 => Some(Self::AltMetadata),
            0xA4 => Some(Self::TabName),
            0xA5 => Some(Self::ColInfo),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAC => Some(Self::ReturnValue),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xD3 => Some(Self::AltRow),
            0xE3 => Some(Self::EnvChange),
            0xED => Some(Self::Sspi),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }

    /// Tokens carrying a 2-byte length prefix that the decoder skips
    pub fn is_skippable(self) -> bool {
        matches!(
            self,
            Self::TabName | Self::ColInfo | Self::Order | Self::LoginAck | Self::EnvChange | Self::Sspi
        )
    }
}

bitflags::bitflags! {
    /// Status word of DONE, DONEPROC and DONEINPROC
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoneStatus: u16 {
        const MORE = 0x0001;
        const ERROR = 0x0002;
        const IN_XACT = 0x0004;
        const COUNT = 0x0010;
        const ATTN = 0x0020;
        const SRV_ERROR = 0x0100;
    }
}

bitflags::bitflags! {
    /// Column flags of COLMETADATA
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ColumnFlags: u16 {
        const NULLABLE = 0x0001;
        const CASE_SENSITIVE = 0x0002;
        const UPDATEABLE = 0x0004;
        const UPDATEABLE_UNKNOWN = 0x0008;
        const IDENTITY = 0x0010;
        const COMPUTED = 0x0020;
        const FIXED_LEN_CLR_TYPE = 0x0100;
        const HIDDEN = 0x2000;
        const KEY = 0x4000;
        const NULLABLE_UNKNOWN = 0x8000;
    }
}

bitflags::bitflags! {
    /// Status byte of an RPC parameter or RETURNVALUE token
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParamStatus: u8 {
        const BY_REF_VALUE = 0x01;
        const DEFAULT_VALUE = 0x02;
    }
}

/// Wire type tags of TYPE_INFO
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Null = 0x1F,
    Int1 = 0x30,
    Bit = 0x32,
    Int2 = 0x34,
    Int4 = 0x38,
    Flt4 = 0x3B,
    Flt8 = 0x3E,
    Int8 = 0x7F,
    IntN = 0x26,
    BitN = 0x68,
    FltN = 0x6D,
    BigVarBinary = 0xA5,
    BigVarChar = 0xA7,
    NVarChar = 0xE7,
}

impl DataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1F => Some(Self::Null),
            0x30 => Some(Self::Int1),
            0x32 => Some(Self::Bit),
            0x34 => Some(Self::Int2),
            0x38 => Some(Self::Int4),
            0x3B => Some(Self::Flt4),
            0x3E => Some(Self::Flt8),
            0x7F => Some(Self::Int8),
            0x26 => Some(Self::IntN),
            0x68 => Some(Self::BitN),
            0x6D => Some(Self::FltN),
            0xA5 => Some(Self::BigVarBinary),
            0xA7 => Some(Self::BigVarChar),
            0xE7 => Some(Self::NVarChar),
            _ => None,
        }
    }

    /// Byte width of a fixed-length type, `None` for variable-length types
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 | Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Flt4 => Some(4),
            Self::Int8 | Self::Flt8 => Some(8),
            _ => None,
        }
    }
}

/// Well-known stored procedure ids usable with the `0xFFFF` ProcIDSwitch
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcId {
    Cursor = 1,
    CursorOpen = 2,
    CursorPrepare = 3,
    CursorExecute = 4,
    CursorPrepExec = 5,
    CursorUnprepare = 6,
    CursorFetch = 7,
    CursorOption = 8,
    CursorClose = 9,
    ExecuteSql = 10,
    Prepare = 11,
    Execute = 12,
    PrepExec = 13,
    PrepExecRpc = 14,
    Unprepare = 15,
}

impl ProcId {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Cursor),
            2 => Some(Self::CursorOpen),
            3 => Some(Self::CursorPrepare),
            4 => Some(Self::CursorExecute),
            5 => Some(Self::CursorPrepExec),
            6 => Some(Self::CursorUnprepare),
            7 => Some(Self::CursorFetch),
            8 => Some(Self::CursorOption),
            9 => Some(Self::CursorClose),
            10 => Some(Self::ExecuteSql),
            11 => Some(Self::Prepare),
            12 => Some(Self::Execute),
            13 => Some(Self::PrepExec),
            14 => Some(Self::PrepExecRpc),
            15 => Some(Self::Unprepare),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cursor => "sp_cursor",
            Self::CursorOpen => "sp_cursoropen",
            Self::CursorPrepare => "sp_cursorprepare",
            Self::CursorExecute => "sp_cursorexecute",
            Self::CursorPrepExec => "sp_cursorprepexec",
            Self::CursorUnprepare => "sp_cursorunprepare",
            Self::CursorFetch => "sp_cursorfetch",
            Self::CursorOption => "sp_cursoroption",
            Self::CursorClose => "sp_cursorclose",
            Self::ExecuteSql => "sp_executesql",
            Self::Prepare => "sp_prepare",
            Self::Execute => "sp_execute",
            Self::PrepExec => "sp_prepexec",
            Self::PrepExecRpc => "sp_prepexecrpc",
            Self::Unprepare => "sp_unprepare",
        }
    }
}

/// Fetch request of `sp_cursorfetch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchType {
    First,
    Next,
    Previous,
    Last,
    Absolute(i32),
    Relative(i32),
    Repeat,
    Info,
}

impl FetchType {
    pub const FIRST: i32 = 1;
    pub const NEXT: i32 = 2;
    pub const PREVIOUS: i32 = 4;
    pub const LAST: i32 = 8;
    pub const ABSOLUTE: i32 = 16;
    pub const RELATIVE: i32 = 32;
    pub const REPEAT: i32 = 128;
    pub const INFO: i32 = 256;

    pub fn code(self) -> i32 {
        match self {
            Self::First => Self::FIRST,
            Self::Next => Self::NEXT,
            Self::Previous => Self::PREVIOUS,
            Self::Last => Self::LAST,
            Self::Absolute(_) => Self::ABSOLUTE,
            Self::Relative(_) => Self::RELATIVE,
            Self::Repeat => Self::REPEAT,
            Self::Info => Self::INFO,
        }
    }

    /// The `rownum` argument; absolute and relative carry their offset, the rest send 1
    pub fn row_num(self) -> i32 {
        match self {
            Self::Absolute(n) | Self::Relative(n) => n,
            _ => 1,
        }
    }

    pub fn from_code(code: i32, row_num: i32) -> Option<Self> {
        match code {
            Self::FIRST => Some(Self::First),
            Self::NEXT => Some(Self::Next),
            Self::PREVIOUS => Some(Self::Previous),
            Self::LAST => Some(Self::Last),
            Self::ABSOLUTE => Some(Self::Absolute(row_num)),
            Self::RELATIVE => Some(Self::Relative(row_num)),
            Self::REPEAT => Some(Self::Repeat),
            Self::INFO => Some(Self::Info),
            _ => None,
        }
    }
}

/// Cursor scroll option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    Keyset,
    Dynamic,
    Forward,
    Static,
}

impl ScrollMode {
    pub const KEYSET: i32 = 0x0001;
    pub const DYNAMIC: i32 = 0x0002;
    pub const FORWARD: i32 = 0x0004;
    pub const STATIC: i32 = 0x0008;
    pub const FAST_FORWARD: i32 = 0x0010;
    /// Added to the requested option when the statement text is parameterized
    pub const PARAMETERIZED_STMT: i32 = 0x1000;

    pub fn code(self) -> i32 {
        match self {
            Self::Keyset => Self::KEYSET,
            Self::Dynamic => Self::DYNAMIC,
            Self::Forward => Self::FORWARD,
            Self::Static => Self::STATIC,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code & !Self::PARAMETERIZED_STMT {
            Self::KEYSET => Some(Self::Keyset),
            Self::DYNAMIC => Some(Self::Dynamic),
            Self::FORWARD | Self::FAST_FORWARD => Some(Self::Forward),
            Self::STATIC => Some(Self::Static),
            _ => None,
        }
    }

    pub fn is_scrollable(self) -> bool {
        self != Self::Forward
    }
}

/// Cursor concurrency option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    ReadOnly,
    ScrollLocks,
    Optimistic,
}

impl Concurrency {
    pub const READ_ONLY: i32 = 1;
    pub const SCROLL_LOCKS: i32 = 2;
    pub const OPTIMISTIC: i32 = 4;
    pub const OPTIMISTIC_VALUES: i32 = 8;

    pub fn code(self) -> i32 {
        match self {
            Self::ReadOnly => Self::READ_ONLY,
            Self::ScrollLocks => Self::SCROLL_LOCKS,
            Self::Optimistic => Self::OPTIMISTIC,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            Self::READ_ONLY => Some(Self::ReadOnly),
            Self::SCROLL_LOCKS => Some(Self::ScrollLocks),
            Self::OPTIMISTIC | Self::OPTIMISTIC_VALUES => Some(Self::Optimistic),
            _ => None,
        }
    }

    pub fn is_updatable(self) -> bool {
        self != Self::ReadOnly
    }
}

/// `optype` of `sp_cursor`
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    Insert = 4,
    Update = 33,
    Delete = 34,
}

/// Value of the trailing ROWSTAT column
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Success = 1,
    Deleted = 2,
    Updated = 3,
    NoRow = 4,
    Added = 5,
    Error = 6,
}

impl RowStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Success),
            2 => Some(Self::Deleted),
            3 => Some(Self::Updated),
            4 => Some(Self::NoRow),
            5 => Some(Self::Added),
            6 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Cursor position before the first row
pub const POS_BEFORE_FIRST: i32 = 0;
/// Cursor position after the last row
pub const POS_AFTER_LAST: i32 = -1;

/// Name of the hidden row status column appended to server cursor rows
pub const ROW_STATUS_COLUMN: &str = "ROWSTAT";
