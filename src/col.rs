use std::sync::Arc;

use crate::constant::{ColumnFlags, DataType};
use crate::protocol::type_info::{Collation, TypeInfo};

/// Immutable column set shared by every row of a result
pub type Columns = Arc<[ColumnDescriptor]>;

/// Aggregate operator of a compute column (ALTMETADATA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub op: u8,
    /// 1-based index of the aggregated column in the owning row set
    pub operand: u16,
}

impl Aggregate {
    pub const STDEV: u8 = 0x30;
    pub const STDEVP: u8 = 0x31;
    pub const VAR: u8 = 0x32;
    pub const VARP: u8 = 0x33;
    pub const COUNT: u8 = 0x09;
    pub const SUM: u8 = 0x4D;
    pub const AVG: u8 = 0x4F;
    pub const MIN: u8 = 0x51;
    pub const MAX: u8 = 0x52;

    pub fn name(&self) -> &'static str {
        match self.op {
            Self::STDEV => "stdev",
            Self::STDEVP => "stdevp",
            Self::VAR => "var",
            Self::VARP => "varp",
            Self::COUNT => "count",
            Self::SUM => "sum",
            Self::AVG => "avg",
            Self::MIN => "min",
            Self::MAX => "max",
            _ => "aggregate",
        }
    }
}

/// Column metadata captured from COLMETADATA or ALTMETADATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_info: TypeInfo,
    pub flags: ColumnFlags,
    pub user_type: u32,
    pub aggregate: Option<Aggregate>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_info: TypeInfo, flags: ColumnFlags) -> Self {
        Self {
            name: name.into(),
            type_info,
            flags,
            user_type: 0,
            aggregate: None,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.type_info.data_type()
    }

    /// Declared length in bytes, `None` for `max` types
    pub fn declared_len(&self) -> Option<usize> {
        self.type_info.declared_len()
    }

    /// No decimal types are decoded, so scale is always zero
    pub fn scale(&self) -> u8 {
        0
    }

    pub fn collation(&self) -> Option<Collation> {
        self.type_info.collation()
    }

    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }

    /// Read/write or unknown updatability both count as writable
    pub fn is_writable(&self) -> bool {
        self.flags
            .intersects(ColumnFlags::UPDATEABLE | ColumnFlags::UPDATEABLE_UNKNOWN)
    }

    pub fn is_identity(&self) -> bool {
        self.flags.contains(ColumnFlags::IDENTITY)
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(ColumnFlags::HIDDEN)
    }
}

/// Number of columns visible to callers (hidden columns trail the visible ones)
pub fn visible_count(columns: &[ColumnDescriptor]) -> usize {
    columns.iter().filter(|c| !c.is_hidden()).count()
}
