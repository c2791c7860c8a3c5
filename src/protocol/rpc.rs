use crate::constant::{ParamStatus, ProcId};
use crate::error::{Error, Result};
use crate::param::{Direction, ParamDescriptor};
use crate::protocol::primitive::*;
use crate::protocol::type_info::TypeInfo;

/// NameLenProcID value announcing a well-known procedure id
const PROC_ID_SWITCH: u16 = 0xFFFF;
const ALL_HEADERS_LEN: u32 = 22;
const TRANSACTION_HEADER_LEN: u32 = 18;
const TRANSACTION_HEADER_TYPE: u16 = 0x0002;

/// Target procedure of an RPC request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcTarget {
    Id(ProcId),
    Name(String),
}

/// An RPC request as seen by the receiving side
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRpc {
    pub target: RpcTarget,
    pub options: u16,
    pub params: Vec<ParamDescriptor>,
}

impl DecodedRpc {
    pub fn proc_id(&self) -> Option<ProcId> {
        match self.target {
            RpcTarget::Id(id) => Some(id),
            RpcTarget::Name(_) => None,
        }
    }
}

/// ALL_HEADERS with a single transaction descriptor header (auto-commit)
pub fn write_all_headers(out: &mut Vec<u8>) {
    write_int_4(out, ALL_HEADERS_LEN);
    write_int_4(out, TRANSACTION_HEADER_LEN);
    write_int_2(out, TRANSACTION_HEADER_TYPE);
    write_int_8(out, 0);
    write_int_4(out, 1);
}

fn skip_all_headers(r: &mut &[u8]) -> Result<()> {
    let total = r.read_int_4()? as usize;
    let rest = total.checked_sub(4).ok_or(Error::InvalidPacket)?;
    r.skip(rest)
}

/// Encode an RPC request payload
pub fn write_rpc(out: &mut Vec<u8>, proc_id: ProcId, params: &[ParamDescriptor]) -> Result<()> {
    write_all_headers(out);
    write_int_2(out, PROC_ID_SWITCH);
    write_int_2(out, proc_id as u16);
    write_int_2(out, 0);
    for param in params {
        write_b_varchar(out, &param.name)?;
        write_int_1(out, param.status().bits());
        param.type_info.write(out);
        param.type_info.write_value(out, &param.value)?;
    }
    Ok(())
}

/// Encode a SQL batch payload
pub fn write_sql_batch(out: &mut Vec<u8>, sql: &str) {
    write_all_headers(out);
    write_ucs2(out, sql);
}

pub fn read_rpc(payload: &[u8]) -> Result<DecodedRpc> {
    let mut r = payload;
    skip_all_headers(&mut r)?;
    let name_len = r.read_int_2()?;
    let target = if name_len == PROC_ID_SWITCH {
        let id = r.read_int_2()?;
        RpcTarget::Id(ProcId::from_u16(id).ok_or(Error::InvalidPacket)?)
    } else {
        RpcTarget::Name(r.read_ucs2(name_len as usize)?)
    };
    let options = r.read_int_2()?;
    let mut params = Vec::new();
    let mut scratch = Vec::new();
    while !r.is_empty() {
        let name = r.read_b_varchar()?;
        let status = ParamStatus::from_bits_retain(r.read_int_1()?);
        let type_info = TypeInfo::read(&mut r)?;
        let value = type_info.read_value(&mut r, &mut scratch)?;
        params.push(ParamDescriptor {
            name,
            type_info,
            value,
            direction: if status.contains(ParamStatus::BY_REF_VALUE) {
                Direction::Out
            } else {
                Direction::In
            },
        });
    }
    Ok(DecodedRpc {
        target,
        options,
        params,
    })
}

pub fn read_sql_batch(payload: &[u8]) -> Result<String> {
    let mut r = payload;
    skip_all_headers(&mut r)?;
    decode_ucs2(r)
}
