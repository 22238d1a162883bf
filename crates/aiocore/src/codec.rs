//! Wire encoding for requests and sub-operation output
//!
//! # Frame layout
//!
//! ```text
//! +--------+----------+----------+-------------+------+--------------+
//! | "RAIO" | struct_v | compat_v | body_len    | body | crc32c(body) |
//! | 4      | u8       | u8       | u32 LE      | ...  | u32 LE       |
//! +--------+----------+----------+-------------+------+--------------+
//! ```
//!
//! All integers are little-endian. Strings and blobs are `u32 len + bytes`,
//! sequences are `u32 count + items`, maps are `u32 count + (key, value)`
//! pairs in key order, options are a `u8` presence marker followed by the
//! value.
//!
//! The request body is
//! `tid u64, address, kind u8, flags u32, op_flags u32, mtime Option<(u64, u32)>, ops Vec<SubOp>`
//! where each sub-operation is its `u16` opcode followed by its fields.
//!
//! A decoder accepts any frame whose `compat_v` it understands. Newer
//! encoders may append fields to the body; older decoders skip them.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{AioError, Result};
use crate::operation::SubOp;
use crate::types::{
    AllocHintFlags, ChecksumKind, CompareOp, ObjectAddress, OpCode, OpFlags, OperationFlags,
    OperationKind, PoolId, SnapId, UTime,
};

/// Frame magic
pub const MAGIC: [u8; 4] = *b"RAIO";
/// Encoding version written by this codec
pub const STRUCT_V: u8 = 1;
/// Oldest decoder version able to read what this codec writes
pub const COMPAT_V: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 1 + 4;
const TRAILER_LEN: usize = 4;

/// Encode/decode for wire values
pub trait Denc: Sized {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()>;
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

fn need<B: Buf>(buf: &B, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(AioError::Decoding(format!(
            "Insufficient bytes: need {} for {}, have {}",
            n,
            what,
            buf.remaining()
        )));
    }
    Ok(())
}

fn encode_len<B: BufMut>(len: usize, buf: &mut B) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| AioError::Encoding(format!("length {} exceeds u32", len)))?;
    buf.put_u32_le(len);
    Ok(())
}

// ============= Primitive Type Implementations =============

macro_rules! impl_denc_int {
    ($type:ty, $put_method:ident, $get_method:ident, $size:expr) => {
        impl Denc for $type {
            fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
                buf.$put_method(*self);
                Ok(())
            }

            fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
                need(buf, $size, stringify!($type))?;
                Ok(buf.$get_method())
            }
        }
    };
}

impl_denc_int!(u8, put_u8, get_u8, 1);
impl_denc_int!(u16, put_u16_le, get_u16_le, 2);
impl_denc_int!(u32, put_u32_le, get_u32_le, 4);
impl_denc_int!(u64, put_u64_le, get_u64_le, 8);
impl_denc_int!(i32, put_i32_le, get_i32_le, 4);

impl Denc for bool {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(u8::from(*self));
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(u8::decode(buf)? != 0)
    }
}

impl Denc for Bytes {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_len(self.len(), buf)?;
        buf.put_slice(self);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let len = u32::decode(buf)? as usize;
        need(buf, len, "blob")?;
        Ok(buf.copy_to_bytes(len))
    }
}

impl Denc for String {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_len(self.len(), buf)?;
        buf.put_slice(self.as_bytes());
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let raw = Bytes::decode(buf)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| AioError::Decoding(format!("Invalid UTF-8 in string: {}", e)))
    }
}

impl<T: Denc> Denc for Vec<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_len(self.len(), buf)?;
        for item in self {
            item.encode(buf)?;
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = u32::decode(buf)? as usize;
        // every element takes at least one byte
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<K: Denc + Ord, V: Denc> Denc for BTreeMap<K, V> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_len(self.len(), buf)?;
        for (k, v) in self {
            k.encode(buf)?;
            v.encode(buf)?;
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = u32::decode(buf)? as usize;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let k = K::decode(buf)?;
            let v = V::decode(buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<T: Denc> Denc for Option<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Some(v) => {
                buf.put_u8(1);
                v.encode(buf)
            }
            None => {
                buf.put_u8(0);
                Ok(())
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        match u8::decode(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            other => Err(AioError::Decoding(format!(
                "Invalid option marker {}",
                other
            ))),
        }
    }
}

// ============= Domain types =============

impl Denc for UTime {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.sec.encode(buf)?;
        self.nsec.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(UTime::new(u64::decode(buf)?, u32::decode(buf)?))
    }
}

impl Denc for ObjectAddress {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.pool.0.encode(buf)?;
        self.namespace.encode(buf)?;
        self.locator_key.encode(buf)?;
        self.oid.encode(buf)?;
        self.snap.0.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(ObjectAddress {
            pool: PoolId(u64::decode(buf)?),
            namespace: String::decode(buf)?,
            locator_key: Option::<String>::decode(buf)?,
            oid: String::decode(buf)?,
            snap: SnapId(u64::decode(buf)?),
        })
    }
}

impl Denc for CompareOp {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        (*self as u8).encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let raw = u8::decode(buf)?;
        CompareOp::from_u8(raw)
            .ok_or_else(|| AioError::Decoding(format!("Unknown comparison operator {}", raw)))
    }
}

impl Denc for ChecksumKind {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        (*self as u8).encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let raw = u8::decode(buf)?;
        ChecksumKind::from_u8(raw)
            .ok_or_else(|| AioError::Decoding(format!("Unknown checksum type {}", raw)))
    }
}

impl Denc for SubOp {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.opcode().as_u16().encode(buf)?;
        match self {
            SubOp::AssertExists
            | SubOp::Remove
            | SubOp::OmapClear
            | SubOp::Stat
            | SubOp::GetXattrs => Ok(()),
            SubOp::AssertVersion(v) => v.encode(buf),
            SubOp::CompareExtent { offset, data } | SubOp::Write { offset, data } => {
                offset.encode(buf)?;
                data.encode(buf)
            }
            SubOp::CompareXattr { name, op, value } => {
                name.encode(buf)?;
                op.encode(buf)?;
                value.encode(buf)
            }
            SubOp::CompareOmapEntry { key, op, value } => {
                key.encode(buf)?;
                op.encode(buf)?;
                value.encode(buf)
            }
            SubOp::Exec {
                class,
                method,
                input,
            } => {
                class.encode(buf)?;
                method.encode(buf)?;
                input.encode(buf)
            }
            SubOp::Create { exclusive } => exclusive.encode(buf),
            SubOp::WriteFull(data) | SubOp::Append(data) => data.encode(buf),
            SubOp::WriteSame {
                offset,
                write_len,
                data,
            } => {
                offset.encode(buf)?;
                write_len.encode(buf)?;
                data.encode(buf)
            }
            SubOp::Truncate(size) => size.encode(buf),
            SubOp::Zero { offset, len } | SubOp::Read { offset, len } => {
                offset.encode(buf)?;
                len.encode(buf)
            }
            SubOp::SetXattr { name, value } => {
                name.encode(buf)?;
                value.encode(buf)
            }
            SubOp::RemoveXattr(name) | SubOp::GetXattr(name) => name.encode(buf),
            SubOp::OmapSet(map) => map.encode(buf),
            SubOp::OmapRemoveKeys(keys) | SubOp::OmapGetValsByKeys(keys) => keys.encode(buf),
            SubOp::OmapRemoveRange { start, end } => {
                start.encode(buf)?;
                end.encode(buf)
            }
            SubOp::SetAllocHint {
                expected_object_size,
                expected_write_size,
                flags,
            } => {
                expected_object_size.encode(buf)?;
                expected_write_size.encode(buf)?;
                flags.bits().encode(buf)
            }
            SubOp::OmapGetVals {
                start_after,
                prefix,
                max,
            } => {
                start_after.encode(buf)?;
                prefix.encode(buf)?;
                max.encode(buf)
            }
            SubOp::OmapGetKeys { start_after, max } => {
                start_after.encode(buf)?;
                max.encode(buf)
            }
            SubOp::Checksum {
                kind,
                init,
                offset,
                len,
                chunk_size,
            } => {
                kind.encode(buf)?;
                init.encode(buf)?;
                offset.encode(buf)?;
                len.encode(buf)?;
                chunk_size.encode(buf)
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let raw = u16::decode(buf)?;
        let opcode = OpCode::from_u16(raw)
            .ok_or_else(|| AioError::Decoding(format!("Unknown opcode 0x{:04x}", raw)))?;
        let op = match opcode {
            OpCode::AssertExists => SubOp::AssertExists,
            OpCode::AssertVersion => SubOp::AssertVersion(u64::decode(buf)?),
            OpCode::CmpExt => SubOp::CompareExtent {
                offset: u64::decode(buf)?,
                data: Bytes::decode(buf)?,
            },
            OpCode::CmpXattr => SubOp::CompareXattr {
                name: String::decode(buf)?,
                op: CompareOp::decode(buf)?,
                value: Bytes::decode(buf)?,
            },
            OpCode::OmapCmp => SubOp::CompareOmapEntry {
                key: String::decode(buf)?,
                op: CompareOp::decode(buf)?,
                value: Bytes::decode(buf)?,
            },
            OpCode::Call => SubOp::Exec {
                class: String::decode(buf)?,
                method: String::decode(buf)?,
                input: Bytes::decode(buf)?,
            },
            OpCode::Create => SubOp::Create {
                exclusive: bool::decode(buf)?,
            },
            OpCode::Delete => SubOp::Remove,
            OpCode::Write => SubOp::Write {
                offset: u64::decode(buf)?,
                data: Bytes::decode(buf)?,
            },
            OpCode::WriteFull => SubOp::WriteFull(Bytes::decode(buf)?),
            OpCode::Append => SubOp::Append(Bytes::decode(buf)?),
            OpCode::WriteSame => SubOp::WriteSame {
                offset: u64::decode(buf)?,
                write_len: u64::decode(buf)?,
                data: Bytes::decode(buf)?,
            },
            OpCode::Truncate => SubOp::Truncate(u64::decode(buf)?),
            OpCode::Zero => SubOp::Zero {
                offset: u64::decode(buf)?,
                len: u64::decode(buf)?,
            },
            OpCode::SetXattr => SubOp::SetXattr {
                name: String::decode(buf)?,
                value: Bytes::decode(buf)?,
            },
            OpCode::RmXattr => SubOp::RemoveXattr(String::decode(buf)?),
            OpCode::OmapSetVals => SubOp::OmapSet(BTreeMap::decode(buf)?),
            OpCode::OmapRmKeys => SubOp::OmapRemoveKeys(Vec::decode(buf)?),
            OpCode::OmapRmKeyRange => SubOp::OmapRemoveRange {
                start: String::decode(buf)?,
                end: String::decode(buf)?,
            },
            OpCode::OmapClear => SubOp::OmapClear,
            OpCode::SetAllocHint => SubOp::SetAllocHint {
                expected_object_size: u64::decode(buf)?,
                expected_write_size: u64::decode(buf)?,
                flags: AllocHintFlags::from_bits_retain(u32::decode(buf)?),
            },
            OpCode::Read => SubOp::Read {
                offset: u64::decode(buf)?,
                len: u64::decode(buf)?,
            },
            OpCode::Stat => SubOp::Stat,
            OpCode::GetXattr => SubOp::GetXattr(String::decode(buf)?),
            OpCode::GetXattrs => SubOp::GetXattrs,
            OpCode::OmapGetVals => SubOp::OmapGetVals {
                start_after: String::decode(buf)?,
                prefix: String::decode(buf)?,
                max: u64::decode(buf)?,
            },
            OpCode::OmapGetKeys => SubOp::OmapGetKeys {
                start_after: String::decode(buf)?,
                max: u64::decode(buf)?,
            },
            OpCode::OmapGetValsByKeys => SubOp::OmapGetValsByKeys(Vec::decode(buf)?),
            OpCode::Checksum => SubOp::Checksum {
                kind: ChecksumKind::decode(buf)?,
                init: u64::decode(buf)?,
                offset: u64::decode(buf)?,
                len: u64::decode(buf)?,
                chunk_size: u64::decode(buf)?,
            },
        };
        Ok(op)
    }
}

// ============= Requests =============

/// Decoded request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    pub tid: u64,
    pub address: ObjectAddress,
    pub kind: OperationKind,
    pub flags: OperationFlags,
    pub op_flags: OpFlags,
    pub mtime: Option<UTime>,
    pub ops: Vec<SubOp>,
}

impl Denc for RequestBody {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.tid.encode(buf)?;
        self.address.encode(buf)?;
        (self.kind as u8).encode(buf)?;
        self.flags.bits().encode(buf)?;
        self.op_flags.bits().encode(buf)?;
        self.mtime.encode(buf)?;
        self.ops.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let tid = u64::decode(buf)?;
        let address = ObjectAddress::decode(buf)?;
        let raw_kind = u8::decode(buf)?;
        let kind = OperationKind::from_u8(raw_kind)
            .ok_or_else(|| AioError::Decoding(format!("Unknown operation kind {}", raw_kind)))?;
        Ok(RequestBody {
            tid,
            address,
            kind,
            flags: OperationFlags::from_bits_retain(u32::decode(buf)?),
            op_flags: OpFlags::from_bits_retain(u32::decode(buf)?),
            mtime: Option::<UTime>::decode(buf)?,
            ops: Vec::decode(buf)?,
        })
    }
}

/// Encode a request body into a complete frame
pub fn encode_request(body: &RequestBody) -> Result<Bytes> {
    let mut payload = BytesMut::new();
    body.encode(&mut payload)?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.put_slice(&MAGIC);
    frame.put_u8(STRUCT_V);
    frame.put_u8(COMPAT_V);
    encode_len(payload.len(), &mut frame)?;
    frame.put_slice(&payload);
    frame.put_u32_le(crc32c::crc32c(&payload));
    Ok(frame.freeze())
}

/// Decode and verify a request frame
pub fn decode_request(frame: &[u8]) -> Result<RequestBody> {
    let mut buf = frame;
    need(&buf, HEADER_LEN, "frame header")?;

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(AioError::Decoding(format!("Bad frame magic {:02x?}", magic)));
    }
    let struct_v = buf.get_u8();
    let compat_v = buf.get_u8();
    if compat_v > STRUCT_V {
        return Err(AioError::Decoding(format!(
            "Frame v{} requires decoder v{}, have v{}",
            struct_v, compat_v, STRUCT_V
        )));
    }
    let body_len = buf.get_u32_le() as usize;
    need(&buf, body_len + TRAILER_LEN, "frame body")?;

    let body = &buf[..body_len];
    let mut trailer = &buf[body_len..];
    let expected_crc = trailer.get_u32_le();
    let actual_crc = crc32c::crc32c(body);
    if expected_crc != actual_crc {
        return Err(AioError::Decoding(format!(
            "Frame checksum mismatch: expected 0x{:08x}, computed 0x{:08x}",
            expected_crc, actual_crc
        )));
    }

    let mut body_buf = body;
    RequestBody::decode(&mut body_buf)
}

// ============= Output payloads =============

/// Output of a stat sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatInfo {
    pub size: u64,
    pub mtime: UTime,
}

impl Denc for StatInfo {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.size.encode(buf)?;
        self.mtime.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(StatInfo {
            size: u64::decode(buf)?,
            mtime: UTime::decode(buf)?,
        })
    }
}

/// One page of omap entries
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OmapPage {
    pub entries: BTreeMap<String, Bytes>,
    /// More entries remain past this page
    pub more: bool,
}

impl Denc for OmapPage {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.entries.encode(buf)?;
        self.more.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(OmapPage {
            entries: BTreeMap::decode(buf)?,
            more: bool::decode(buf)?,
        })
    }
}

/// One page of omap keys
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OmapKeyPage {
    pub keys: Vec<String>,
    pub more: bool,
}

impl Denc for OmapKeyPage {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.keys.encode(buf)?;
        self.more.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(OmapKeyPage {
            keys: Vec::decode(buf)?,
            more: bool::decode(buf)?,
        })
    }
}

/// Encode a value into a standalone buffer
pub fn to_bytes<T: Denc>(value: &T) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    value.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a value that must consume the whole buffer
pub fn from_bytes<T: Denc>(data: &[u8]) -> Result<T> {
    let mut buf = data;
    let value = T::decode(&mut buf)?;
    if buf.has_remaining() {
        return Err(AioError::Decoding(format!(
            "{} trailing bytes after value",
            buf.remaining()
        )));
    }
    Ok(value)
}
