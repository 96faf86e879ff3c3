//! Binary encoding of cached samples
//!
//! Entry layout (little endian):
//!
//! ```text
//! magic "MFSC" | version u16 | reserved u16 | payload_len u64 | crc32c u32 | payload
//! ```
//!
//! The payload is the sample's root dict as tagged values. Floats are stored
//! by bit pattern so NaN labels survive a round trip.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{MedflowError, Result};
use crate::sample::{ArrayData, NdArray, SampleDict, Value};

const MAGIC: &[u8; 4] = b"MFSC";

/// Current entry format version
pub const ENTRY_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 2 + 8 + 4;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_DICT: u8 = 7;

const DTYPE_F32: u8 = 0;
const DTYPE_I64: u8 = 1;

/// Encode a sample as a complete cache entry
pub fn encode_entry(sample: &SampleDict) -> Bytes {
    let mut payload = BytesMut::new();
    put_dict(&mut payload, sample.root());

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(MAGIC);
    out.put_u16_le(ENTRY_VERSION);
    out.put_u16_le(0);
    out.put_u64_le(payload.len() as u64);
    out.put_u32_le(crc32c::crc32c(&payload));
    out.put_slice(&payload);
    out.freeze()
}

/// Decode and verify a cache entry read from `path`
pub fn decode_entry(path: &Path, bytes: &[u8]) -> Result<SampleDict> {
    decode(path, bytes, true)
}

/// Decode without checking the payload checksum. Structural checks still
/// apply, so a truncated entry is still reported as corrupt.
pub fn decode_entry_unverified(path: &Path, bytes: &[u8]) -> Result<SampleDict> {
    decode(path, bytes, false)
}

fn decode(path: &Path, bytes: &[u8], verify: bool) -> Result<SampleDict> {
    let corrupt = |reason: String| MedflowError::CacheCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!("{} bytes is shorter than the header", bytes.len())));
    }
    let mut buf = bytes;
    if &buf[..4] != MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    buf.advance(4);

    let version = buf.get_u16_le();
    if version != ENTRY_VERSION {
        return Err(corrupt(format!(
            "entry version {} (supported {})",
            version, ENTRY_VERSION
        )));
    }
    let _reserved = buf.get_u16_le();
    let payload_len = buf.get_u64_le();
    let expected_crc = buf.get_u32_le();

    if buf.remaining() as u64 != payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {}",
            buf.remaining(),
            payload_len
        )));
    }

    if verify {
        let actual_crc = crc32c::crc32c(buf);
        if actual_crc != expected_crc {
            return Err(MedflowError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected_crc,
                actual: actual_crc,
            });
        }
    }

    let mut reader = Reader { buf };
    let root = match reader.value().map_err(corrupt)? {
        Value::Dict(map) => map,
        other => return Err(corrupt(format!("root is {}, expected dict", other.kind()))),
    };
    if reader.buf.has_remaining() {
        return Err(corrupt(format!("{} trailing bytes", reader.buf.remaining())));
    }
    Ok(SampleDict::from_root(root))
}

fn put_str(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn put_dict(out: &mut BytesMut, map: &BTreeMap<String, Value>) {
    out.put_u8(TAG_DICT);
    out.put_u32_le(map.len() as u32);
    for (key, value) in map {
        put_str(out, key);
        put_value(out, value);
    }
}

fn put_value(out: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => out.put_u8(TAG_NULL),
        Value::Bool(b) => {
            out.put_u8(TAG_BOOL);
            out.put_u8(*b as u8);
        }
        Value::Int(v) => {
            out.put_u8(TAG_INT);
            out.put_i64_le(*v);
        }
        Value::Float(v) => {
            out.put_u8(TAG_FLOAT);
            out.put_u64_le(v.to_bits());
        }
        Value::Str(s) => {
            out.put_u8(TAG_STR);
            put_str(out, s);
        }
        Value::Array(arr) => {
            out.put_u8(TAG_ARRAY);
            out.put_u8(match arr.data() {
                ArrayData::F32(_) => DTYPE_F32,
                ArrayData::I64(_) => DTYPE_I64,
            });
            out.put_u32_le(arr.ndim() as u32);
            for &dim in arr.shape() {
                out.put_u64_le(dim as u64);
            }
            match arr.data() {
                ArrayData::F32(v) => {
                    out.reserve(v.len() * 4);
                    v.iter().for_each(|x| out.put_u32_le(x.to_bits()));
                }
                ArrayData::I64(v) => {
                    out.reserve(v.len() * 8);
                    v.iter().for_each(|x| out.put_i64_le(*x));
                }
            }
        }
        Value::List(items) => {
            out.put_u8(TAG_LIST);
            out.put_u32_le(items.len() as u32);
            for item in items {
                put_value(out, item);
            }
        }
        Value::Dict(map) => put_dict(out, map),
    }
}

/// Bounds-checked payload reader; errors are plain reasons
struct Reader<'a> {
    buf: &'a [u8],
}

type ReadResult<T> = std::result::Result<T, String>;

impl<'a> Reader<'a> {
    fn need(&self, n: usize) -> ReadResult<()> {
        if self.buf.remaining() < n {
            Err(format!("truncated payload: need {} bytes, have {}", n, self.buf.remaining()))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> ReadResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> ReadResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> ReadResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn string(&mut self) -> ReadResult<String> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| "string is not valid utf-8".to_string())?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    fn value(&mut self) -> ReadResult<Value> {
        match self.u8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(self.u8()? != 0)),
            TAG_INT => Ok(Value::Int(self.u64()? as i64)),
            TAG_FLOAT => Ok(Value::Float(f64::from_bits(self.u64()?))),
            TAG_STR => Ok(Value::Str(self.string()?)),
            TAG_ARRAY => self.array().map(Value::Array),
            TAG_LIST => {
                let count = self.u32()? as usize;
                // Every value takes at least one byte
                self.need(count)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value()?);
                }
                Ok(Value::List(items))
            }
            TAG_DICT => {
                let count = self.u32()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = self.string()?;
                    let value = self.value()?;
                    map.insert(key, value);
                }
                Ok(Value::Dict(map))
            }
            tag => Err(format!("unknown value tag {}", tag)),
        }
    }

    fn array(&mut self) -> ReadResult<NdArray> {
        let dtype = self.u8()?;
        let ndim = self.u32()? as usize;
        self.need(ndim.saturating_mul(8))?;
        let shape: Vec<usize> = (0..ndim).map(|_| self.buf.get_u64_le() as usize).collect();

        let count = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| format!("array shape {:?} overflows", shape))?;

        let data = match dtype {
            DTYPE_F32 => {
                self.need(count.saturating_mul(4))?;
                ArrayData::F32((0..count).map(|_| f32::from_bits(self.buf.get_u32_le())).collect())
            }
            DTYPE_I64 => {
                self.need(count.saturating_mul(8))?;
                ArrayData::I64((0..count).map(|_| self.buf.get_i64_le()).collect())
            }
            other => return Err(format!("unknown array dtype {}", other)),
        };
        NdArray::new(shape, data).map_err(|e| e.to_string())
    }
}
