//! NumPy `.npy` volume codec
//!
//! Reads version 1-3 files holding C-ordered numeric arrays. Floating point
//! element types load as `f32`, integer and bool types as `i64`.

use bytes::{Buf, BufMut, BytesMut};
use std::path::Path;

use crate::error::{MedflowError, Result};
use crate::sample::{ArrayData, NdArray};

const MAGIC: &[u8] = b"\x93NUMPY";

/// Element type parsed from the `descr` header field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F32,
    F64,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
}

impl Dtype {
    fn parse(descr: &str) -> Option<(Dtype, bool)> {
        let order = descr.get(..1)?;
        let code = descr.get(1..)?;
        let big_endian = match order {
            "<" | "|" | "=" => false,
            ">" => true,
            _ => return None,
        };
        let dtype = match code {
            "f4" => Dtype::F32,
            "f8" => Dtype::F64,
            "b1" => Dtype::Bool,
            "i1" => Dtype::I8,
            "u1" => Dtype::U8,
            "i2" => Dtype::I16,
            "u2" => Dtype::U16,
            "i4" => Dtype::I32,
            "u4" => Dtype::U32,
            "i8" => Dtype::I64,
            _ => return None,
        };
        Some((dtype, big_endian))
    }

    fn size(self) -> usize {
        match self {
            Dtype::Bool | Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
        }
    }
}

/// Parsed header dictionary
struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Load a `.npy` file from disk
pub fn read_npy(path: &Path) -> Result<NdArray> {
    let bytes = std::fs::read(path).map_err(|e| MedflowError::io(path, e))?;
    decode_npy(&bytes).map_err(|reason| MedflowError::ImageDecode {
        path: path.to_path_buf(),
        reason,
    })
}

/// Decode an in-memory `.npy` image. Errors are plain reasons; the caller
/// attaches the path.
pub fn decode_npy(bytes: &[u8]) -> std::result::Result<NdArray, String> {
    if bytes.len() < MAGIC.len() + 2 || &bytes[..MAGIC.len()] != MAGIC {
        return Err("missing NUMPY magic".into());
    }
    let mut buf = &bytes[MAGIC.len()..];
    let major = buf.get_u8();
    let _minor = buf.get_u8();

    let header_len = match major {
        1 if buf.remaining() >= 2 => buf.get_u16_le() as usize,
        2 | 3 if buf.remaining() >= 4 => buf.get_u32_le() as usize,
        1..=3 => return Err("truncated header length".into()),
        v => return Err(format!("unsupported npy version {}", v)),
    };
    if buf.remaining() < header_len {
        return Err("truncated header".into());
    }
    let header_text = std::str::from_utf8(&buf[..header_len])
        .map_err(|_| "header is not valid text".to_string())?;
    let header = parse_header(header_text)?;
    buf.advance(header_len);

    if header.fortran_order {
        return Err("fortran-ordered arrays are not supported".into());
    }
    let (dtype, big_endian) = Dtype::parse(&header.descr)
        .ok_or_else(|| format!("unsupported dtype '{}'", header.descr))?;

    let count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| format!("shape {:?} overflows the element count", header.shape))?;
    let expected = count
        .checked_mul(dtype.size())
        .ok_or_else(|| format!("shape {:?} of {} overflows the byte size", header.shape, header.descr))?;
    if buf.remaining() != expected {
        return Err(format!(
            "payload is {} bytes, shape {:?} of {} needs {}",
            buf.remaining(),
            header.shape,
            header.descr,
            expected
        ));
    }

    let data = read_elements(&mut buf, dtype, big_endian, count);
    NdArray::new(header.shape, data).map_err(|e| e.to_string())
}

fn read_elements(buf: &mut &[u8], dtype: Dtype, big_endian: bool, count: usize) -> ArrayData {
    macro_rules! collect {
        ($le:ident, $be:ident, $conv:expr) => {
            (0..count)
                .map(|_| {
                    let v = if big_endian { buf.$be() } else { buf.$le() };
                    $conv(v)
                })
                .collect()
        };
    }

    match dtype {
        Dtype::F32 => ArrayData::F32(collect!(get_f32_le, get_f32, |v: f32| v)),
        Dtype::F64 => ArrayData::F32(collect!(get_f64_le, get_f64, |v: f64| v as f32)),
        Dtype::Bool | Dtype::U8 => ArrayData::I64((0..count).map(|_| buf.get_u8() as i64).collect()),
        Dtype::I8 => ArrayData::I64((0..count).map(|_| buf.get_i8() as i64).collect()),
        Dtype::I16 => ArrayData::I64(collect!(get_i16_le, get_i16, |v: i16| v as i64)),
        Dtype::U16 => ArrayData::I64(collect!(get_u16_le, get_u16, |v: u16| v as i64)),
        Dtype::I32 => ArrayData::I64(collect!(get_i32_le, get_i32, |v: i32| v as i64)),
        Dtype::U32 => ArrayData::I64(collect!(get_u32_le, get_u32, |v: u32| v as i64)),
        Dtype::I64 => ArrayData::I64(collect!(get_i64_le, get_i64, |v: i64| v)),
    }
}

/// Parse the python-literal header, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (3, 4), }`
fn parse_header(text: &str) -> std::result::Result<Header, String> {
    let descr = field(text, "descr")
        .and_then(|rest| {
            let rest = rest.trim_start().strip_prefix('\'')?;
            rest.split('\'').next().map(str::to_string)
        })
        .ok_or_else(|| "header has no descr".to_string())?;

    let fortran_order = field(text, "fortran_order")
        .map(|rest| rest.trim_start().starts_with("True"))
        .ok_or_else(|| "header has no fortran_order".to_string())?;

    let shape_text = field(text, "shape")
        .and_then(|rest| {
            let rest = rest.trim_start().strip_prefix('(')?;
            rest.split(')').next()
        })
        .ok_or_else(|| "header has no shape".to_string())?;

    let shape = shape_text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| format!("bad shape entry '{}'", s)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

/// Text following `'name':` in the header
fn field<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let key = format!("'{}'", name);
    let start = text.find(&key)? + key.len();
    text[start..].trim_start().strip_prefix(':')
}

/// Encode an array as a version 1.0 `.npy` image (`<f4` or `<i8`)
pub fn encode_npy(array: &NdArray) -> Vec<u8> {
    let descr = match array.data() {
        ArrayData::F32(_) => "<f4",
        ArrayData::I64(_) => "<i8",
    };
    let shape = match array.shape() {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    // Pad so the payload starts on a 64-byte boundary
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut out = BytesMut::with_capacity(MAGIC.len() + 4 + header.len() + array.len() * 8);
    out.put_slice(MAGIC);
    out.put_u8(1);
    out.put_u8(0);
    out.put_u16_le(header.len() as u16);
    out.put_slice(header.as_bytes());
    match array.data() {
        ArrayData::F32(v) => v.iter().for_each(|x| out.put_f32_le(*x)),
        ArrayData::I64(v) => v.iter().for_each(|x| out.put_i64_le(*x)),
    }
    out.to_vec()
}
