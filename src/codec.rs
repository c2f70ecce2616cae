//! Argument codec (§4.7) and metadata-blob layout (§3's `MetaEntry`).
//!
//! Trace-entry payloads carry *only* packed argument values — no per-value
//! type tag — because the type of every argument is already fixed by the
//! `MetaEntry` a trace entry's `in_file_offset` points to. The codec reads
//! that one `arg_types` array once per site and uses it to size and then
//! serialize each call's arguments.
//!
//! Per §9's systems-rewrite guidance, the variadic argument stream this
//! codec walks twice (sizing pass, then serialization pass) is not a real
//! C varargs list but an explicit typed [`Value`] slice the call site
//! builds — the `tracepoint!` macro in [`crate::tracepoint`] is what
//! materializes that slice.

use crate::error::{Error, Result};

/// One argument's wire type, matching the single-byte codes used in a
/// `MetaEntry`'s `arg_types` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Unknown,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    U128,
    I128,
    F32,
    F64,
    /// `u32` length prefix (NUL counted) + bytes.
    Str,
    /// Wire-identical to `U64`; distinguished only for display formatting.
    Ptr,
    /// `u32` length prefix (no NUL) + raw bytes.
    Dump,
}

impl ArgType {
    pub fn to_byte(self) -> u8 {
        use ArgType::*;
        match self {
            Unknown => b'?',
            U8 => b'c',
            I8 => b'C',
            U16 => b'w',
            I16 => b'W',
            U32 => b'i',
            I32 => b'I',
            U64 => b'l',
            I64 => b'L',
            U128 => b'q',
            I128 => b'Q',
            F32 => b'f',
            F64 => b'd',
            Str => b's',
            Ptr => b'p',
            Dump => b'x',
        }
    }

    pub fn from_byte(b: u8) -> ArgType {
        use ArgType::*;
        match b {
            b'c' => U8,
            b'C' => I8,
            b'w' => U16,
            b'W' => I16,
            b'i' => U32,
            b'I' => I32,
            b'l' => U64,
            b'L' => I64,
            b'q' => U128,
            b'Q' => I128,
            b'f' => F32,
            b'd' => F64,
            b's' => Str,
            b'p' => Ptr,
            b'x' => Dump,
            _ => Unknown,
        }
    }

    fn fixed_width(self) -> Option<usize> {
        use ArgType::*;
        match self {
            Unknown => Some(0),
            U8 | I8 => Some(1),
            U16 | I16 => Some(2),
            U32 | I32 | F32 => Some(4),
            U64 | I64 | F64 | Ptr => Some(8),
            U128 | I128 => Some(16),
            Str | Dump => None,
        }
    }
}

/// What the call site actually hands the codec: the promoted/native
/// representations the typed argument tuple carries.
#[derive(Debug, Clone)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Signed128(i128),
    Unsigned128(u128),
    Float(f64),
    /// On-disk length will be `s.len() + 1` to account for the NUL.
    Str(String),
    Dump(Vec<u8>),
}

fn value_len(ty: ArgType, value: &Value) -> usize {
    match ty.fixed_width() {
        Some(w) => w,
        None => match (ty, value) {
            (ArgType::Str, Value::Str(s)) => 4 + s.len() + 1,
            (ArgType::Dump, Value::Dump(d)) => 4 + d.len(),
            _ => 0,
        },
    }
}

/// Sizing pass: total payload bytes `encode_args` will need.
pub fn size_of_args(arg_types: &[ArgType], values: &[Value]) -> usize {
    arg_types
        .iter()
        .zip(values.iter())
        .map(|(ty, v)| value_len(*ty, v))
        .sum()
}

/// Serialization pass: packed little-endian values in declaration order,
/// no padding, no per-value type tag.
pub fn encode_args(arg_types: &[ArgType], values: &[Value], out: &mut [u8]) -> Result<usize> {
    let mut off = 0;
    for (ty, value) in arg_types.iter().zip(values.iter()) {
        let need = value_len(*ty, value);
        if off + need > out.len() {
            return Err(Error::EntryTooLarge { size: need });
        }
        off += encode_one(*ty, value, &mut out[off..off + need])?;
    }
    Ok(off)
}

fn encode_one(ty: ArgType, value: &Value, out: &mut [u8]) -> Result<usize> {
    use ArgType::*;
    match ty {
        Unknown => Ok(0),
        U8 => {
            out[0] = unsigned(value) as u8;
            Ok(1)
        }
        I8 => {
            out[0] = signed(value) as i8 as u8;
            Ok(1)
        }
        U16 => {
            out.copy_from_slice(&(unsigned(value) as u16).to_le_bytes());
            Ok(2)
        }
        I16 => {
            out.copy_from_slice(&(signed(value) as i16).to_le_bytes());
            Ok(2)
        }
        U32 => {
            out.copy_from_slice(&(unsigned(value) as u32).to_le_bytes());
            Ok(4)
        }
        I32 => {
            out.copy_from_slice(&(signed(value) as i32).to_le_bytes());
            Ok(4)
        }
        F32 => {
            out.copy_from_slice(&(float(value) as f32).to_le_bytes());
            Ok(4)
        }
        U64 | Ptr => {
            out.copy_from_slice(&unsigned(value).to_le_bytes());
            Ok(8)
        }
        I64 => {
            out.copy_from_slice(&signed(value).to_le_bytes());
            Ok(8)
        }
        F64 => {
            out.copy_from_slice(&float(value).to_le_bytes());
            Ok(8)
        }
        U128 => {
            out.copy_from_slice(&unsigned128(value).to_le_bytes());
            Ok(16)
        }
        I128 => {
            out.copy_from_slice(&signed128(value).to_le_bytes());
            Ok(16)
        }
        Str => match value {
            Value::Str(s) => {
                let len = (s.len() + 1) as u32;
                out[0..4].copy_from_slice(&len.to_le_bytes());
                out[4..4 + s.len()].copy_from_slice(s.as_bytes());
                out[4 + s.len()] = 0;
                Ok(4 + s.len() + 1)
            }
            _ => Err(Error::BadHeader {
                inner: "Str-typed argument was not a Value::Str".into(),
            }),
        },
        Dump => match value {
            Value::Dump(d) => {
                out[0..4].copy_from_slice(&(d.len() as u32).to_le_bytes());
                out[4..4 + d.len()].copy_from_slice(d);
                Ok(4 + d.len())
            }
            _ => Err(Error::BadHeader {
                inner: "Dump-typed argument was not a Value::Dump".into(),
            }),
        },
    }
}

fn signed(v: &Value) -> i64 {
    match v {
        Value::Signed(n) => *n,
        Value::Unsigned(n) => *n as i64,
        Value::Signed128(n) => *n as i64,
        Value::Unsigned128(n) => *n as i64,
        Value::Float(f) => *f as i64,
        _ => 0,
    }
}
fn unsigned(v: &Value) -> u64 {
    match v {
        Value::Unsigned(n) => *n,
        Value::Signed(n) => *n as u64,
        Value::Unsigned128(n) => *n as u64,
        Value::Signed128(n) => *n as u64,
        Value::Float(f) => *f as u64,
        _ => 0,
    }
}
fn signed128(v: &Value) -> i128 {
    match v {
        Value::Signed128(n) => *n,
        Value::Unsigned128(n) => *n as i128,
        other => signed(other) as i128,
    }
}
fn unsigned128(v: &Value) -> u128 {
    match v {
        Value::Unsigned128(n) => *n,
        Value::Signed128(n) => *n as u128,
        other => unsigned(other) as u128,
    }
}
fn float(v: &Value) -> f64 {
    match v {
        Value::Float(f) => *f,
        other => signed(other) as f64,
    }
}

/// Decoded argument, for the live decoder side.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Signed(i64),
    Unsigned(u64),
    Signed128(i128),
    Unsigned128(u128),
    Float(f64),
    Str(String),
    Ptr(u64),
    Dump(Vec<u8>),
    Unknown,
}

/// Decodes one value of type `ty` from the start of `buf`, per the same
/// fixed-width/length-prefixed rules `encode_args` wrote. Returns the
/// value and bytes consumed.
pub fn decode_one(ty: ArgType, buf: &[u8]) -> Result<(Decoded, usize)> {
    use ArgType::*;
    let short = || Error::ShortIo {
        inner: format!("truncated {:?} argument", ty),
    };
    Ok(match ty {
        Unknown => (Decoded::Unknown, 0),
        U8 => (Decoded::Unsigned(*buf.first().ok_or_else(short)? as u64), 1),
        I8 => (
            Decoded::Signed(*buf.first().ok_or_else(short)? as i8 as i64),
            1,
        ),
        U16 => (Decoded::Unsigned(read::<2, u16>(buf, short)? as u64), 2),
        I16 => (Decoded::Signed(read::<2, i16>(buf, short)? as i64), 2),
        U32 => (Decoded::Unsigned(read::<4, u32>(buf, short)? as u64), 4),
        I32 => (Decoded::Signed(read::<4, i32>(buf, short)? as i64), 4),
        F32 => (Decoded::Float(read::<4, f32>(buf, short)? as f64), 4),
        U64 => (Decoded::Unsigned(read::<8, u64>(buf, short)?), 8),
        I64 => (Decoded::Signed(read::<8, i64>(buf, short)?), 8),
        F64 => (Decoded::Float(read::<8, f64>(buf, short)?), 8),
        Ptr => (Decoded::Ptr(read::<8, u64>(buf, short)?), 8),
        U128 => (Decoded::Unsigned128(read::<16, u128>(buf, short)?), 16),
        I128 => (Decoded::Signed128(read::<16, i128>(buf, short)?), 16),
        Str => {
            let len = read::<4, u32>(buf, short)? as usize;
            let end = 4usize.checked_add(len).filter(|&e| e <= buf.len()).ok_or_else(short)?;
            let with_nul = &buf[4..end];
            let s = std::str::from_utf8(with_nul.strip_suffix(&[0]).unwrap_or(with_nul))
                .map_err(|_| Error::BadHeader {
                    inner: "Str argument was not valid UTF-8".into(),
                })?
                .to_owned();
            (Decoded::Str(s), end)
        }
        Dump => {
            let len = read::<4, u32>(buf, short)? as usize;
            let end = 4usize.checked_add(len).filter(|&e| e <= buf.len()).ok_or_else(short)?;
            (Decoded::Dump(buf[4..end].to_vec()), end)
        }
    })
}

fn read<const N: usize, T: FromLeBytes<N>>(buf: &[u8], short: impl Fn() -> Error) -> Result<T> {
    let bytes: [u8; N] = buf.get(..N).ok_or_else(short)?.try_into().unwrap();
    Ok(T::from_le_bytes(bytes))
}

trait FromLeBytes<const N: usize> {
    fn from_le_bytes(bytes: [u8; N]) -> Self;
}
macro_rules! impl_from_le {
    ($($ty:ty, $n:expr);* $(;)?) => {
        $(impl FromLeBytes<$n> for $ty {
            fn from_le_bytes(bytes: [u8; $n]) -> Self { <$ty>::from_le_bytes(bytes) }
        })*
    };
}
impl_from_le!(u16,2; i16,2; u32,4; i32,4; f32,4; u64,8; i64,8; f64,8; u128,16; i128,16);

/// Scans `format` for `%p` conversions and, for each one, narrows the
/// corresponding declared argument type from `Str` to `Ptr` in place — the
/// macro layer that's out of scope for this crate can't always tell a `%p`
/// apart from a `%s` at expansion time, so this "first-time check" runs
/// once, when a site's metadata is first built.
pub fn disambiguate_pointer_args(format: &str, arg_types: &mut [ArgType]) {
    let mut arg_idx = 0;
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                continue;
            }
            _ => {}
        }
        while let Some(&c) = chars.peek() {
            chars.next();
            if c.is_ascii_alphabetic() {
                if c == 'p' {
                    if let Some(slot) = arg_types.get_mut(arg_idx) {
                        if *slot == ArgType::Str {
                            *slot = ArgType::Ptr;
                        }
                    }
                }
                arg_idx += 1;
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Printf = 1,
    Dump = 2,
}

impl MetaKind {
    fn from_u8(b: u8) -> Option<MetaKind> {
        match b {
            1 => Some(MetaKind::Printf),
            2 => Some(MetaKind::Dump),
            _ => None,
        }
    }
}

/// The compile-time-captured description a decoder needs to interpret a
/// trace entry: `{ magic='{', size:u32, kind, line:u32, arg_count,
/// arg_types[arg_count+1] (NUL-terminated), file\0, str\0 }` (§3).
#[derive(Debug, Clone)]
pub struct MetaEntry {
    pub kind: MetaKind,
    pub line: u32,
    pub arg_types: Vec<ArgType>,
    pub file: String,
    /// The format string (`Printf`) or dump label (`Dump`).
    pub text: String,
}

const META_MAGIC: u8 = b'{';

impl MetaEntry {
    pub fn encode(&self) -> Vec<u8> {
        let arg_count = self.arg_types.len() as u8;
        let mut body_len = 1 + 4 + 1 + 4 + 1 + (arg_count as usize + 1) + self.file.len() + 1
            + self.text.len() + 1;
        // `size` itself is a field within the total, per §3's table.
        body_len += 0;
        let mut out = Vec::with_capacity(body_len);
        out.push(META_MAGIC);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.line.to_le_bytes());
        out.push(arg_count);
        for ty in &self.arg_types {
            out.push(ty.to_byte());
        }
        out.push(0);
        out.extend_from_slice(self.file.as_bytes());
        out.push(0);
        out.extend_from_slice(self.text.as_bytes());
        out.push(0);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(MetaEntry, usize)> {
        let bad = |why: &str| Error::BadHeader {
            inner: format!("malformed MetaEntry: {}", why),
        };
        if buf.first() != Some(&META_MAGIC) {
            return Err(bad("bad magic"));
        }
        let size = u32::from_le_bytes(buf.get(1..5).ok_or_else(|| bad("truncated size"))?.try_into().unwrap())
            as usize;
        if size > buf.len() {
            return Err(bad("size exceeds buffer"));
        }
        let kind = MetaKind::from_u8(*buf.get(5).ok_or_else(|| bad("truncated kind"))?)
            .ok_or_else(|| bad("unknown kind"))?;
        let line = u32::from_le_bytes(buf.get(6..10).ok_or_else(|| bad("truncated line"))?.try_into().unwrap());
        let arg_count = *buf.get(10).ok_or_else(|| bad("truncated arg_count"))? as usize;
        let types_start = 11;
        let types_end = types_start + arg_count;
        let type_bytes = buf.get(types_start..types_end).ok_or_else(|| bad("truncated arg_types"))?;
        let arg_types: Vec<ArgType> = type_bytes.iter().map(|&b| ArgType::from_byte(b)).collect();
        if buf.get(types_end) != Some(&0) {
            return Err(bad("arg_types not NUL-terminated"));
        }
        let file_start = types_end + 1;
        let file_nul = buf[file_start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bad("file not NUL-terminated"))?;
        let file = std::str::from_utf8(&buf[file_start..file_start + file_nul])
            .map_err(|_| bad("file not valid UTF-8"))?
            .to_owned();
        let str_start = file_start + file_nul + 1;
        let str_nul = buf[str_start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bad("str not NUL-terminated"))?;
        let text = std::str::from_utf8(&buf[str_start..str_start + str_nul])
            .map_err(|_| bad("str not valid UTF-8"))?
            .to_owned();

        Ok((
            MetaEntry {
                kind,
                line,
                arg_types,
                file,
                text,
            },
            size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_mixed_argument_list() {
        let arg_types = vec![ArgType::U32, ArgType::Str, ArgType::Ptr, ArgType::F64];
        let values = vec![
            Value::Unsigned(42),
            Value::Str("hello".into()),
            Value::Unsigned(0x7fff_0000),
            Value::Float(3.5),
        ];
        let size = size_of_args(&arg_types, &values);
        let mut buf = vec![0u8; size];
        let written = encode_args(&arg_types, &values, &mut buf).unwrap();
        assert_eq!(written, size);

        let mut off = 0;
        let (a, n) = decode_one(ArgType::U32, &buf[off..]).unwrap();
        assert_eq!(a, Decoded::Unsigned(42));
        off += n;
        let (b, n) = decode_one(ArgType::Str, &buf[off..]).unwrap();
        assert_eq!(b, Decoded::Str("hello".into()));
        off += n;
        let (c, n) = decode_one(ArgType::Ptr, &buf[off..]).unwrap();
        assert_eq!(c, Decoded::Ptr(0x7fff_0000));
        off += n;
        let (d, _) = decode_one(ArgType::F64, &buf[off..]).unwrap();
        assert_eq!(d, Decoded::Float(3.5));
    }

    #[test]
    fn narrows_promoted_value_to_declared_width() {
        let arg_types = vec![ArgType::I8];
        let values = vec![Value::Signed(-1)];
        let mut buf = vec![0u8; size_of_args(&arg_types, &values)];
        encode_args(&arg_types, &values, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFFu8]);
    }

    #[test]
    fn ptr_and_u64_are_wire_identical() {
        let mut ptr_buf = vec![0u8; 8];
        let mut u64_buf = vec![0u8; 8];
        encode_args(&[ArgType::Ptr], &[Value::Unsigned(0x1234)], &mut ptr_buf).unwrap();
        encode_args(&[ArgType::U64], &[Value::Unsigned(0x1234)], &mut u64_buf).unwrap();
        assert_eq!(ptr_buf, u64_buf);
    }

    #[test]
    fn disambiguates_percent_p_from_declared_str() {
        let mut arg_types = vec![ArgType::Str, ArgType::U32];
        disambiguate_pointer_args("conn %p had %u bytes", &mut arg_types);
        assert_eq!(arg_types, vec![ArgType::Ptr, ArgType::U32]);
    }

    #[test]
    fn percent_percent_does_not_consume_an_argument_slot() {
        let mut arg_types = vec![ArgType::Str];
        disambiguate_pointer_args("100%% done, handle %p", &mut arg_types);
        assert_eq!(arg_types, vec![ArgType::Ptr]);
    }

    #[test]
    fn meta_entry_roundtrips_through_bytes() {
        let meta = MetaEntry {
            kind: MetaKind::Printf,
            line: 42,
            arg_types: vec![ArgType::U32, ArgType::Ptr],
            file: "src/server.rs".into(),
            text: "req %u on conn %p".into(),
        };
        let bytes = meta.encode();
        let (back, consumed) = MetaEntry::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(back.file, meta.file);
        assert_eq!(back.arg_types, meta.arg_types);
        assert_eq!(back.text, meta.text);
    }

    #[test]
    fn unknown_type_contributes_zero_bytes() {
        let arg_types = vec![ArgType::Unknown];
        let values = vec![Value::Signed(0)];
        assert_eq!(size_of_args(&arg_types, &values), 0);
    }
}
