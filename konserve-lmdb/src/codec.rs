//! The tagged binary codec.
//!
//! Every [`Value`](konserve_traits::Value) lowers to a single leading tag byte followed by
//! a tag-specific body. Built-in tags occupy `0x00..=0x1C`; `0x40..=0xFF` are reserved for
//! [`TypeHandler`](konserve_traits::TypeHandler)-registered extensions, dispatched through
//! a [`crate::registry::TypeRegistry`].
//!
//! Encoding writes into a fixed-capacity scratch buffer (drawn from a [`crate::pool::BufferPool`])
//! rather than growing a `Vec` unboundedly: on overflow the buffer is reallocated at 10x its
//! prior capacity and the whole value is re-encoded from scratch, up to a 256 MiB ceiling.
//! This keeps one pathologically large record from ratcheting every future buffer in the
//! pool up to its size one doubling at a time.

use std::any::{Any, TypeId};
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use konserve_traits::{BoxedError, Custom, Keyword, Value};

use crate::pool::BufferPool;
use crate::registry::TypeRegistry;
use crate::{Error, Result};

/// A decoder read a tag byte that is neither a built-in tag nor registered with the
/// [`TypeRegistry`] in play. Downcast out of the [`BoxedError`] returned by [`decode`] to
/// recover the original tag byte.
#[derive(Debug)]
pub struct UnknownTagError(pub u8);

impl fmt::Display for UnknownTagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown wire tag {:#04x}", self.0)
    }
}

impl std::error::Error for UnknownTagError {}

/// A value presented to [`encode`] has no built-in tag and no handler registered for its
/// concrete type. Carries the [`TypeId`] of the offending value.
#[derive(Debug)]
pub struct UnsupportedTypeError(pub TypeId);

impl fmt::Display for UnsupportedTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no type handler registered for concrete type {:?}", self.0)
    }
}

impl std::error::Error for UnsupportedTypeError {}

/// Encoding a value needed more than the 256 MiB scratch ceiling. Carries the buffer size
/// that was attempted when the ceiling was hit.
#[derive(Debug)]
pub struct EncodeOverflowError {
    /// The scratch buffer size that would have been needed to continue growing.
    pub attempted: usize,
}

impl fmt::Display for EncodeOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encoded value exceeds the 256 MiB ceiling (last attempt: {} bytes)", self.attempted)
    }
}

impl std::error::Error for EncodeOverflowError {}

/// Tag bytes for every built-in [`Value`] variant.
mod tag {
    pub const NIL: u8 = 0x00;
    pub const BOOL_FALSE: u8 = 0x01;
    pub const BOOL_TRUE: u8 = 0x02;
    pub const INT64: u8 = 0x03;
    pub const FLOAT64: u8 = 0x04;
    pub const STR: u8 = 0x05;
    pub const KEYWORD: u8 = 0x06;
    pub const SYMBOL: u8 = 0x07;
    pub const UUID: u8 = 0x08;
    pub const INSTANT: u8 = 0x09;
    pub const BYTES: u8 = 0x0A;
    pub const SEQ: u8 = 0x0B;
    pub const MAP: u8 = 0x0C;
    pub const SET: u8 = 0x0D;
    pub const INT16: u8 = 0x0E;
    pub const INT8: u8 = 0x0F;
    pub const FLOAT32: u8 = 0x10;
    pub const CHAR: u8 = 0x11;
    pub const BIGINT: u8 = 0x12;
    pub const BIGDECIMAL: u8 = 0x13;
    pub const RATIO: u8 = 0x14;
    pub const INT16_ARRAY: u8 = 0x15;
    pub const INT32_ARRAY: u8 = 0x16;
    pub const INT64_ARRAY: u8 = 0x17;
    pub const FLOAT32_ARRAY: u8 = 0x18;
    pub const FLOAT64_ARRAY: u8 = 0x19;
    pub const BOOL_ARRAY: u8 = 0x1A;
    pub const CHAR_ARRAY: u8 = 0x1B;
    pub const INT32: u8 = 0x1C;
}

/// Lower bound (inclusive) of the user-extension tag range.
pub const CUSTOM_TAG_MIN: u8 = 0x40;

/// The fixed field name a wrapped record's metadata is stored under.
pub const META_FIELD: &str = "meta";
/// The fixed field name a wrapped record's user value is stored under.
pub const VALUE_FIELD: &str = "value";

/// Bytes presented to a wrapped-record reader don't have the `{meta, value}` shape: either
/// the outer tag isn't a mapping, the mapping is missing the `meta` field in first
/// position, or (for [`decode_record`]) it doesn't have exactly the two expected fields.
/// This is the structural signal a cross-API misuse (reading a raw-API record through the
/// wrapped API) boils down to; `Store` attaches the offending key before surfacing it.
/// `observed_fields` is a best-effort debug rendering of whatever top-level field keys were
/// actually found (empty if the bytes weren't even a mapping).
#[derive(Debug)]
pub struct NotWrappedError {
    /// Debug rendering of the top-level keys actually found, if the bytes were a mapping.
    pub observed_fields: Vec<String>,
}

impl fmt::Display for NotWrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record does not have the wrapped {{meta, value}} shape; found fields {:?}", self.observed_fields)
    }
}

impl std::error::Error for NotWrappedError {}

fn field_name(value: &Value) -> String {
    format!("{value:?}")
}

fn is_field_symbol(value: &Value, name: &str) -> bool {
    matches!(value, Value::Symbol(kw) if kw.namespace.is_none() && kw.name == name)
}

const INITIAL_CAPACITY: usize = 256;
const MAX_CAPACITY: usize = 256 * 1024 * 1024;

/// Raised from inside [`Writer`] when the scratch buffer runs out of room; caught by the
/// growth-and-retry loop in [`encode`], never surfaced past it.
struct Overflow;

struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Writer<'b> {
        Writer { buf, pos: 0 }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.pos.checked_add(bytes.len()).ok_or(Overflow)?;
        if end > self.buf.len() {
            return Err(Overflow);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn write_u8(&mut self, byte: u8) -> Result<(), Overflow> {
        self.write_bytes(&[byte])
    }

    fn write_u16(&mut self, value: u16) -> Result<(), Overflow> {
        let mut tmp = [0u8; 2];
        BigEndian::write_u16(&mut tmp, value);
        self.write_bytes(&tmp)
    }

    fn write_u32(&mut self, value: u32) -> Result<(), Overflow> {
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, value);
        self.write_bytes(&tmp)
    }

    fn write_i32(&mut self, value: i32) -> Result<(), Overflow> {
        self.write_u32(value as u32)
    }

    fn write_i64(&mut self, value: i64) -> Result<(), Overflow> {
        let mut tmp = [0u8; 8];
        BigEndian::write_i64(&mut tmp, value);
        self.write_bytes(&tmp)
    }

    fn write_u64(&mut self, value: u64) -> Result<(), Overflow> {
        let mut tmp = [0u8; 8];
        BigEndian::write_u64(&mut tmp, value);
        self.write_bytes(&tmp)
    }

    fn write_f32(&mut self, value: f32) -> Result<(), Overflow> {
        let mut tmp = [0u8; 4];
        BigEndian::write_f32(&mut tmp, value);
        self.write_bytes(&tmp)
    }

    fn write_f64(&mut self, value: f64) -> Result<(), Overflow> {
        let mut tmp = [0u8; 8];
        BigEndian::write_f64(&mut tmp, value);
        self.write_bytes(&tmp)
    }

    fn write_blob(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let len: u32 = bytes.len().try_into().map_err(|_| Overflow)?;
        self.write_u32(len)?;
        self.write_bytes(bytes)
    }

    fn position(&self) -> usize {
        self.pos
    }
}

fn write_keyword(w: &mut Writer, kw: &Keyword) -> Result<(), Overflow> {
    match &kw.namespace {
        Some(ns) => {
            let mut full = String::with_capacity(ns.len() + 1 + kw.name.len());
            full.push_str(ns);
            full.push('/');
            full.push_str(&kw.name);
            w.write_blob(full.as_bytes())
        }
        None => w.write_blob(kw.name.as_bytes()),
    }
}

/// Unifies the two ways writing a value can fail: the scratch buffer ran out of room
/// (caught and retried by [`encode`]), or a [`TypeHandler`](konserve_traits::TypeHandler)
/// itself reported an error (propagated straight out of [`encode`]).
enum WriteError {
    Overflow,
    Handler(BoxedError),
}

impl From<Overflow> for WriteError {
    fn from(_: Overflow) -> WriteError {
        WriteError::Overflow
    }
}

fn write_value(
    w: &mut Writer,
    value: &Value,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<(), WriteError> {
    match value {
        Value::Nil => w.write_u8(tag::NIL)?,
        Value::Bool(false) => w.write_u8(tag::BOOL_FALSE)?,
        Value::Bool(true) => w.write_u8(tag::BOOL_TRUE)?,
        Value::Int8(v) => {
            w.write_u8(tag::INT8)?;
            w.write_u8(*v as u8)?
        }
        Value::Int16(v) => {
            w.write_u8(tag::INT16)?;
            w.write_u16(*v as u16)?
        }
        Value::Int32(v) => {
            w.write_u8(tag::INT32)?;
            w.write_i32(*v)?
        }
        Value::Int64(v) => {
            w.write_u8(tag::INT64)?;
            w.write_i64(*v)?
        }
        Value::Float32(v) => {
            w.write_u8(tag::FLOAT32)?;
            w.write_f32(*v)?
        }
        Value::Float64(v) => {
            w.write_u8(tag::FLOAT64)?;
            w.write_f64(*v)?
        }
        Value::Str(s) => {
            w.write_u8(tag::STR)?;
            w.write_blob(s.as_bytes())?
        }
        Value::Keyword(kw) => {
            w.write_u8(tag::KEYWORD)?;
            write_keyword(w, kw)?
        }
        Value::Symbol(kw) => {
            w.write_u8(tag::SYMBOL)?;
            write_keyword(w, kw)?
        }
        Value::Uuid(hi, lo) => {
            w.write_u8(tag::UUID)?;
            w.write_u64(*hi)?;
            w.write_u64(*lo)?
        }
        Value::Instant(millis) => {
            w.write_u8(tag::INSTANT)?;
            w.write_i64(*millis)?
        }
        Value::Bytes(b) => {
            w.write_u8(tag::BYTES)?;
            w.write_blob(b)?
        }
        Value::Char(c) => {
            w.write_u8(tag::CHAR)?;
            w.write_u16(*c)?
        }
        Value::BigInt(b) => {
            w.write_u8(tag::BIGINT)?;
            w.write_blob(b)?
        }
        Value::BigDecimal { scale, unscaled } => {
            w.write_u8(tag::BIGDECIMAL)?;
            w.write_i32(*scale)?;
            w.write_blob(unscaled)?
        }
        Value::Ratio { numer, denom } => {
            w.write_u8(tag::RATIO)?;
            w.write_blob(numer)?;
            w.write_blob(denom)?
        }
        Value::Int16Array(a) => {
            w.write_u8(tag::INT16_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_u16(*v as u16)?;
            }
        }
        Value::Int32Array(a) => {
            w.write_u8(tag::INT32_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_i32(*v)?;
            }
        }
        Value::Int64Array(a) => {
            w.write_u8(tag::INT64_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_i64(*v)?;
            }
        }
        Value::Float32Array(a) => {
            w.write_u8(tag::FLOAT32_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_f32(*v)?;
            }
        }
        Value::Float64Array(a) => {
            w.write_u8(tag::FLOAT64_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_f64(*v)?;
            }
        }
        Value::BoolArray(a) => {
            w.write_u8(tag::BOOL_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_u8(*v as u8)?;
            }
        }
        Value::CharArray(a) => {
            w.write_u8(tag::CHAR_ARRAY)?;
            w.write_u32(a.len() as u32)?;
            for v in a {
                w.write_u16(*v)?;
            }
        }
        Value::Seq(items) | Value::Set(items) => {
            w.write_u8(if matches!(value, Value::Seq(_)) { tag::SEQ } else { tag::SET })?;
            w.write_u32(items.len() as u32)?;
            for item in items {
                write_value(w, item, registry, ctx)?;
            }
        }
        Value::Map(pairs) => {
            w.write_u8(tag::MAP)?;
            w.write_u32(pairs.len() as u32)?;
            for (k, v) in pairs {
                write_value(w, k, registry, ctx)?;
                write_value(w, v, registry, ctx)?;
            }
        }
        Value::Custom(custom) => write_custom(w, custom, registry, ctx)?,
    }
    Ok(())
}

fn write_custom(
    w: &mut Writer,
    custom: &Custom,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<(), WriteError> {
    let handler = registry
        .handler_for(custom)
        .ok_or_else(|| WriteError::Handler(Box::new(UnsupportedTypeError(custom.type_id())) as BoxedError))?;

    let encode_nested = |nested: &Value| encode_inline(nested, registry, ctx);
    let body = handler.encode(&*custom.0, ctx, &encode_nested).map_err(WriteError::Handler)?;

    w.write_u8(handler.tag())?;
    // Length-prefixed like every other blob body: a handler's own body has no framing of
    // its own, so without a length prefix here the decoder would have no way to tell where
    // a custom value ends when it isn't the last thing in the buffer (e.g. one element of a
    // `Seq` of several).
    w.write_blob(&body)?;
    Ok(())
}

fn overflow_error(attempted: usize) -> BoxedError {
    Box::new(EncodeOverflowError { attempted })
}

/// Encode `value` into an owned byte vector without drawing on a [`BufferPool`].
///
/// Used for nested custom-type payloads written while already inside a pooled [`encode`]
/// call: those are typically small, and threading the outer pool through the recursion
/// would mean a handler's `encode_nested` callback could re-enter the same pool a caller
/// is mid-`acquire` on.
fn encode_inline(
    value: &Value,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<Vec<u8>, BoxedError> {
    let mut capacity = INITIAL_CAPACITY;
    loop {
        let mut scratch = vec![0u8; capacity];
        let mut w = Writer::new(&mut scratch);

        match write_value(&mut w, value, registry, ctx) {
            Ok(()) => {
                let len = w.position();
                scratch.truncate(len);
                return Ok(scratch);
            }
            Err(WriteError::Handler(e)) => return Err(e),
            Err(WriteError::Overflow) => {
                if capacity >= MAX_CAPACITY {
                    return Err(overflow_error(capacity));
                }
                capacity = (capacity * 10).min(MAX_CAPACITY);
            }
        }
    }
}

/// Shared growth-and-retry loop behind [`encode`] and [`encode_record`]: draws a scratch
/// buffer from `pool`, hands it to `write`, and on [`WriteError::Overflow`] grows the
/// scratch buffer 10x (capped at 256 MiB) and retries the whole write from scratch. The
/// scratch buffer is released back to `pool` before returning; the returned `Vec<u8>` is a
/// freshly sized copy of just the bytes that were written.
fn encode_with(
    pool: &BufferPool,
    mut write: impl FnMut(&mut Writer) -> std::result::Result<(), WriteError>,
) -> std::result::Result<Vec<u8>, BoxedError> {
    let mut capacity = INITIAL_CAPACITY;
    loop {
        let mut scratch = pool.acquire(capacity);
        let actual = scratch.capacity();
        scratch.resize(actual, 0);

        let mut w = Writer::new(&mut scratch[..actual]);

        match write(&mut w) {
            Ok(()) => {
                let len = w.position();
                return Ok(scratch[..len].to_vec());
            }
            Err(WriteError::Handler(e)) => return Err(e),
            Err(WriteError::Overflow) => {
                if capacity >= MAX_CAPACITY {
                    return Err(overflow_error(capacity));
                }
                capacity = (capacity * 10).min(MAX_CAPACITY);
            }
        }
    }
}

/// Encode `value` into an owned byte vector, using `pool` as the scratch buffer source.
pub fn encode(
    value: &Value,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
    pool: &BufferPool,
) -> std::result::Result<Vec<u8>, BoxedError> {
    encode_with(pool, |w| write_value(w, value, registry, ctx))
}

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn new(buf: &'b [u8]) -> Reader<'b> {
        Reader { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'b [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        if end > self.buf.len() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(self.read_bytes(8)?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.read_bytes(8)?))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(BigEndian::read_f32(self.read_bytes(4)?))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(BigEndian::read_f64(self.read_bytes(8)?))
    }

    fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_blob()?).map_err(|_| truncated())
    }
}

/// Every malformed-input case the [`Reader`] can hit (short buffer, bad UTF-8) boils down to
/// the same observation: the bytes don't describe a value this codec can decode.
fn truncated() -> Error {
    Error::Decoding(Box::new(UnknownTagError(0)).into())
}

fn read_keyword(r: &mut Reader) -> Result<Keyword> {
    let full = r.read_string()?;
    match full.split_once('/') {
        Some((ns, name)) => Ok(Keyword { namespace: Some(ns.to_string()), name: name.to_string() }),
        None => Ok(Keyword { namespace: None, name: full }),
    }
}

fn read_value(
    r: &mut Reader,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<Value, BoxedError> {
    let tag = r.read_u8().map_err(box_err)?;
    read_value_with_tag(tag, r, registry, ctx)
}

fn box_err(e: Error) -> BoxedError {
    Box::new(e)
}

fn read_value_with_tag(
    tag: u8,
    r: &mut Reader,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<Value, BoxedError> {
    Ok(match tag {
        tag::NIL => Value::Nil,
        tag::BOOL_FALSE => Value::Bool(false),
        tag::BOOL_TRUE => Value::Bool(true),
        tag::INT8 => Value::Int8(r.read_u8().map_err(box_err)? as i8),
        tag::INT16 => Value::Int16(r.read_u16().map_err(box_err)? as i16),
        tag::INT32 => Value::Int32(r.read_i32().map_err(box_err)?),
        tag::INT64 => Value::Int64(r.read_i64().map_err(box_err)?),
        tag::FLOAT32 => Value::Float32(r.read_f32().map_err(box_err)?),
        tag::FLOAT64 => Value::Float64(r.read_f64().map_err(box_err)?),
        tag::STR => Value::Str(r.read_string().map_err(box_err)?),
        tag::KEYWORD => Value::Keyword(read_keyword(r).map_err(box_err)?),
        tag::SYMBOL => Value::Symbol(read_keyword(r).map_err(box_err)?),
        tag::UUID => {
            let hi = r.read_u64().map_err(box_err)?;
            let lo = r.read_u64().map_err(box_err)?;
            Value::Uuid(hi, lo)
        }
        tag::INSTANT => Value::Instant(r.read_i64().map_err(box_err)?),
        tag::BYTES => Value::Bytes(r.read_blob().map_err(box_err)?),
        tag::CHAR => Value::Char(r.read_u16().map_err(box_err)?),
        tag::BIGINT => Value::BigInt(r.read_blob().map_err(box_err)?),
        tag::BIGDECIMAL => {
            let scale = r.read_i32().map_err(box_err)?;
            let unscaled = r.read_blob().map_err(box_err)?;
            Value::BigDecimal { scale, unscaled }
        }
        tag::RATIO => {
            let numer = r.read_blob().map_err(box_err)?;
            let denom = r.read_blob().map_err(box_err)?;
            Value::Ratio { numer, denom }
        }
        tag::INT16_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_u16().map_err(box_err)? as i16);
            }
            Value::Int16Array(out)
        }
        tag::INT32_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_i32().map_err(box_err)?);
            }
            Value::Int32Array(out)
        }
        tag::INT64_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_i64().map_err(box_err)?);
            }
            Value::Int64Array(out)
        }
        tag::FLOAT32_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_f32().map_err(box_err)?);
            }
            Value::Float32Array(out)
        }
        tag::FLOAT64_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_f64().map_err(box_err)?);
            }
            Value::Float64Array(out)
        }
        tag::BOOL_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_u8().map_err(box_err)? != 0);
            }
            Value::BoolArray(out)
        }
        tag::CHAR_ARRAY => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(r.read_u16().map_err(box_err)?);
            }
            Value::CharArray(out)
        }
        tag::SEQ | tag::SET => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(read_value(r, registry, ctx)?);
            }
            if tag == tag::SEQ {
                Value::Seq(out)
            } else {
                Value::Set(out)
            }
        }
        tag::MAP => {
            let len = r.read_u32().map_err(box_err)? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                let k = read_value(r, registry, ctx)?;
                let v = read_value(r, registry, ctx)?;
                out.push((k, v));
            }
            Value::Map(out)
        }
        custom_tag if custom_tag >= CUSTOM_TAG_MIN => {
            let handler = registry
                .handler_for_tag(custom_tag)
                .ok_or_else(|| Box::new(UnknownTagError(custom_tag)) as BoxedError)?;
            // The body is length-prefixed (see `write_custom`), so `read_blob` advances `r`
            // past exactly this value's bytes regardless of what the handler itself
            // consumes internally, leaving any sibling values that follow intact.
            let body = r.read_blob().map_err(box_err)?;
            let decode_nested = |bytes: &[u8]| -> std::result::Result<(Value, usize), BoxedError> {
                let mut nested = Reader::new(bytes);
                let tag = nested.read_u8().map_err(box_err)?;
                let value = read_value_with_tag(tag, &mut nested, registry, ctx)?;
                Ok((value, nested.pos))
            };
            let item = handler.decode(&body, ctx, &decode_nested)?;
            Value::Custom(Custom(item))
        }
        other => return Err(Box::new(UnknownTagError(other))),
    })
}

/// Decode a single value from `bytes`. Any trailing bytes after a custom-tagged value are
/// assumed consumed entirely by its handler, matching how a stored record is always
/// exactly one top-level value.
pub fn decode(
    bytes: &[u8],
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<Value, BoxedError> {
    let mut r = Reader::new(bytes);
    read_value(&mut r, registry, ctx)
}

/// Write the wrapped-record shape directly (tag `0x0C`, count `2`, the `meta` field, then
/// the `value` field) without building an intermediate owned [`Value::Map`]: callers that
/// need `meta`/`value` back afterward only have a borrow to give here, since `Value` has
/// no general `Clone`.
fn write_record(
    w: &mut Writer,
    meta: &Value,
    value: &Value,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<(), WriteError> {
    w.write_u8(tag::MAP)?;
    w.write_u32(2)?;
    write_value(w, &Value::Symbol(Keyword::plain(META_FIELD)), registry, ctx)?;
    write_value(w, meta, registry, ctx)?;
    write_value(w, &Value::Symbol(Keyword::plain(VALUE_FIELD)), registry, ctx)?;
    write_value(w, value, registry, ctx)?;
    Ok(())
}

/// Build the on-disk bytes for a wrapped record: mapping tag `0x0C`, count `2`, the symbol
/// `meta` and its mapping, then the symbol `value` and the user value — the fixed on-disk
/// layout every wrapped-API write commits to. Takes `meta`/`value` by reference so a caller
/// keeps ownership of both afterward.
pub fn encode_record(
    meta: &Value,
    value: &Value,
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
    pool: &BufferPool,
) -> std::result::Result<Vec<u8>, BoxedError> {
    encode_with(pool, |w| write_record(w, meta, value, registry, ctx))
}

/// Fully decode a wrapped record, returning its `(meta, value)` pair. Fails with
/// [`NotWrappedError`] if the decoded shape isn't exactly `{meta, value}` — the signal that
/// `bytes` was written through the raw API instead.
pub fn decode_record(
    bytes: &[u8],
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<(Value, Value), BoxedError> {
    match decode(bytes, registry, ctx)? {
        Value::Map(mut pairs) if pairs.len() == 2 => {
            let (k1, v1) = pairs.pop().unwrap();
            let (k0, v0) = pairs.pop().unwrap();
            if is_field_symbol(&k0, META_FIELD) && is_field_symbol(&k1, VALUE_FIELD) {
                Ok((v0, v1))
            } else {
                let observed_fields = vec![field_name(&k0), field_name(&k1)];
                Err(Box::new(NotWrappedError { observed_fields }))
            }
        }
        Value::Map(pairs) => {
            let observed_fields = pairs.iter().map(|(k, _)| field_name(k)).collect();
            Err(Box::new(NotWrappedError { observed_fields }))
        }
        _ => Err(Box::new(NotWrappedError { observed_fields: Vec::new() })),
    }
}

/// Decode only the `meta` field of a wrapped record, never touching the `value` field's
/// bytes at all. Because a wrapped record's `meta` field is always written first, this
/// reads the outer tag, the pair count, and exactly one key/value pair, then stops: the
/// `value` field's bytes are never visited, so no allocation is ever attributable to it.
///
/// An empty mapping (`count == 0`) returns `Ok(None)`: a valid, if unusual, state distinct
/// from "no record at all" (which callers observe by the key being absent from the
/// database in the first place, never by this function).
pub fn decode_meta_only(
    bytes: &[u8],
    registry: &TypeRegistry,
    ctx: &(dyn Any + Send + Sync),
) -> std::result::Result<Option<Value>, BoxedError> {
    let mut r = Reader::new(bytes);
    let tag = r.read_u8().map_err(box_err)?;
    if tag != tag::MAP {
        return Err(Box::new(NotWrappedError { observed_fields: Vec::new() }));
    }
    let count = r.read_u32().map_err(box_err)?;
    if count == 0 {
        return Ok(None);
    }
    let first_key = read_value(&mut r, registry, ctx)?;
    if !is_field_symbol(&first_key, META_FIELD) {
        return Err(Box::new(NotWrappedError { observed_fields: vec![field_name(&first_key)] }));
    }
    let meta = read_value(&mut r, registry, ctx)?;
    Ok(Some(meta))
}

#[cfg(test)]
mod record_tests {
    use super::*;

    fn empty_registry() -> TypeRegistry {
        TypeRegistry::empty()
    }

    #[test]
    fn round_trips_a_wrapped_record() {
        let registry = empty_registry();
        let ctx: &(dyn Any + Send + Sync) = &();
        let pool = BufferPool::new(4);
        let meta = Value::Map(vec![(
            Value::Keyword(Keyword::plain("type")),
            Value::Keyword(Keyword::plain("edn")),
        )]);
        let bytes = encode_record(&meta, &Value::Int64(42), &registry, ctx, &pool).unwrap();

        let (meta, value) = decode_record(&bytes, &registry, ctx).unwrap();
        assert!(matches!(value, Value::Int64(42)));
        assert!(matches!(meta, Value::Map(ref pairs) if pairs.len() == 1));

        let meta_only = decode_meta_only(&bytes, &registry, ctx).unwrap();
        assert!(meta_only.is_some());
    }

    #[test]
    fn raw_records_are_rejected_as_not_wrapped() {
        let registry = empty_registry();
        let ctx: &(dyn Any + Send + Sync) = &();
        let pool = BufferPool::new(4);
        let bytes = encode(&Value::Int64(7), &registry, ctx, &pool).unwrap();
        assert!(decode_record(&bytes, &registry, ctx).is_err());
        assert!(decode_meta_only(&bytes, &registry, ctx).is_err());
    }

    #[test]
    fn empty_outer_mapping_projects_to_no_meta() {
        let registry = empty_registry();
        let ctx: &(dyn Any + Send + Sync) = &();
        let pool = BufferPool::new(4);
        // An empty outer mapping has no `meta` field to find at all, distinct from a
        // record whose `meta` field is itself present but an empty map.
        let bytes = encode(&Value::Map(Vec::new()), &registry, ctx, &pool).unwrap();
        assert!(decode_meta_only(&bytes, &registry, ctx).unwrap().is_none());
    }

    #[test]
    fn meta_present_as_empty_map_is_some_empty_map() {
        let registry = empty_registry();
        let ctx: &(dyn Any + Send + Sync) = &();
        let pool = BufferPool::new(4);
        let bytes =
            encode_record(&Value::Map(Vec::new()), &Value::Nil, &registry, ctx, &pool).unwrap();
        let meta = decode_meta_only(&bytes, &registry, ctx).unwrap();
        assert!(matches!(meta, Some(Value::Map(ref pairs)) if pairs.is_empty()));
    }

    struct Marker(i32);

    struct MarkerHandler;

    impl konserve_traits::TypeHandler for MarkerHandler {
        fn tag(&self) -> u8 {
            CUSTOM_TAG_MIN
        }

        fn type_id(&self) -> std::any::TypeId {
            std::any::TypeId::of::<Marker>()
        }

        fn handles(&self, item: &(dyn Any + Send + Sync)) -> bool {
            item.downcast_ref::<Marker>().is_some()
        }

        fn encode(
            &self,
            item: &(dyn Any + Send + Sync),
            _ctx: &(dyn Any + Send + Sync),
            encode_nested: &konserve_traits::NestedEncode<'_>,
        ) -> std::result::Result<Vec<u8>, BoxedError> {
            encode_nested(&Value::Int32(item.downcast_ref::<Marker>().unwrap().0))
        }

        fn decode(
            &self,
            bytes: &[u8],
            _ctx: &(dyn Any + Send + Sync),
            decode_nested: &konserve_traits::NestedDecode<'_>,
        ) -> std::result::Result<Box<dyn Any + Send + Sync>, BoxedError> {
            let (value, _) = decode_nested(bytes)?;
            let Value::Int32(n) = value else { return Err("expected an int32".into()) };
            Ok(Box::new(Marker(n)))
        }
    }

    #[test]
    fn a_custom_value_followed_by_a_sibling_does_not_swallow_the_sibling() {
        // Regression test: a custom-tagged value used to hand its decoder "every byte left
        // in the whole buffer" and then unconditionally jump the cursor to the end,
        // corrupting whatever followed it. Length-prefixing the handler's body (like every
        // other blob) lets the decoder skip exactly the bytes that belong to it.
        let registry =
            TypeRegistry::new(vec![Box::new(MarkerHandler)], Box::new(())).unwrap();
        let ctx: &(dyn Any + Send + Sync) = &();
        let pool = BufferPool::new(4);

        let seq = Value::Seq(vec![
            Value::Custom(Custom::new(Marker(11))),
            Value::Custom(Custom::new(Marker(22))),
            Value::Str("trailing".into()),
        ]);
        let bytes = encode(&seq, &registry, ctx, &pool).unwrap();
        let Value::Seq(items) = decode(&bytes, &registry, ctx).unwrap() else {
            panic!("expected a seq back")
        };
        assert_eq!(items.len(), 3);
        let marker_at = |i: usize| {
            let Value::Custom(c) = &items[i] else { panic!("expected a custom value") };
            c.downcast_ref::<Marker>().unwrap().0
        };
        assert_eq!(marker_at(0), 11);
        assert_eq!(marker_at(1), 22);
        assert!(matches!(&items[2], Value::Str(s) if s == "trailing"));
    }
}
