// MessagePack decoder: one value per call, cursor only moves forward.
//
// Dispatch is driven by the leading byte. Scalars are decoded here directly;
// strings, binaries, arrays and maps are handed to a `DecodeContext` so the
// caller decides what aggregates turn into (plain values or graph nodes).
//
// 64-bit integers are decoded exactly. Strings are returned as Rust `String`s,
// so 4-byte UTF-8 sequences decode to the exact code point; callers that need
// UTF-16 can use `str::encode_utf16` to obtain the surrogate pair.

use thiserror::Error;

use super::value::Value;

/// Default limit for nested arrays/maps.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A string payload contained a byte that cannot start (or continue) a
    /// UTF-8 sequence.
    #[error("invalid byte {0:#04x} in UTF-8 string")]
    InvalidByte(u8),
    /// No decode rule exists for this leading byte.
    #[error("could not parse tag {0:#04x}")]
    UnparseableTag(u8),
    #[error("unexpected end of input at offset {offset}: {needed} more bytes needed")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("nesting exceeds {0} levels")]
    DepthLimit(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A `DecodeContext` refused the value it was handed.
    #[error("value rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Decode context
// ---------------------------------------------------------------------------

/// Decides what strings, binaries and aggregates become.
///
/// Scalars (nil, booleans, numbers, extensions, timestamps) are always
/// decoded by the reader and passed through `scalar`. Aggregate hooks receive
/// the reader positioned at the first element and must consume exactly
/// `len` elements (or `len` key/value pairs for maps).
pub trait DecodeContext {
    type Output;

    fn scalar(&mut self, value: Value) -> Result<Self::Output, DecodeError>;

    fn read_string(&mut self, value: String) -> Result<Self::Output, DecodeError>;

    fn read_binary(&mut self, bytes: &[u8]) -> Result<Self::Output, DecodeError>;

    fn read_array(
        &mut self,
        reader: &mut Reader<'_>,
        len: usize,
    ) -> Result<Self::Output, DecodeError>;

    fn read_map(&mut self, reader: &mut Reader<'_>, len: usize)
    -> Result<Self::Output, DecodeError>;
}

/// Decodes into plain `Value` trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainContext;

impl DecodeContext for PlainContext {
    type Output = Value;

    fn scalar(&mut self, value: Value) -> Result<Value, DecodeError> {
        Ok(value)
    }

    fn read_string(&mut self, value: String) -> Result<Value, DecodeError> {
        Ok(Value::Str(value))
    }

    fn read_binary(&mut self, bytes: &[u8]) -> Result<Value, DecodeError> {
        Ok(Value::Bin(bytes.to_vec()))
    }

    fn read_array(&mut self, reader: &mut Reader<'_>, len: usize) -> Result<Value, DecodeError> {
        // Every element takes at least one byte; cap the pre-allocation so a
        // bogus length cannot reserve more than the input could hold.
        let mut items = Vec::with_capacity(len.min(reader.remaining()));
        for _ in 0..len {
            items.push(reader.read_with(self)?);
        }
        Ok(Value::Array(items))
    }

    fn read_map(&mut self, reader: &mut Reader<'_>, len: usize) -> Result<Value, DecodeError> {
        let mut pairs = Vec::with_capacity(len.min(reader.remaining() / 2));
        for _ in 0..len {
            let key = reader.read_with(self)?;
            let value = reader.read_with(self)?;
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Forward-only cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_offset(bytes, 0)
    }

    /// Start reading at `offset` instead of the beginning of `bytes`.
    pub fn with_offset(bytes: &'a [u8], offset: usize) -> Self {
        Self {
            bytes,
            offset,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Current cursor position.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The next byte, without consuming it.
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.offset).copied()
    }

    /// True if the next byte starts a string (fixstr, str8/16/32).
    #[inline]
    pub fn is_string(&self) -> bool {
        string_check(self.bytes, self.offset)
    }

    /// True if the next byte starts an integer or float.
    #[inline]
    pub fn is_number(&self) -> bool {
        int_check(self.bytes, self.offset)
    }

    // -- raw reads ---------------------------------------------------------

    #[inline]
    fn ensure(&self, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            Err(DecodeError::UnexpectedEof {
                offset: self.offset,
                needed: n - self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        let v = self.bytes[self.offset];
        self.offset += 1;
        Ok(v)
    }

    /// Consume `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(n)?;
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    #[inline]
    fn read_array_of<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    #[inline]
    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array_of()?))
    }

    #[inline]
    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array_of()?))
    }

    #[inline]
    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.read_array_of()?))
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, DecodeError> {
        let bytes = self.read_bytes(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(e) => Err(DecodeError::InvalidByte(bytes[e.valid_up_to()])),
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        if self.depth >= self.max_depth {
            return Err(DecodeError::DepthLimit(self.max_depth));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn read_ext<C: DecodeContext>(
        &mut self,
        ctx: &mut C,
        len: usize,
    ) -> Result<C::Output, DecodeError> {
        let ext_type = self.read_u8()? as i8;
        let payload = self.read_bytes(len)?;
        ctx.scalar(Value::Ext(ext_type, payload.to_vec()))
    }

    // -- typed reads -------------------------------------------------------

    /// Decode the next value into a plain `Value`.
    pub fn read_value(&mut self) -> Result<Value, DecodeError> {
        self.read_with(&mut PlainContext)
    }

    /// Decode a string-class value. Fails with `UnparseableTag` if the next
    /// byte is not a string tag.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let prefix = self.read_u8()?;
        let len = match prefix {
            0xa0..=0xbf => (prefix & 0x1f) as usize,
            0xd9 => self.read_u8()? as usize,
            0xda => self.read_u16()? as usize,
            0xdb => self.read_u32()? as usize,
            other => return Err(DecodeError::UnparseableTag(other)),
        };
        self.read_utf8(len)
    }

    /// Decode an integer or float. Fails with `UnparseableTag` for any other
    /// class of value.
    pub fn read_number(&mut self) -> Result<Value, DecodeError> {
        match self.peek() {
            Some(b) if !int_check(&[b], 0) && b < 0xe0 => Err(DecodeError::UnparseableTag(b)),
            _ => self.read_value(),
        }
    }

    /// Decode the next value through `ctx`.
    pub fn read_with<C: DecodeContext>(&mut self, ctx: &mut C) -> Result<C::Output, DecodeError> {
        let prefix = self.read_u8()?;

        if prefix < 0xc0 {
            // positive fixint
            if prefix < 0x80 {
                return ctx.scalar(Value::Int(i64::from(prefix)));
            }
            // fixmap
            if prefix < 0x90 {
                let len = (prefix & 0x0f) as usize;
                return self.nested(|r| ctx.read_map(r, len));
            }
            // fixarray
            if prefix < 0xa0 {
                let len = (prefix & 0x0f) as usize;
                return self.nested(|r| ctx.read_array(r, len));
            }
            // fixstr
            let s = self.read_utf8((prefix & 0x1f) as usize)?;
            return ctx.read_string(s);
        }

        // negative fixint
        if prefix > 0xdf {
            return ctx.scalar(Value::Int(i64::from(prefix as i8)));
        }

        match prefix {
            0xc0 => ctx.scalar(Value::Nil),
            0xc2 => ctx.scalar(Value::Bool(false)),
            0xc3 => ctx.scalar(Value::Bool(true)),

            // bin 8/16/32
            0xc4 => {
                let len = self.read_u8()? as usize;
                ctx.read_binary(self.read_bytes(len)?)
            }
            0xc5 => {
                let len = self.read_u16()? as usize;
                ctx.read_binary(self.read_bytes(len)?)
            }
            0xc6 => {
                let len = self.read_u32()? as usize;
                ctx.read_binary(self.read_bytes(len)?)
            }

            // ext 8/16/32
            0xc7 => {
                let len = self.read_u8()? as usize;
                self.read_ext(ctx, len)
            }
            0xc8 => {
                let len = self.read_u16()? as usize;
                self.read_ext(ctx, len)
            }
            0xc9 => {
                let len = self.read_u32()? as usize;
                self.read_ext(ctx, len)
            }

            // float 32/64
            0xca => {
                let v = f32::from_be_bytes(self.read_array_of()?);
                ctx.scalar(Value::Float(f64::from(v)))
            }
            0xcb => {
                let v = f64::from_be_bytes(self.read_array_of()?);
                ctx.scalar(Value::Float(v))
            }

            // uint 8/16/32/64
            0xcc => {
                let v = self.read_u8()?;
                ctx.scalar(Value::Int(i64::from(v)))
            }
            0xcd => {
                let v = self.read_u16()?;
                ctx.scalar(Value::Int(i64::from(v)))
            }
            0xce => {
                let v = self.read_u32()?;
                ctx.scalar(Value::Int(i64::from(v)))
            }
            0xcf => {
                let v = self.read_u64()?;
                match i64::try_from(v) {
                    Ok(i) => ctx.scalar(Value::Int(i)),
                    Err(_) => ctx.scalar(Value::UInt(v)),
                }
            }

            // int 8/16/32/64
            0xd0 => {
                let v = i8::from_be_bytes(self.read_array_of()?);
                ctx.scalar(Value::Int(i64::from(v)))
            }
            0xd1 => {
                let v = i16::from_be_bytes(self.read_array_of()?);
                ctx.scalar(Value::Int(i64::from(v)))
            }
            0xd2 => {
                let v = i32::from_be_bytes(self.read_array_of()?);
                ctx.scalar(Value::Int(i64::from(v)))
            }
            0xd3 => {
                let v = i64::from_be_bytes(self.read_array_of()?);
                ctx.scalar(Value::Int(v))
            }

            // fixext 1/2/4/8/16
            0xd4 => self.read_ext(ctx, 1),
            0xd5 => self.read_ext(ctx, 2),
            0xd6 => self.read_ext(ctx, 4),
            0xd7 => {
                if self.peek() == Some(0x00) {
                    self.offset += 1;
                    let hi = u64::from(self.read_u32()?);
                    let lo = u64::from(self.read_u32()?);
                    return ctx.scalar(Value::Timestamp((hi << 32) | lo));
                }
                self.read_ext(ctx, 8)
            }
            0xd8 => self.read_ext(ctx, 16),

            // str 8/16/32
            0xd9 => {
                let len = self.read_u8()? as usize;
                let s = self.read_utf8(len)?;
                ctx.read_string(s)
            }
            0xda => {
                let len = self.read_u16()? as usize;
                let s = self.read_utf8(len)?;
                ctx.read_string(s)
            }
            0xdb => {
                let len = self.read_u32()? as usize;
                let s = self.read_utf8(len)?;
                ctx.read_string(s)
            }

            // array 16/32
            0xdc => {
                let len = self.read_u16()? as usize;
                self.nested(|r| ctx.read_array(r, len))
            }
            0xdd => {
                let len = self.read_u32()? as usize;
                self.nested(|r| ctx.read_array(r, len))
            }

            // map 16/32
            0xde => {
                let len = self.read_u16()? as usize;
                self.nested(|r| ctx.read_map(r, len))
            }
            0xdf => {
                let len = self.read_u32()? as usize;
                self.nested(|r| ctx.read_map(r, len))
            }

            // 0xc1 (never used) lands here.
            other => Err(DecodeError::UnparseableTag(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Free functions over (bytes, cursor)
// ---------------------------------------------------------------------------

/// Decode one value at `*offset`, advancing it past the value.
///
/// On error the cursor is left where it was.
pub fn decode(bytes: &[u8], offset: &mut usize) -> Result<Value, DecodeError> {
    decode_with(bytes, offset, &mut PlainContext)
}

/// Decode one value at `*offset` through `ctx`, advancing it past the value.
pub fn decode_with<C: DecodeContext>(
    bytes: &[u8],
    offset: &mut usize,
    ctx: &mut C,
) -> Result<C::Output, DecodeError> {
    let mut reader = Reader::with_offset(bytes, *offset);
    let out = reader.read_with(ctx)?;
    *offset = reader.offset();
    Ok(out)
}

/// True if the byte at `offset` is a string tag. Never advances.
pub fn string_check(bytes: &[u8], offset: usize) -> bool {
    matches!(bytes.get(offset), Some(0xa0..=0xbf | 0xd9 | 0xda | 0xdb))
}

/// True if the byte at `offset` is a positive fixint, float or sized integer
/// tag. Negative fixints are not included. Never advances.
pub fn int_check(bytes: &[u8], offset: usize) -> bool {
    matches!(bytes.get(offset), Some(0x00..=0x7f | 0xca..=0xd3))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
