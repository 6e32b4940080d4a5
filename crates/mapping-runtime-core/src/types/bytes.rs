use std::fmt::{self, Write as _};

use mapping_runtime_common::RuntimeError;
use thiserror::Error;

use crate::memory::{MemoryManager, protocol_violation};
use crate::object::{AscObject, RuntimeTypeId};
use crate::value::{Pointer, Scalar};

/// Size of the `{buffer, dataStart, byteLength}` view header.
const HEADER_SIZE: usize = 12;

/// A guest byte array.
///
/// The bytes live in a flat allocation with no object header. The object
/// itself is a 12-byte view `{buffer, dataStart, byteLength}` tagged
/// [`RuntimeTypeId::ByteArrayHeader`], where both pointers name the data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteArray(Option<Vec<u8>>);

/// Hex decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("hex string has odd length {0}")]
    OddLength(usize),

    #[error("invalid hex digit {found:?} at position {position}")]
    InvalidDigit { position: usize, found: char },
}

impl ByteArray {
    /// Create a non-nil byte array.
    ///
    /// # Arguments
    ///
    /// * `bytes` - The contents; an empty array is still distinct from nil
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Some(bytes.into()))
    }

    /// The nil byte array.
    pub const fn nil() -> Self {
        Self(None)
    }

    /// Whether this is the nil array, which dumps as pointer 0.
    pub fn is_nil(&self) -> bool {
        self.0.is_none()
    }

    /// The bytes; empty for nil.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_deref().unwrap_or_default()
    }

    /// Number of bytes; 0 for nil.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether there are no bytes. Nil arrays are empty.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Consume the array and return its bytes.
    ///
    /// # Returns
    ///
    /// The owned bytes, or an empty `Vec` for nil.
    pub fn into_vec(self) -> Vec<u8> {
        self.0.unwrap_or_default()
    }

    /// Encode as lowercase hex.
    ///
    /// # Returns
    ///
    /// The digits with a `0x` prefix; `"0x"` for empty and nil arrays.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(2 + self.len() * 2);
        out.push_str("0x");
        for byte in self.as_slice() {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Parse hex text into a non-nil byte array.
    ///
    /// # Arguments
    ///
    /// * `text` - Hex digits in either case, with an optional `0x` or `0X` prefix
    ///
    /// # Errors
    ///
    /// Returns [`HexError::OddLength`] for an odd number of digits and
    /// [`HexError::InvalidDigit`] with the offending position in `text`.
    pub fn from_hex(text: &str) -> Result<Self, HexError> {
        let (offset, digits) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(rest) => (2, rest),
            None => (0, text),
        };
        if digits.len() % 2 != 0 {
            return Err(HexError::OddLength(digits.len()));
        }

        let nibble = |position: usize, c: u8| {
            char::from(c)
                .to_digit(16)
                .and_then(|d| u8::try_from(d).ok())
                .ok_or(HexError::InvalidDigit {
                    position: offset + position,
                    found: char::from(c),
                })
        };

        let bytes = digits
            .as_bytes()
            .chunks_exact(2)
            .enumerate()
            .map(|(i, pair)| Ok((nibble(2 * i, pair[0])? << 4) | nibble(2 * i + 1, pair[1])?))
            .collect::<Result<Vec<u8>, HexError>>()?;
        Ok(Self::new(bytes))
    }
}

impl From<Vec<u8>> for ByteArray {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for ByteArray {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Display for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AscObject for ByteArray {
    fn dump(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        let Some(bytes) = &self.0 else {
            return Ok(Pointer::NULL);
        };
        let len = u32::try_from(bytes.len())
            .map_err(|_| protocol_violation("byte array exceeds 4 GiB"))?;

        // A zero-byte request would only probe the allocator.
        let data = mm.allocate(len.max(1))?;
        mm.write(data, bytes)?;

        let mut header = [0u8; HEADER_SIZE];
        data.write_le(&mut header[0..4]);
        data.write_le(&mut header[4..8]);
        len.write_le(&mut header[8..12]);
        mm.new_memory(&header, RuntimeTypeId::ByteArrayHeader)
    }

    fn load(&mut self, mm: &mut MemoryManager<'_>, ptr: Pointer) -> Result<(), RuntimeError> {
        let mut header = [0u8; HEADER_SIZE];
        mm.read_into(ptr, &mut header)?;
        let data = Pointer::read_le(&header[4..8]);
        let len = u32::read_le(&header[8..12]);
        self.0 = Some(mm.read(data, len as usize)?);
        Ok(())
    }
}
