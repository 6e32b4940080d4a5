use std::fmt;

use mapping_runtime_common::RuntimeError;

use crate::memory::{MemoryManager, protocol_violation};
use crate::object::{AscObject, RuntimeTypeId};
use crate::value::Pointer;

/// A guest string: UTF-16LE code units in an object tagged
/// [`RuntimeTypeId::String`].
///
/// The byte length lives in the header word just before the data. The nil
/// string (pointer 0) reads as empty text but stays distinct from `""` so it
/// dumps back to 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AscString(Option<String>);

impl AscString {
    /// Create a non-nil string.
    ///
    /// # Arguments
    ///
    /// * `text` - The text; an empty string is still distinct from nil
    pub fn new(text: impl Into<String>) -> Self {
        Self(Some(text.into()))
    }

    /// The nil string.
    pub const fn nil() -> Self {
        Self(None)
    }

    /// Whether this is the nil string, which dumps as pointer 0.
    pub fn is_nil(&self) -> bool {
        self.0.is_none()
    }

    /// The text; empty for nil.
    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or_default()
    }

    /// Number of UTF-16 code units, as the guest counts string length.
    pub fn utf16_len(&self) -> usize {
        self.as_str().encode_utf16().count()
    }

    /// Consume the string and return the text.
    ///
    /// # Returns
    ///
    /// The owned text, or an empty `String` for nil.
    pub fn into_string(self) -> String {
        self.0.unwrap_or_default()
    }
}

impl From<&str> for AscString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for AscString {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for AscString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AscObject for AscString {
    fn dump(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        let Some(text) = &self.0 else {
            return Ok(Pointer::NULL);
        };
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        mm.new_memory(&bytes, RuntimeTypeId::String)
    }

    fn load(&mut self, mm: &mut MemoryManager<'_>, ptr: Pointer) -> Result<(), RuntimeError> {
        let bytes = mm.object_body(ptr)?;
        if bytes.len() % 2 != 0 {
            return Err(protocol_violation(format!(
                "string at {ptr} has odd byte length {}",
                bytes.len()
            )));
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.0 = Some(String::from_utf16_lossy(&units));
        Ok(())
    }
}
