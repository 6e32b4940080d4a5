use mapping_runtime_common::RuntimeError;

use crate::memory::{MemoryManager, protocol_violation};
use crate::object::{AscObject, RuntimeTypeId};
use crate::value::{Pointer, Scalar};

/// Size of the `{buffer, dataStart, byteLength, length}` array header.
const HEADER_SIZE: usize = 16;

/// Decoded array header. `byte_len` is the capacity of the data block,
/// which a growable guest array may keep larger than its length.
struct ArrayHeader {
    data: Pointer,
    byte_len: u32,
    count: u32,
}

impl ArrayHeader {
    fn encode(data: Pointer, byte_len: u32, count: u32) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        data.write_le(&mut header[0..4]);
        data.write_le(&mut header[4..8]);
        byte_len.write_le(&mut header[8..12]);
        count.write_le(&mut header[12..16]);
        header
    }

    fn read(mm: &MemoryManager<'_>, ptr: Pointer, element_size: usize) -> Result<Self, RuntimeError> {
        let mut raw = [0u8; HEADER_SIZE];
        mm.read_into(ptr, &mut raw)?;
        let header = Self {
            data: Pointer::read_le(&raw[4..8]),
            byte_len: u32::read_le(&raw[8..12]),
            count: u32::read_le(&raw[12..16]),
        };
        if u64::from(header.byte_len) < u64::from(header.count) * element_size as u64 {
            return Err(protocol_violation(format!(
                "array at {ptr} has {} bytes for {} elements of {element_size} bytes",
                header.byte_len, header.count
            )));
        }
        Ok(header)
    }

    /// Bytes holding the `count` live elements.
    fn element_bytes(&self, element_size: usize) -> usize {
        self.count as usize * element_size
    }
}

fn dump_elements(
    mm: &mut MemoryManager<'_>,
    data: &[u8],
    count: usize,
    data_tag: RuntimeTypeId,
    header_tag: RuntimeTypeId,
) -> Result<Pointer, RuntimeError> {
    let byte_len =
        u32::try_from(data.len()).map_err(|_| protocol_violation("array exceeds 4 GiB"))?;
    let count = u32::try_from(count).map_err(|_| protocol_violation("array exceeds 4 GiB"))?;

    let data_ptr = mm.new_memory(data, data_tag)?;
    mm.new_memory(&ArrayHeader::encode(data_ptr, byte_len, count), header_tag)
}

/// A guest array of fixed-width scalars stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct AscArray<T: Scalar>(Option<Vec<T>>);

impl<T: Scalar> AscArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self(Some(elements))
    }

    /// The nil array.
    pub const fn nil() -> Self {
        Self(None)
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_none()
    }

    /// The elements; empty for nil.
    pub fn as_slice(&self) -> &[T] {
        self.0.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.0.unwrap_or_default()
    }
}

impl<T: Scalar> Default for AscArray<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: Scalar> From<Vec<T>> for AscArray<T> {
    fn from(elements: Vec<T>) -> Self {
        Self::new(elements)
    }
}

impl<T: Scalar> AscObject for AscArray<T> {
    fn dump(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        let Some(elements) = &self.0 else {
            return Ok(Pointer::NULL);
        };
        let size = T::KIND.size();
        let mut data = vec![0u8; elements.len() * size];
        for (element, slot) in elements.iter().zip(data.chunks_exact_mut(size)) {
            element.write_le(slot);
        }
        dump_elements(
            mm,
            &data,
            elements.len(),
            RuntimeTypeId::ScalarArrayData,
            RuntimeTypeId::ScalarArrayHeader,
        )
    }

    fn load(&mut self, mm: &mut MemoryManager<'_>, ptr: Pointer) -> Result<(), RuntimeError> {
        let size = T::KIND.size();
        let header = ArrayHeader::read(mm, ptr, size)?;
        let data = mm.read(header.data, header.element_bytes(size))?;
        self.0 = Some(data.chunks_exact(size).map(T::read_le).collect());
        Ok(())
    }
}

/// A guest array of object pointers. Nil elements are stored as 0 and load
/// back as nil, in place.
#[derive(Debug, Clone, PartialEq)]
pub struct AscObjectArray<T: AscObject + Default>(Option<Vec<T>>);

impl<T: AscObject + Default> AscObjectArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self(Some(elements))
    }

    /// The nil array.
    pub const fn nil() -> Self {
        Self(None)
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_none()
    }

    /// The elements; empty for nil.
    pub fn as_slice(&self) -> &[T] {
        self.0.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.0.unwrap_or_default()
    }
}

impl<T: AscObject + Default> Default for AscObjectArray<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: AscObject + Default> From<Vec<T>> for AscObjectArray<T> {
    fn from(elements: Vec<T>) -> Self {
        Self::new(elements)
    }
}

impl<T: AscObject + Default + 'static> AscObject for AscObjectArray<T> {
    fn dump(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        let Some(elements) = &self.0 else {
            return Ok(Pointer::NULL);
        };
        let mut data = vec![0u8; elements.len() * 4];
        for (element, slot) in elements.iter().zip(data.chunks_exact_mut(4)) {
            element.dump(mm)?.write_le(slot);
        }
        dump_elements(
            mm,
            &data,
            elements.len(),
            RuntimeTypeId::ObjectArrayData,
            RuntimeTypeId::ObjectArrayHeader,
        )
    }

    fn load(&mut self, mm: &mut MemoryManager<'_>, ptr: Pointer) -> Result<(), RuntimeError> {
        let header = ArrayHeader::read(mm, ptr, 4)?;
        let data = mm.read(header.data, header.element_bytes(4))?;
        let elements = data
            .chunks_exact(4)
            .map(|raw| mm.load_object::<T>(Pointer::read_le(raw)))
            .collect::<Result<Vec<T>, RuntimeError>>()?;
        self.0 = Some(elements);
        Ok(())
    }
}
