//! Guest linear-memory access and allocation.
//!
//! A [`MemoryManager`] is a short-lived view pairing one instance's
//! [`MemoryBinding`] (its exported memory and allocator) with mutable access to
//! the store that owns them. It is created per export call or import call and
//! dropped before control returns to the guest.
//!
//! # Block layout
//!
//! ```text
//!  ptr-20        ptr-16                                  ptr
//!  +-------------+-------+-------+-----------+-----------+----------------
//!  | block size  |   0   |   0   |   rtId    |  rtSize   | payload ...
//!  +-------------+-------+-------+-----------+-----------+----------------
//!   written by     object header written by the host
//!   the allocator
//! ```

use mapping_runtime_common::RuntimeError;
use tracing::error;
use wasmtime::{AsContextMut, Memory, StoreContextMut, TypedFunc};

use crate::object::{AscObject, RuntimeTypeId};
use crate::store::HostState;
use crate::value::{Pointer, Scalar};

/// Size of the object header that precedes every host-built object.
pub const OBJECT_HEADER_SIZE: u32 = 16;

/// The guest exports the memory manager drives.
#[derive(Clone)]
pub struct MemoryBinding {
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
}

impl std::fmt::Debug for MemoryBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBinding")
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl MemoryBinding {
    /// Bind a linear memory and the allocator export that manages it.
    pub fn new(memory: Memory, allocate: TypedFunc<i32, i32>) -> Self {
        Self { memory, allocate }
    }

    /// The guest's linear memory.
    pub fn memory(&self) -> Memory {
        self.memory
    }
}

/// Reads, writes, and allocates in one instance's linear memory.
pub struct MemoryManager<'a> {
    binding: MemoryBinding,
    store: StoreContextMut<'a, HostState>,
}

impl<'a> MemoryManager<'a> {
    /// Create a manager over `store` using the exports in `binding`.
    pub fn new(binding: MemoryBinding, store: StoreContextMut<'a, HostState>) -> Self {
        Self { binding, store }
    }

    /// Create a manager from the memory binding recorded in the store.
    ///
    /// Fails if the instance has not finished binding its exports.
    pub fn from_store(store: StoreContextMut<'a, HostState>) -> Result<Self, RuntimeError> {
        let binding = store.data().memory.clone().ok_or_else(|| {
            protocol_violation("guest memory accessed before the instance bound its exports")
        })?;
        Ok(Self::new(binding, store))
    }

    /// Direct view of linear memory; address 0 is the first byte.
    pub fn memory(&self) -> &[u8] {
        self.binding.memory.data(&self.store)
    }

    /// Host state of the owning store.
    pub fn state(&self) -> &HostState {
        self.store.data()
    }

    /// Mutable access to the owning store, for invoking guest functions.
    pub fn store(&mut self) -> StoreContextMut<'_, HostState> {
        self.store.as_context_mut()
    }

    /// Allocate `size` payload bytes with the guest allocator.
    ///
    /// A zero-size request does not advance the allocator and returns its
    /// current position; see [`MemoryManager::heap_position`].
    pub fn allocate(&mut self, size: u32) -> Result<Pointer, RuntimeError> {
        let request = i32::try_from(size)
            .map_err(|_| protocol_violation(format!("allocation of {size} bytes is too large")))?;

        let raw = self
            .binding
            .allocate
            .call(&mut self.store, request)
            .map_err(|e| protocol_violation(format!("guest allocate({size}) failed: {e:#}")))?;

        #[allow(clippy::cast_sign_loss)]
        let ptr = Pointer::new(raw as u32);
        if size > 0 && ptr.is_null() {
            return Err(protocol_violation(format!(
                "guest allocate({size}) returned a null pointer"
            )));
        }
        Ok(ptr)
    }

    /// Current bump-pointer position of the guest allocator, in bytes.
    ///
    /// Relies on the allocator treating a 0-byte request as a pure query.
    pub fn heap_position(&mut self) -> Result<u64, RuntimeError> {
        Ok(u64::from(self.allocate(0)?.offset()))
    }

    /// Allocate an object block, write its 16-byte header and `payload`, and
    /// return the address just past the header.
    pub fn new_memory(
        &mut self,
        payload: &[u8],
        type_id: RuntimeTypeId,
    ) -> Result<Pointer, RuntimeError> {
        let size = u32::try_from(payload.len())
            .map_err(|_| protocol_violation("object payload exceeds 4 GiB"))?;
        let total = size
            .checked_add(OBJECT_HEADER_SIZE)
            .ok_or_else(|| protocol_violation("object payload exceeds 4 GiB"))?;

        let block = self.allocate(total)?;

        let mut header = [0u8; OBJECT_HEADER_SIZE as usize];
        type_id.id().write_le(&mut header[8..12]);
        size.write_le(&mut header[12..16]);
        self.write(block, &header)?;

        let ptr = block.add(OBJECT_HEADER_SIZE);
        self.write(ptr, payload)?;
        Ok(ptr)
    }

    /// Payload size recorded in the object header of `ptr`.
    pub fn object_size(&self, ptr: Pointer) -> Result<u32, RuntimeError> {
        let size_word = ptr
            .checked_sub(4)
            .ok_or_else(|| protocol_violation(format!("object pointer {ptr} has no header")))?;
        self.read_u32(size_word)
    }

    /// Read the whole payload of the object at `ptr`, as sized by its header.
    ///
    /// The runtime type id is not checked: it belongs to the guest runtime.
    pub fn object_body(&self, ptr: Pointer) -> Result<Vec<u8>, RuntimeError> {
        let size = self.object_size(ptr)?;
        self.read(ptr, size as usize)
    }

    /// Copy `len` bytes starting at `ptr`.
    ///
    /// The range is checked against the memory size before anything is
    /// allocated, so a corrupt length word cannot force a huge buffer.
    pub fn read(&self, ptr: Pointer, len: usize) -> Result<Vec<u8>, RuntimeError> {
        let start = ptr.offset() as usize;
        start
            .checked_add(len)
            .and_then(|end| self.memory().get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                protocol_violation(format!("read of {len} bytes at {ptr} is out of bounds"))
            })
    }

    /// Fill `buf` from memory starting at `ptr`.
    pub fn read_into(&self, ptr: Pointer, buf: &mut [u8]) -> Result<(), RuntimeError> {
        self.binding
            .memory
            .read(&self.store, ptr.offset() as usize, buf)
            .map_err(|_| {
                protocol_violation(format!(
                    "read of {} bytes at {ptr} is out of bounds",
                    buf.len()
                ))
            })
    }

    /// Copy `bytes` into memory starting at `ptr`.
    pub fn write(&mut self, ptr: Pointer, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.binding
            .memory
            .write(&mut self.store, ptr.offset() as usize, bytes)
            .map_err(|_| {
                protocol_violation(format!(
                    "write of {} bytes at {ptr} is out of bounds",
                    bytes.len()
                ))
            })
    }

    /// Read one little-endian scalar.
    pub fn read_scalar<T: Scalar>(&self, ptr: Pointer) -> Result<T, RuntimeError> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..T::KIND.size()];
        self.read_into(ptr, buf)?;
        Ok(T::read_le(buf))
    }

    /// Write one little-endian scalar.
    pub fn write_scalar<T: Scalar>(&mut self, ptr: Pointer, value: T) -> Result<(), RuntimeError> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..T::KIND.size()];
        value.write_le(buf);
        self.write(ptr, buf)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&self, ptr: Pointer) -> Result<u32, RuntimeError> {
        self.read_scalar(ptr)
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, ptr: Pointer, value: u32) -> Result<(), RuntimeError> {
        self.write_scalar(ptr, value)
    }

    /// Serialize any object; nil objects yield [`Pointer::NULL`].
    pub fn dump_object(&mut self, object: &dyn AscObject) -> Result<Pointer, RuntimeError> {
        object.dump(self)
    }

    /// Load an object of type `T`. A null pointer yields the nil value and
    /// never touches memory.
    pub fn load_object<T: AscObject + Default>(&mut self, ptr: Pointer) -> Result<T, RuntimeError> {
        let mut object = T::default();
        self.load_into(ptr, &mut object)?;
        Ok(object)
    }

    /// Populate `object` from `ptr`, leaving it untouched for a null pointer.
    pub fn load_into(
        &mut self,
        ptr: Pointer,
        object: &mut dyn AscObject,
    ) -> Result<(), RuntimeError> {
        if ptr.is_null() {
            return Ok(());
        }
        object.load(self, ptr)
    }
}

impl std::fmt::Debug for MemoryManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("instance", &self.store.data().instance_name)
            .field("memory_size", &self.binding.memory.data_size(&self.store))
            .finish_non_exhaustive()
    }
}

pub(crate) fn protocol_violation(reason: impl Into<String>) -> RuntimeError {
    let reason = reason.into();
    error!(%reason, "Guest memory protocol violation");
    RuntimeError::protocol_violation(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::with_memory;
    use crate::types::AscString;

    #[test]
    fn test_zero_size_allocate_is_a_probe() {
        with_memory(|mm| {
            let before = mm.heap_position().unwrap();
            assert_eq!(mm.heap_position().unwrap(), before);

            let ptr = mm.allocate(10).unwrap();
            assert!(u64::from(ptr.offset()) >= before);
            assert_eq!(ptr.offset() % 8, 0);
            assert_eq!(mm.read_u32(ptr.checked_sub(4).unwrap()).unwrap(), 10);
            assert_eq!(mm.heap_position().unwrap(), u64::from(ptr.offset()) + 10);
        });
    }

    #[test]
    fn test_new_memory_writes_object_header() {
        with_memory(|mm| {
            let ptr = mm
                .new_memory(&[1, 2, 3], RuntimeTypeId::ScalarArrayData)
                .unwrap();

            let header = mm.read(ptr.checked_sub(16).unwrap(), 16).unwrap();
            assert_eq!(&header[0..8], &[0; 8]);
            assert_eq!(u32::read_le(&header[8..12]), RuntimeTypeId::ScalarArrayData.id());
            assert_eq!(u32::read_le(&header[12..16]), 3);
            assert_eq!(mm.object_body(ptr).unwrap(), vec![1, 2, 3]);

            // Block size header written by the allocator covers header + payload.
            assert_eq!(mm.read_u32(ptr.checked_sub(20).unwrap()).unwrap(), 19);
        });
    }

    #[test]
    fn test_scalar_access() {
        with_memory(|mm| {
            let ptr = mm.allocate(8).unwrap();
            mm.write_scalar(ptr, -5_i64).unwrap();
            assert_eq!(mm.read_scalar::<i64>(ptr).unwrap(), -5);
            assert_eq!(mm.memory()[ptr.offset() as usize], 0xfb);
        });
    }

    #[test]
    fn test_out_of_bounds_is_protocol_violation() {
        with_memory(|mm| {
            let end = Pointer::new(u32::try_from(mm.memory().len()).unwrap());
            assert!(mm.read(end, 1).unwrap_err().is_protocol_violation());
            assert!(mm.write(end, &[0]).unwrap_err().is_protocol_violation());
            assert!(mm.object_size(Pointer::new(2)).unwrap_err().is_protocol_violation());
        });
    }

    #[test]
    fn test_corrupt_length_word_is_rejected() {
        with_memory(|mm| {
            let ptr = mm.new_memory(&[1, 2], RuntimeTypeId::String).unwrap();
            mm.write_u32(ptr.checked_sub(4).unwrap(), u32::MAX).unwrap();

            let err = mm.object_body(ptr).unwrap_err();
            assert!(err.is_protocol_violation());
            assert!(err.to_string().contains("4294967295 bytes"));
            assert!(mm.read(ptr, usize::MAX).unwrap_err().is_protocol_violation());
        });
    }

    #[test]
    fn test_null_load_never_touches_memory() {
        with_memory(|mm| {
            let loaded: AscString = mm.load_object(Pointer::NULL).unwrap();
            assert!(loaded.is_nil());
            assert_eq!(mm.dump_object(&loaded).unwrap(), Pointer::NULL);
        });
    }

    #[test]
    fn test_manager_requires_binding() {
        let engine = crate::WasmEngine::new(&mapping_runtime_common::EngineConfig::default()).unwrap();
        let mut store = crate::store::create_store(
            &engine,
            HostState::new("unbound", mapping_runtime_common::DebugLevel::Off),
        );
        let err = MemoryManager::from_store(store.as_context_mut()).unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
