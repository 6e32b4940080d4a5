//! The guest object contract and generic struct marshaling.
//!
//! Every composite value implements [`AscObject`]: `dump` serializes it into a
//! freshly allocated guest block and `load` populates it from one. Plain
//! structs get both halves generated from a single ordered field list by
//! [`asc_object!`](crate::asc_object), which drives [`ObjectWriter`] and
//! [`ObjectReader`]. Both place each field at the smallest offset that is a
//! multiple of the field's own size, so the two directions always agree.

use std::fmt;

use mapping_runtime_common::RuntimeError;
use tracing::error;

use crate::memory::MemoryManager;
use crate::value::{AsAny, Pointer, Scalar};

/// Runtime type ids written into object headers.
///
/// The guest runtime consumes these; the host writes them but never checks
/// them on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RuntimeTypeId {
    GenericObject = 0,
    ByteArrayData = 1,
    String = 2,
    ByteArrayHeader = 3,
    ScalarArrayHeader = 4,
    ScalarArrayData = 5,
    ObjectArrayHeader = 6,
    ObjectArrayData = 7,
}

impl RuntimeTypeId {
    /// Raw tag value.
    pub const fn id(self) -> u32 {
        self as u32
    }
}

/// A composite value with a guest memory representation.
pub trait AscObject: AsAny + fmt::Debug + Send {
    /// Serialize into a freshly allocated guest block.
    ///
    /// Returns [`Pointer::NULL`] for nil.
    fn dump(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError>;

    /// Populate `self` from the object at `ptr`, which is never null.
    fn load(&mut self, mm: &mut MemoryManager<'_>, ptr: Pointer) -> Result<(), RuntimeError>;

    /// Rust type name, for diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// `None` is the nil object; `Some` dumps and loads the inner value.
impl<T: AscObject + Default + 'static> AscObject for Option<T> {
    fn dump(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        match self {
            Some(inner) => inner.dump(mm),
            None => Ok(Pointer::NULL),
        }
    }

    fn load(&mut self, mm: &mut MemoryManager<'_>, ptr: Pointer) -> Result<(), RuntimeError> {
        let mut inner = T::default();
        inner.load(mm, ptr)?;
        *self = Some(inner);
        Ok(())
    }
}

/// A value that can be stored as one field of a generic object.
///
/// Every field is ultimately stored as a scalar; object fields are stored as
/// the 4-byte pointer their `dump` returned.
pub trait AscField: Sized {
    /// The scalar stored in the object body.
    type Repr: Scalar;

    /// Produce the stored representation, dumping nested objects.
    fn to_repr(&self, mm: &mut MemoryManager<'_>) -> Result<Self::Repr, RuntimeError>;

    /// Rebuild from the stored representation, loading nested objects.
    fn from_repr(mm: &mut MemoryManager<'_>, repr: Self::Repr) -> Result<Self, RuntimeError>;
}

macro_rules! impl_scalar_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl AscField for $ty {
                type Repr = $ty;

                fn to_repr(&self, _mm: &mut MemoryManager<'_>) -> Result<$ty, RuntimeError> {
                    Ok(*self)
                }

                fn from_repr(_mm: &mut MemoryManager<'_>, repr: $ty) -> Result<Self, RuntimeError> {
                    Ok(repr)
                }
            }
        )*
    };
}

impl_scalar_field!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, Pointer);

impl<T: AscObject + Default> AscField for T {
    type Repr = Pointer;

    fn to_repr(&self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        self.dump(mm)
    }

    fn from_repr(mm: &mut MemoryManager<'_>, repr: Pointer) -> Result<Self, RuntimeError> {
        let mut value = T::default();
        if !repr.is_null() {
            value.load(mm, repr)?;
        }
        Ok(value)
    }
}

/// Offset of the next field of `size` bytes after `cursor`.
pub const fn field_offset(cursor: usize, size: usize) -> usize {
    cursor.next_multiple_of(size)
}

/// Serializes struct fields in declaration order into a generic object body.
#[derive(Debug, Default)]
pub struct ObjectWriter {
    body: Vec<u8>,
}

impl ObjectWriter {
    /// Start an empty object body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one field at its aligned offset.
    pub fn field<F: AscField>(
        &mut self,
        mm: &mut MemoryManager<'_>,
        value: &F,
    ) -> Result<(), RuntimeError> {
        let repr = value.to_repr(mm)?;
        let size = <F::Repr as Scalar>::KIND.size();
        let offset = field_offset(self.body.len(), size);
        self.body.resize(offset + size, 0);
        repr.write_le(&mut self.body[offset..]);
        Ok(())
    }

    /// The body bytes written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Allocate the object in guest memory.
    pub fn finish(self, mm: &mut MemoryManager<'_>) -> Result<Pointer, RuntimeError> {
        mm.new_memory(&self.body, RuntimeTypeId::GenericObject)
    }
}

/// Reads struct fields in declaration order from a generic object body.
#[derive(Debug)]
pub struct ObjectReader {
    type_name: &'static str,
    body: Vec<u8>,
    cursor: usize,
}

impl ObjectReader {
    /// Read the body of the generic object at `ptr`.
    pub fn open(
        mm: &mut MemoryManager<'_>,
        ptr: Pointer,
        type_name: &'static str,
    ) -> Result<Self, RuntimeError> {
        let body = mm.object_body(ptr)?;
        Ok(Self::from_body(type_name, body))
    }

    /// Wrap an already-read body.
    pub fn from_body(type_name: &'static str, body: Vec<u8>) -> Self {
        Self {
            type_name,
            body,
            cursor: 0,
        }
    }

    /// Read the next field, re-deriving the same aligned offset the writer used.
    pub fn field<F: AscField>(
        &mut self,
        mm: &mut MemoryManager<'_>,
        name: &'static str,
    ) -> Result<F, RuntimeError> {
        let size = <F::Repr as Scalar>::KIND.size();
        let offset = field_offset(self.cursor, size);
        let end = offset + size;
        if end > self.body.len() {
            return Err(self.layout_mismatch(format!(
                "field '{name}' at offset {offset} overruns object body of {} bytes",
                self.body.len()
            )));
        }
        self.cursor = end;
        let repr = <F::Repr as Scalar>::read_le(&self.body[offset..end]);
        F::from_repr(mm, repr)
    }

    /// Check that every byte of the body was claimed by a field.
    pub fn finish(self) -> Result<(), RuntimeError> {
        if self.cursor == self.body.len() {
            Ok(())
        } else {
            Err(self.layout_mismatch(format!(
                "{} trailing bytes after last field",
                self.body.len() - self.cursor
            )))
        }
    }

    fn layout_mismatch(&self, detail: String) -> RuntimeError {
        let reason = format!("layout mismatch for {}: {detail}", self.type_name);
        error!(%reason, "Generic object layout mismatch");
        RuntimeError::protocol_violation(reason)
    }
}

/// Declare a struct marshaled as a generic guest object.
///
/// Generates the [`AscObject`] impl from the ordered field list, so dump and
/// load always walk the same fields in the same order. Field types must
/// implement [`AscField`]; nested structs that may be nil should be wrapped in
/// `Option`. The struct must also implement `Debug` and `Default`.
///
/// ```ignore
/// asc_object! {
///     #[derive(Debug, Default, Clone, PartialEq)]
///     pub struct Transfer {
///         pub from: AscString,
///         pub flags: u8,
///         pub value: u64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! asc_object {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )*
        }

        impl $crate::object::AscObject for $name {
            fn dump(
                &self,
                mm: &mut $crate::memory::MemoryManager<'_>,
            ) -> ::std::result::Result<$crate::value::Pointer, $crate::RuntimeError> {
                #[allow(unused_mut)]
                let mut writer = $crate::object::ObjectWriter::new();
                $(
                    writer.field(mm, &self.$field)?;
                )*
                writer.finish(mm)
            }

            fn load(
                &mut self,
                mm: &mut $crate::memory::MemoryManager<'_>,
                ptr: $crate::value::Pointer,
            ) -> ::std::result::Result<(), $crate::RuntimeError> {
                #[allow(unused_mut)]
                let mut reader =
                    $crate::object::ObjectReader::open(mm, ptr, ::std::stringify!($name))?;
                $(
                    self.$field = reader.field(mm, ::std::stringify!($field))?;
                )*
                reader.finish()
            }
        }
    };
}
