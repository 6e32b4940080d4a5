//! Scalar value codec and the typed value model shared by the binder.
//!
//! - [`ValueKind`]: kind tags used in export signatures and import descriptors
//! - [`Value`]: a tagged host value (scalar or boxed guest object)
//! - [`Scalar`]: fixed-width little-endian encoding for the scalar kinds
//! - [`Pointer`]: a 32-bit offset into one instance's linear memory

use std::any::{Any, TypeId};
use std::fmt;

use wasmtime::{Val, ValType};

use crate::object::AscObject;

/// A 32-bit offset into one instance's linear memory.
///
/// Pointers are meaningless outside the instance that produced them and are
/// invalidated by a reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer(u32);

impl Pointer {
    /// The nil pointer.
    pub const NULL: Pointer = Pointer(0);

    /// Create a pointer from a raw offset.
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// Raw offset into linear memory.
    pub const fn offset(self) -> u32 {
        self.0
    }

    /// Returns `true` for the nil pointer.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset this pointer forward by `bytes`.
    pub const fn add(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Offset this pointer backward by `bytes`, or `None` if that would
    /// underflow.
    pub const fn checked_sub(self, bytes: u32) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(offset) => Some(Self(offset)),
            None => None,
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// WebAssembly value types the guest ABI uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmType {
    I32,
    I64,
    F32,
    F64,
}

impl WasmType {
    /// Map a wasmtime value type, or `None` for types the guest ABI never uses.
    pub fn from_val_type(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(Self::I32),
            ValType::I64 => Some(Self::I64),
            ValType::F32 => Some(Self::F32),
            ValType::F64 => Some(Self::F64),
            _ => None,
        }
    }

    /// The wasmtime value type.
    pub fn val_type(self) -> ValType {
        match self {
            Self::I32 => ValType::I32,
            Self::I64 => ValType::I64,
            Self::F32 => ValType::F32,
            Self::F64 => ValType::F64,
        }
    }

    /// The zero value of this type, used to size result buffers.
    pub fn zero(self) -> Val {
        match self {
            Self::I32 => Val::I32(0),
            Self::I64 => Val::I64(0),
            Self::F32 => Val::F32(0),
            Self::F64 => Val::F64(0),
        }
    }
}

/// Identifies one concrete guest object type.
///
/// Built with [`ObjectKind::of`]; two kinds are equal when they name the same
/// Rust type.
#[derive(Clone, Copy)]
pub struct ObjectKind {
    type_id: TypeId,
    name: &'static str,
    new: fn() -> Box<dyn AscObject>,
}

impl ObjectKind {
    /// The kind for object type `T`.
    pub fn of<T: AscObject + Default + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            new: new_boxed::<T>,
        }
    }

    /// Full Rust type name of the object type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A fresh nil/default instance, ready to be loaded into.
    pub fn instantiate(&self) -> Box<dyn AscObject> {
        (self.new)()
    }

    /// Returns `true` if `object` is an instance of this kind.
    pub fn matches(&self, object: &dyn AscObject) -> bool {
        object.as_any().type_id() == self.type_id
    }
}

fn new_boxed<T: AscObject + Default + 'static>() -> Box<dyn AscObject> {
    Box::new(T::default())
}

impl PartialEq for ObjectKind {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ObjectKind {}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectKind").field(&self.name).finish()
    }
}

/// Kind tag of a value crossing the host/guest boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Pointer,
    /// A composite guest object, passed as a pointer.
    Object(ObjectKind),
}

impl ValueKind {
    /// The object kind for type `T`.
    pub fn object<T: AscObject + Default + 'static>() -> Self {
        Self::Object(ObjectKind::of::<T>())
    }

    /// Natural size in guest memory. Objects occupy a 4-byte pointer.
    pub const fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 | Self::Pointer | Self::Object(_) => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// The WebAssembly type this kind travels as.
    pub const fn wasm_type(self) -> WasmType {
        match self {
            Self::I64 | Self::U64 => WasmType::I64,
            Self::F32 => WasmType::F32,
            Self::F64 => WasmType::F64,
            _ => WasmType::I32,
        }
    }

    /// Returns `true` for every kind except objects.
    pub const fn is_scalar(self) -> bool {
        !matches!(self, Self::Object(_))
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bool => "bool",
            Self::Pointer => "pointer",
            Self::Object(kind) => return write!(f, "object<{}>", kind.name()),
        };
        f.write_str(name)
    }
}

/// A typed host value.
#[derive(Debug)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Pointer(Pointer),
    Object(Box<dyn AscObject>),
}

impl Value {
    /// Wrap a guest object.
    pub fn object<T: AscObject + 'static>(object: T) -> Self {
        Self::Object(Box::new(object))
    }

    /// Returns `true` if this value may be passed where `kind` is expected.
    pub fn matches(&self, kind: ValueKind) -> bool {
        match (self, kind) {
            (Self::Object(object), ValueKind::Object(expected)) => expected.matches(object.as_ref()),
            (Self::Object(_), _) | (_, ValueKind::Object(_)) => false,
            (value, kind) => value.scalar_kind() == Some(kind),
        }
    }

    /// Human-readable kind, for diagnostics.
    pub fn kind_name(&self) -> String {
        match self {
            Self::Object(object) => format!("object<{}>", object.type_name()),
            other => other
                .scalar_kind()
                .map_or_else(String::new, |kind| kind.to_string()),
        }
    }

    fn scalar_kind(&self) -> Option<ValueKind> {
        Some(match self {
            Self::I8(_) => ValueKind::I8,
            Self::I16(_) => ValueKind::I16,
            Self::I32(_) => ValueKind::I32,
            Self::I64(_) => ValueKind::I64,
            Self::U8(_) => ValueKind::U8,
            Self::U16(_) => ValueKind::U16,
            Self::U32(_) => ValueKind::U32,
            Self::U64(_) => ValueKind::U64,
            Self::F32(_) => ValueKind::F32,
            Self::F64(_) => ValueKind::F64,
            Self::Bool(_) => ValueKind::Bool,
            Self::Pointer(_) => ValueKind::Pointer,
            Self::Object(_) => return None,
        })
    }

    /// Borrow the object of type `T`, if this value holds one.
    pub fn as_object<T: AscObject + 'static>(&self) -> Option<&T> {
        match self {
            Self::Object(object) => object.as_ref().as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Take the object of type `T`, if this value holds one.
    pub fn into_object<T: AscObject + 'static>(self) -> Option<T> {
        match self {
            Self::Object(object) => object.into_any().downcast::<T>().ok().map(|b| *b),
            _ => None,
        }
    }

    /// Convert to the wasm value for scalar kinds. Objects need guest memory
    /// and are lowered by the binder.
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn scalar_to_val(&self) -> Option<Val> {
        Some(match *self {
            Self::I8(v) => Val::I32(i32::from(v)),
            Self::I16(v) => Val::I32(i32::from(v)),
            Self::I32(v) => Val::I32(v),
            Self::U8(v) => Val::I32(i32::from(v)),
            Self::U16(v) => Val::I32(i32::from(v)),
            Self::U32(v) => Val::I32(v as i32),
            Self::Bool(v) => Val::I32(i32::from(v)),
            Self::Pointer(p) => Val::I32(p.offset() as i32),
            Self::I64(v) => Val::I64(v),
            Self::U64(v) => Val::I64(v as i64),
            Self::F32(v) => Val::F32(v.to_bits()),
            Self::F64(v) => Val::F64(v.to_bits()),
            Self::Object(_) => return None,
        })
    }

    /// Decode a wasm value for a scalar kind. Narrow integer kinds take the
    /// low bits of the i32 the guest produced.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(crate) fn scalar_from_val(kind: ValueKind, val: &Val) -> Option<Self> {
        Some(match kind {
            ValueKind::I8 => Self::I8(val.i32()? as i8),
            ValueKind::I16 => Self::I16(val.i32()? as i16),
            ValueKind::I32 => Self::I32(val.i32()?),
            ValueKind::U8 => Self::U8(val.i32()? as u8),
            ValueKind::U16 => Self::U16(val.i32()? as u16),
            ValueKind::U32 => Self::U32(val.i32()? as u32),
            ValueKind::Bool => Self::Bool(val.i32()? != 0),
            ValueKind::Pointer => Self::Pointer(Pointer::new(val.i32()? as u32)),
            ValueKind::I64 => Self::I64(val.i64()?),
            ValueKind::U64 => Self::U64(val.i64()? as u64),
            ValueKind::F32 => Self::F32(val.f32()?),
            ValueKind::F64 => Self::F64(val.f64()?),
            ValueKind::Object(_) => return None,
        })
    }
}

/// A fixed-width value with a little-endian guest representation.
pub trait Scalar: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Kind tag of this scalar.
    const KIND: ValueKind;

    /// Encode into exactly `KIND.size()` bytes.
    fn write_le(self, out: &mut [u8]);

    /// Decode from the first `KIND.size()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Wrap as a [`Value`].
    fn into_value(self) -> Value;

    /// Unwrap from a [`Value`] of the same kind.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_scalar_number {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const KIND: ValueKind = ValueKind::$kind;

                fn write_le(self, out: &mut [u8]) {
                    out[..size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }

                fn into_value(self) -> Value {
                    Value::$kind(self)
                }

                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::$kind(v) => Some(*v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_scalar_number! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

impl Scalar for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn write_le(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl Scalar for Pointer {
    const KIND: ValueKind = ValueKind::Pointer;

    fn write_le(self, out: &mut [u8]) {
        self.0.write_le(out);
    }

    fn read_le(bytes: &[u8]) -> Self {
        Self(u32::read_le(bytes))
    }

    fn into_value(self) -> Value {
        Value::Pointer(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Pointer(v) => Some(*v),
            _ => None,
        }
    }
}

/// Anything that can cross the boundary as a single argument or result.
///
/// Implemented for every scalar type and, through a blanket impl, for every
/// [`AscObject`] with a nil default.
pub trait WasmValue: Sized {
    /// Kind tag of this type.
    fn kind() -> ValueKind;

    /// Wrap as a [`Value`].
    fn into_value(self) -> Value;

    /// Unwrap from a [`Value`] of the same kind.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_wasm_value_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WasmValue for $ty {
                fn kind() -> ValueKind {
                    <$ty as Scalar>::KIND
                }

                fn into_value(self) -> Value {
                    Scalar::into_value(self)
                }

                fn from_value(value: Value) -> Option<Self> {
                    <$ty as Scalar>::from_value(&value)
                }
            }
        )*
    };
}

impl_wasm_value_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, Pointer);

impl<T: AscObject + Default + 'static> WasmValue for T {
    fn kind() -> ValueKind {
        ValueKind::object::<T>()
    }

    fn into_value(self) -> Value {
        Value::object(self)
    }

    fn from_value(value: Value) -> Option<Self> {
        value.into_object::<T>()
    }
}

/// Object-safe access to `Any` for trait objects.
pub trait AsAny {
    /// Borrow as `Any`.
    fn as_any(&self) -> &dyn Any;

    /// Convert a boxed value into `Box<dyn Any>`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AscString;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(ValueKind::I8.size(), 1);
        assert_eq!(ValueKind::Bool.size(), 1);
        assert_eq!(ValueKind::U16.size(), 2);
        assert_eq!(ValueKind::F32.size(), 4);
        assert_eq!(ValueKind::Pointer.size(), 4);
        assert_eq!(ValueKind::object::<AscString>().size(), 4);
        assert_eq!(ValueKind::U64.size(), 8);
        assert_eq!(ValueKind::F64.size(), 8);
    }

    #[test]
    fn test_wasm_types() {
        assert_eq!(ValueKind::U8.wasm_type(), WasmType::I32);
        assert_eq!(ValueKind::Bool.wasm_type(), WasmType::I32);
        assert_eq!(ValueKind::U64.wasm_type(), WasmType::I64);
        assert_eq!(ValueKind::F32.wasm_type(), WasmType::F32);
        assert_eq!(ValueKind::object::<AscString>().wasm_type(), WasmType::I32);
    }

    #[test]
    fn test_little_endian_encoding() {
        let mut buf = [0u8; 4];
        0x1234_5678_u32.write_le(&mut buf);
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u32::read_le(&buf), 0x1234_5678);

        let mut buf = [0u8; 8];
        (-2_i64).write_le(&mut buf);
        assert_eq!(i64::read_le(&buf), -2);

        let mut buf = [0u8; 1];
        true.write_le(&mut buf);
        assert_eq!(buf, [1]);
    }

    #[test]
    fn test_scalar_val_conversion() {
        let val = Value::I8(-3).scalar_to_val().unwrap();
        assert_eq!(val.i32(), Some(-3));
        assert!(matches!(Value::scalar_from_val(ValueKind::I8, &val), Some(Value::I8(-3))));

        let val = Value::U32(u32::MAX).scalar_to_val().unwrap();
        assert!(matches!(
            Value::scalar_from_val(ValueKind::U32, &val),
            Some(Value::U32(u32::MAX))
        ));

        let val = Value::F64(1.5).scalar_to_val().unwrap();
        assert!(matches!(Value::scalar_from_val(ValueKind::F64, &val), Some(Value::F64(v)) if v == 1.5));

        let val = Value::I64(7).scalar_to_val().unwrap();
        assert!(Value::scalar_from_val(ValueKind::I32, &val).is_none());
    }

    #[test]
    fn test_value_matches_kind() {
        assert!(Value::I32(1).matches(ValueKind::I32));
        assert!(!Value::I32(1).matches(ValueKind::U32));
        assert!(!Value::I32(1).matches(ValueKind::object::<AscString>()));

        let s = Value::object(AscString::from("hi"));
        assert!(s.matches(ValueKind::object::<AscString>()));
        assert!(!s.matches(ValueKind::Pointer));
        assert!(s.kind_name().contains("AscString"));
    }

    #[test]
    fn test_object_downcast() {
        let value = AscString::from("graph").into_value();
        assert_eq!(value.as_object::<AscString>().unwrap().as_str(), "graph");
        assert!(value.as_object::<crate::types::ByteArray>().is_none());

        let s: AscString = WasmValue::from_value(value).unwrap();
        assert_eq!(s.as_str(), "graph");
    }

    #[test]
    fn test_pointer_display() {
        assert_eq!(Pointer::new(0x40).to_string(), "0x00000040");
        assert!(Pointer::NULL.is_null());
        assert_eq!(Pointer::new(20).checked_sub(16), Some(Pointer::new(4)));
        assert_eq!(Pointer::new(3).checked_sub(4), None);
    }
}
