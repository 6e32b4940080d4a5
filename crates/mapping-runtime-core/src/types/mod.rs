//! Composite guest value types.
//!
//! Each type matches the guest compiler's layout for its kind and carries an
//! intrinsic nil, so any of them can be a struct field, an export argument or
//! a result:
//!
//! | Type                 | Header                                        | Data                     |
//! |----------------------|-----------------------------------------------|--------------------------|
//! | [`AscString`]        | none (length word at `ptr - 4`)               | UTF-16LE                 |
//! | [`ByteArray`]        | `{buffer, dataStart, byteLength}`             | flat bytes, no header    |
//! | [`AscArray`]         | `{buffer, dataStart, byteLength, length}`     | fixed-width scalars      |
//! | [`AscObjectArray`]   | `{buffer, dataStart, byteLength, length}`     | 4-byte object pointers   |

mod array;
mod bytes;
mod string;

pub use array::{AscArray, AscObjectArray};
pub use bytes::{ByteArray, HexError};
pub use string::AscString;
