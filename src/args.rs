//! Typed command-line values: `kind:value` arguments and result kinds.

use anyhow::{Context, Result, bail};
use mapping_runtime_core::{AscString, ByteArray, Value, ValueKind};

/// Parse a kind name such as `i32`, `string` or `bytes`.
pub fn parse_kind(name: &str) -> Result<ValueKind> {
    Ok(match name {
        "i8" => ValueKind::I8,
        "i16" => ValueKind::I16,
        "i32" => ValueKind::I32,
        "i64" => ValueKind::I64,
        "u8" => ValueKind::U8,
        "u16" => ValueKind::U16,
        "u32" => ValueKind::U32,
        "u64" => ValueKind::U64,
        "f32" => ValueKind::F32,
        "f64" => ValueKind::F64,
        "bool" => ValueKind::Bool,
        "string" => ValueKind::object::<AscString>(),
        "bytes" => ValueKind::object::<ByteArray>(),
        other => bail!("unknown value kind '{other}'"),
    })
}

/// Parse a `kind:value` argument. Byte arrays are given in hex.
pub fn parse_value(arg: &str) -> Result<Value> {
    let (kind, raw) = arg
        .split_once(':')
        .with_context(|| format!("argument '{arg}' is not of the form kind:value"))?;
    let invalid = || format!("invalid {kind} value '{raw}'");

    Ok(match kind {
        "i8" => Value::I8(raw.parse().with_context(invalid)?),
        "i16" => Value::I16(raw.parse().with_context(invalid)?),
        "i32" => Value::I32(raw.parse().with_context(invalid)?),
        "i64" => Value::I64(raw.parse().with_context(invalid)?),
        "u8" => Value::U8(raw.parse().with_context(invalid)?),
        "u16" => Value::U16(raw.parse().with_context(invalid)?),
        "u32" => Value::U32(raw.parse().with_context(invalid)?),
        "u64" => Value::U64(raw.parse().with_context(invalid)?),
        "f32" => Value::F32(raw.parse().with_context(invalid)?),
        "f64" => Value::F64(raw.parse().with_context(invalid)?),
        "bool" => Value::Bool(raw.parse().with_context(invalid)?),
        "string" => Value::object(AscString::from(raw)),
        "bytes" => Value::object(ByteArray::from_hex(raw).with_context(invalid)?),
        other => bail!("unknown value kind '{other}'"),
    })
}

/// The kind an argument value was parsed as.
pub fn kind_of(value: &Value) -> Result<ValueKind> {
    let kind = match value {
        Value::I8(_) => ValueKind::I8,
        Value::I16(_) => ValueKind::I16,
        Value::I32(_) => ValueKind::I32,
        Value::I64(_) => ValueKind::I64,
        Value::U8(_) => ValueKind::U8,
        Value::U16(_) => ValueKind::U16,
        Value::U32(_) => ValueKind::U32,
        Value::U64(_) => ValueKind::U64,
        Value::F32(_) => ValueKind::F32,
        Value::F64(_) => ValueKind::F64,
        Value::Bool(_) => ValueKind::Bool,
        Value::Pointer(_) => ValueKind::Pointer,
        Value::Object(_) if value.as_object::<AscString>().is_some() => {
            ValueKind::object::<AscString>()
        }
        Value::Object(_) if value.as_object::<ByteArray>().is_some() => {
            ValueKind::object::<ByteArray>()
        }
        Value::Object(_) => bail!("unsupported argument {}", value.kind_name()),
    };
    Ok(kind)
}

/// Render a result for printing.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::I8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Pointer(p) => p.to_string(),
        Value::Object(object) => {
            if let Some(text) = value.as_object::<AscString>() {
                format!("{:?}", text.as_str())
            } else if let Some(bytes) = value.as_object::<ByteArray>() {
                bytes.to_hex()
            } else {
                format!("{object:?}")
            }
        }
    }
}
