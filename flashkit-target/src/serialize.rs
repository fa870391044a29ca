//! Serializers which emit hexadecimal scalars in human-readable formats.
//!
//! YAML resolves unquoted `0x` scalars as integers, so the values written
//! here parse back through the default serde derives.

use jep106::JEP106Code;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::ops::Range;

pub(crate) fn hex_range<S>(memory_range: &Range<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if serializer.is_human_readable() {
        let mut state = serializer.serialize_struct("Range", 2)?;
        state.serialize_field("start", format!("{:#x}", memory_range.start).as_str())?;
        state.serialize_field("end", format!("{:#x}", memory_range.end).as_str())?;
        state.end()
    } else {
        memory_range.serialize(serializer)
    }
}

pub(crate) fn hex_u_int<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::LowerHex + Serialize,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(format!("{:#x}", value).as_str())
    } else {
        value.serialize(serializer)
    }
}

pub(crate) fn hex_jep106_option<S>(
    code: &Option<JEP106Code>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match code {
        Some(code) if serializer.is_human_readable() => {
            let mut state = serializer.serialize_struct("JEP106Code", 2)?;
            state.serialize_field("cc", format!("{:#04x}", code.cc).as_str())?;
            state.serialize_field("id", format!("{:#04x}", code.id).as_str())?;
            state.end()
        }
        _ => code.serialize(serializer),
    }
}
