//! Translation between wire values and host-native values.

use rmpv::Value;

/// Converts argument and result payloads at the dispatcher boundary.
///
/// `from_wire` runs on every argument before a handler sees it and
/// `to_wire` on every result before it is encoded. Both run on the host
/// thread only, which is what makes it safe for them to resolve host
/// object references. They must leave values that are already in wire
/// form unchanged.
pub trait ValueCodec {
    type Native;

    fn from_wire(&self, value: Value) -> Self::Native;

    fn to_wire(&self, value: Self::Native) -> Value;
}

/// Identity codec for hosts that work with MessagePack values directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireValues;

impl ValueCodec for WireValues {
    type Native = Value;

    fn from_wire(&self, value: Value) -> Value {
        value
    }

    fn to_wire(&self, value: Value) -> Value {
        value
    }
}

/// Apply `f` to every leaf of a value, rebuilding arrays and maps.
///
/// Handy for codecs that only care about ext handles buried in nested
/// arguments.
pub fn walk_value(value: Value, f: &impl Fn(Value) -> Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(|v| walk_value(v, f)).collect()),
        Value::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (walk_value(k, f), walk_value(v, f)))
                .collect(),
        ),
        leaf => f(leaf),
    }
}
