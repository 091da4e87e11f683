//! msgpack-rpc wire layer: envelopes and stream framing.
//!
//! # Protocol
//!
//! Each RPC channel carries MessagePack arrays back to back:
//!
//! ```text
//! [0, requestId, method, args]          request
//! [2, method, args]                     notification
//! [1, requestId, error|nil, result]     response
//! ```
//!
//! Host object references (buffers, windows, tabpages) travel as MessagePack
//! ext values; see [`ext_handle`] for the helper that unpacks them.

mod framing;
mod message;

pub use framing::{encode_message, encode_value, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_BYTES};
pub use message::{Message, RpcError, GENERIC_ERROR_CODE};

pub use rmpv::Value;

/// Ext type id for buffer handles.
pub const BUFFER_EXT_TYPE: i8 = 0;
/// Ext type id for window handles.
pub const WINDOW_EXT_TYPE: i8 = 1;
/// Ext type id for tabpage handles.
pub const TABPAGE_EXT_TYPE: i8 = 2;

/// Unpack an ext-encoded handle into `(type id, handle number)`.
///
/// The ext payload is itself a MessagePack integer.
pub fn ext_handle(value: &Value) -> Option<(i8, i64)> {
    let Value::Ext(ty, data) = value else {
        return None;
    };
    let inner = rmpv::decode::read_value(&mut data.as_slice()).ok()?;
    inner.as_i64().map(|number| (*ty, number))
}

/// Build an ext-encoded handle, the inverse of [`ext_handle`].
pub fn make_ext_handle(ty: i8, number: i64) -> Value {
    let payload = encode_value(&Value::from(number)).unwrap_or_default();
    Value::Ext(ty, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext_handle_roundtrip() {
        let handle = make_ext_handle(BUFFER_EXT_TYPE, 3);
        assert_eq!(ext_handle(&handle), Some((BUFFER_EXT_TYPE, 3)));
    }

    #[test]
    fn test_ext_handle_rejects_plain_values() {
        assert_eq!(ext_handle(&Value::from(3)), None);
        assert_eq!(ext_handle(&Value::Ext(WINDOW_EXT_TYPE, vec![0xc1])), None);
    }
}
