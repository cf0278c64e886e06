//! Payload decoding for incoming messages.
//!
//! The transport carries opaque bytes; the handler's declared payload type
//! decides how they are interpreted:
//!
//! - `String` — UTF-8
//! - the primitive numeric and boolean types — fixed-width little-endian
//! - `Bytes` / `Vec<u8>` — identity
//! - anything else — JSON, via the explicit [`Json`] wrapper (serde
//!   attributes on the inner type govern field naming)

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error decoding a message payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid UTF-8.
    #[error("invalid UTF-8 payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Payload length does not match the fixed-width type.
    #[error("expected {expected} bytes for {type_name}, got {actual}")]
    Length {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Boolean payload byte is neither 0 nor 1.
    #[error("invalid boolean byte: {0}")]
    Bool(u8),

    /// Payload is not valid JSON for the target type.
    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A type that can be decoded from a raw message payload.
///
/// The type label is what binding descriptions report in logs and metrics.
pub trait Payload: Sized + Send + 'static {
    /// Decode a value from the raw payload bytes.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;

    /// Human-readable label of the payload type.
    fn type_label() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl Payload for String {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl Payload for Bytes {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl Payload for Vec<u8> {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(bytes.to_vec())
    }
}

impl Payload for bool {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != 1 {
            return Err(DecodeError::Length {
                type_name: "bool",
                expected: 1,
                actual: bytes.len(),
            });
        }
        match bytes[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::Bool(other)),
        }
    }
}

macro_rules! impl_le_payload {
    ($($ty:ty),*) => {
        $(
            impl Payload for $ty {
                fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    let arr: [u8; WIDTH] =
                        bytes.try_into().map_err(|_| DecodeError::Length {
                            type_name: stringify!($ty),
                            expected: WIDTH,
                            actual: bytes.len(),
                        })?;
                    Ok(<$ty>::from_le_bytes(arr))
                }
            }
        )*
    };
}

impl_le_payload!(i32, u32, i64, u64, f32, f64);

/// JSON payload wrapper.
///
/// Wrap any serde-deserializable type to receive it as JSON:
///
/// ```rust
/// use messaging::{Json, Payload};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct OrderPlaced {
///     order_id: String,
///     total_cents: i64,
/// }
///
/// let payload = br#"{"orderId":"o-1","totalCents":995}"#;
/// let Json(event) = Json::<OrderPlaced>::decode(payload).unwrap();
/// assert_eq!(event.order_id, "o-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    /// Unwrap the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> Payload for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }

    fn type_label() -> &'static str {
        std::any::type_name::<T>()
    }
}
