//! Reply envelope: `[error]` on failure, `[null, result]` on success.
//!
//! The first slot decides. Any truthy value there is a failure; `null`, `false`,
//! `0`, `""` or a missing slot mean success. Peers that answer `[0, result]`
//! therefore interoperate.

use crate::codec;
use crate::error::BusError;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEnvelope {
    Success(Value),
    Failure(Value),
}

impl ReplyEnvelope {
    /// The JSON array sent on the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Success(result) => Value::Array(vec![Value::Null, result.clone()]),
            Self::Failure(error) => Value::Array(vec![error.clone()]),
        }
    }

    /// Interpret a reply body.
    ///
    /// Fails with [`BusError::Decode`] if the body is not a JSON array.
    pub fn from_value(value: Value) -> Result<Self, BusError> {
        let slots = match value {
            Value::Array(slots) => slots,
            other => {
                return Err(BusError::Decode(format!(
                    "reply envelope is not an array: {other}"
                )));
            }
        };

        let mut slots = slots.into_iter();
        let first = slots.next().unwrap_or(Value::Null);
        if codec::is_truthy(&first) {
            Ok(Self::Failure(first))
        } else {
            Ok(Self::Success(slots.next().unwrap_or(Value::Null)))
        }
    }

    /// `Ok(result)` or `Err(BusError::Remote(error))`.
    pub fn into_result(self) -> Result<Value, BusError> {
        match self {
            Self::Success(result) => Ok(result),
            Self::Failure(error) => Err(BusError::Remote(error)),
        }
    }
}
