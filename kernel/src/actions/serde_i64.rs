//! 64-bit integers on the wire. JSON readers in other runtimes only keep 53
//! bits of integer precision, so values beyond that render as decimal
//! strings; parsing accepts either form.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};

/// Largest magnitude a JSON number can carry without losing integer
/// precision in a double.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.abs() <= MAX_SAFE_INTEGER {
        serializer.serialize_i64(*value)
    } else {
        serializer.serialize_str(&value.to_string())
    }
}

struct I64Visitor;

impl Visitor<'_> for I64Visitor {
    type Value = i64;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a 64-bit integer as a number or decimal string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
        i64::try_from(v).map_err(|_| E::custom(format!("integer out of i64 range: {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
        if v.fract() == 0.0 && v.is_finite() {
            Ok(v as i64)
        } else {
            Err(E::custom(format!("not an integer: {v}")))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
        v.trim()
            .parse()
            .map_err(|_| E::custom(format!("not a decimal integer: {v:?}")))
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    deserializer.deserialize_any(I64Visitor)
}

pub mod option {
    use super::*;
    use serde::de::Deserialize;
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        value: &Option<i64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => super::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    Ok(Some(v))
                } else if let Some(v) = n.as_f64().filter(|f| f.fract() == 0.0) {
                    Ok(Some(v as i64))
                } else {
                    Err(de::Error::custom(format!("integer out of i64 range: {n}")))
                }
            }
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| de::Error::custom(format!("not a decimal integer: {s:?}"))),
            Some(other) => Err(de::Error::custom(format!(
                "expected an integer, got {other}"
            ))),
        }
    }
}
