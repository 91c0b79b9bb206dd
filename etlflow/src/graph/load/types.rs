//! Semantic attribute types: runtime coercion and COPY text rendering.

use crate::errors::CoercionError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use std::fmt::Write as _;

/// The declared type of a load attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// Double-precision float.
    Float,
    /// Boolean.
    Boolean,
    /// Arbitrary JSON document, stored as one cell.
    Json,
    /// UUID.
    Uuid,
    /// Timestamp with time zone, normalised to UTC.
    Timestamp,
    /// Calendar date.
    Date,
}

impl AttrType {
    /// Returns the PostgreSQL column type.
    #[must_use]
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "bigint",
            Self::Float => "double precision",
            Self::Boolean => "boolean",
            Self::Json => "jsonb",
            Self::Uuid => "uuid",
            Self::Timestamp => "timestamptz",
            Self::Date => "date",
        }
    }

    /// Returns true when a JSON array supplied for this type is a sequence
    /// to broadcast rather than a single cell.
    #[must_use]
    pub fn broadcasts(&self) -> bool {
        !matches!(self, Self::Json)
    }

    /// Converts a supplied value to this type's canonical JSON form.
    ///
    /// `null` is accepted for every type.
    ///
    /// # Errors
    ///
    /// Returns a [`CoercionError`] when the value cannot be converted safely.
    pub fn coerce(&self, attribute: &str, value: &Value) -> Result<Value, CoercionError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let fail = || CoercionError::new(attribute, self.to_string(), value);

        match self {
            Self::Json => Ok(value.clone()),
            Self::Text => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(fail()),
            },
            Self::Integer => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(i))
                    } else {
                        match n.as_f64() {
                            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::from(f as i64)),
                            _ => Err(fail()),
                        }
                    }
                }
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
                _ => Err(fail()),
            },
            Self::Float => {
                let f = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                f.and_then(Number::from_f64).map(Value::Number).ok_or_else(fail)
            }
            Self::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(fail()),
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                    "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            Self::Uuid => match value {
                Value::String(s) => uuid::Uuid::parse_str(s.trim())
                    .map(|u| Value::String(u.to_string()))
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            Self::Timestamp => match value {
                Value::String(s) => parse_timestamp(s.trim())
                    .map(|ts| Value::String(ts.to_rfc3339()))
                    .ok_or_else(fail),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .map(|ts| Value::String(ts.to_rfc3339()))
                    .ok_or_else(fail),
                _ => Err(fail()),
            },
            Self::Date => match value {
                Value::String(s) => {
                    let s = s.trim();
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))
                        .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                        .ok_or_else(fail)
                }
                _ => Err(fail()),
            },
        }
    }

    /// Renders an already coerced value in PostgreSQL COPY text format.
    #[must_use]
    pub fn to_copy_text(&self, value: &Value) -> String {
        match value {
            Value::Null => "\\N".to_string(),
            Value::Bool(b) if !matches!(self, Self::Json) => String::from(if *b { "t" } else { "f" }),
            Value::String(s) if !matches!(self, Self::Json) => escape_copy(s),
            Value::Number(n) if !matches!(self, Self::Json) => n.to_string(),
            other => escape_copy(&other.to_string()),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Uuid => "uuid",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
        };
        f.write_str(name)
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Escapes text for a COPY text-format field.
#[must_use]
pub fn escape_copy(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_coercion() {
        assert_eq!(AttrType::Integer.coerce("a", &json!("42")).unwrap(), json!(42));
        assert_eq!(AttrType::Integer.coerce("a", &json!(3.0)).unwrap(), json!(3));
        assert!(AttrType::Integer.coerce("a", &json!(3.5)).is_err());
        assert!(AttrType::Integer.coerce("a", &json!(true)).is_err());
    }

    #[test]
    fn test_null_passes_through() {
        for ty in [AttrType::Text, AttrType::Uuid, AttrType::Date] {
            assert_eq!(ty.coerce("a", &Value::Null).unwrap(), Value::Null);
        }
    }

    #[test]
    fn test_coercion_error_names_attribute() {
        let err = AttrType::Uuid.coerce("owner_id", &json!("not-a-uuid")).unwrap_err();
        assert_eq!(err.attribute, "owner_id");
        assert_eq!(err.expected, "uuid");
    }

    #[test]
    fn test_timestamp_normalised() {
        let value = AttrType::Timestamp
            .coerce("ts", &json!("2024-01-02 03:04:05"))
            .unwrap();
        assert_eq!(value, json!("2024-01-02T03:04:05+00:00"));
        assert_eq!(
            AttrType::Date.coerce("d", &json!("2024-01-02T10:00:00Z")).unwrap(),
            json!("2024-01-02")
        );
    }

    #[test]
    fn test_boolean_text_forms() {
        assert_eq!(AttrType::Boolean.coerce("b", &json!("Yes")).unwrap(), json!(true));
        assert_eq!(AttrType::Boolean.coerce("b", &json!(0)).unwrap(), json!(false));
        assert!(AttrType::Boolean.coerce("b", &json!("maybe")).is_err());
    }

    #[test]
    fn test_copy_text() {
        assert_eq!(AttrType::Text.to_copy_text(&Value::Null), "\\N");
        assert_eq!(AttrType::Text.to_copy_text(&json!("a\tb\\c\n")), "a\\tb\\\\c\\n");
        assert_eq!(AttrType::Boolean.to_copy_text(&json!(true)), "t");
        assert_eq!(AttrType::Json.to_copy_text(&json!({"k": "v"})), "{\"k\":\"v\"}");
        assert_eq!(AttrType::Json.to_copy_text(&json!("s")), "\"s\"");
    }

    #[test]
    fn test_json_does_not_broadcast() {
        assert!(!AttrType::Json.broadcasts());
        assert!(AttrType::Integer.broadcasts());
    }
}
