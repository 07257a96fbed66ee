//! The `value` annotation parsing table: turns the literal string carried by
//! a `groxypb.value` option into a [`prost_reflect::Value`] matching the
//! annotated field's protobuf type.
//!
//! Scalars are parsed directly from the annotation string. Messages accept
//! either JSON or YAML object syntax (YAML is a JSON superset, so both are
//! handled by one YAML parse). Repeated fields and maps accept a YAML
//! sequence or mapping whose elements are coerced the same way.

use std::collections::HashMap;

use bytes::Bytes;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MapKey, Value};

use super::error::ProtodefError;

fn field_err(field: &FieldDescriptor, message: impl Into<String>) -> ProtodefError {
    ProtodefError::Field {
        field: field.full_name().to_string(),
        message: message.into(),
    }
}

/// Parse the literal `raw` string carried by a field's `value` option into
/// the [`Value`] it should hold.
pub fn parse_field_value(field: &FieldDescriptor, raw: &str) -> Result<Value, ProtodefError> {
    if field.is_map() {
        return parse_map(field, raw);
    }
    if field.is_list() {
        return parse_list(field, raw);
    }
    parse_scalar(field, &field.kind(), raw)
}

fn parse_list(field: &FieldDescriptor, raw: &str) -> Result<Value, ProtodefError> {
    if raw.trim().is_empty() {
        return Ok(Value::List(Vec::new()));
    }
    let seq: serde_yaml::Sequence = serde_yaml::from_str(raw)
        .map_err(|e| field_err(field, format!("not a sequence: {e}")))?;
    let kind = field.kind();
    let mut out = Vec::with_capacity(seq.len());
    for item in seq {
        out.push(yaml_to_value(field, &kind, item)?);
    }
    Ok(Value::List(out))
}

fn parse_map(field: &FieldDescriptor, raw: &str) -> Result<Value, ProtodefError> {
    if raw.trim().is_empty() {
        return Ok(Value::Map(HashMap::new()));
    }
    let key_field = field
        .map_entry_key_field();
    let value_field = field
        .map_entry_value_field();

    let map: serde_yaml::Mapping = serde_yaml::from_str(raw)
        .map_err(|e| field_err(field, format!("not a mapping: {e}")))?;

    let value_kind = value_field.kind();
    let mut out = HashMap::with_capacity(map.len());
    for (k, v) in map {
        let key_str = yaml_scalar_to_string(&k)
            .ok_or_else(|| field_err(field, "map key must be a scalar"))?;
        let key = parse_map_key(&key_field, &key_str)?;
        let value = yaml_to_value(field, &value_kind, v)?;
        out.insert(key, value);
    }
    Ok(Value::Map(out))
}

fn parse_map_key(key_field: &FieldDescriptor, raw: &str) -> Result<MapKey, ProtodefError> {
    Ok(match key_field.kind() {
        Kind::String => MapKey::String(raw.to_owned()),
        Kind::Bool => MapKey::Bool(parse_bool(raw).ok_or_else(|| field_err(key_field, "not a bool"))?),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            MapKey::I32(raw.parse().map_err(|_| field_err(key_field, "not an int32"))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            MapKey::I64(raw.parse().map_err(|_| field_err(key_field, "not an int64"))?)
        }
        Kind::Uint32 | Kind::Fixed32 => {
            MapKey::U32(raw.parse().map_err(|_| field_err(key_field, "not a uint32"))?)
        }
        Kind::Uint64 | Kind::Fixed64 => {
            MapKey::U64(raw.parse().map_err(|_| field_err(key_field, "not a uint64"))?)
        }
        other => return Err(field_err(key_field, format!("unsupported map key kind: {other:?}"))),
    })
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn yaml_to_value(field: &FieldDescriptor, kind: &Kind, v: serde_yaml::Value) -> Result<Value, ProtodefError> {
    match kind {
        Kind::Message(desc) => {
            let json = serde_yaml_to_json(v).map_err(|e| field_err(field, e))?;
            let msg = DynamicMessage::deserialize(desc.clone(), json)
                .map_err(|e| field_err(field, format!("decoding message element: {e}")))?;
            Ok(Value::Message(msg))
        }
        Kind::Enum(desc) => match v {
            serde_yaml::Value::String(name) => {
                let ev = desc
                    .get_value_by_name(&name)
                    .ok_or_else(|| field_err(field, format!("unknown enum value {name:?}")))?;
                Ok(Value::EnumNumber(ev.number()))
            }
            serde_yaml::Value::Number(n) => {
                let num = n.as_i64().ok_or_else(|| field_err(field, "enum number out of range"))? as i32;
                Ok(Value::EnumNumber(num))
            }
            other => Err(field_err(field, format!("unexpected enum element: {other:?}"))),
        },
        _ => {
            let raw = yaml_scalar_to_string(&v)
                .ok_or_else(|| field_err(field, "expected a scalar element"))?;
            parse_scalar(field, kind, &raw)
        }
    }
}

fn serde_yaml_to_json(v: serde_yaml::Value) -> Result<serde_json::Value, String> {
    serde_json::to_value(v).map_err(|e| e.to_string())
}

fn parse_scalar(field: &FieldDescriptor, kind: &Kind, raw: &str) -> Result<Value, ProtodefError> {
    if raw.is_empty() {
        return Ok(zero_value(kind));
    }
    Ok(match kind {
        Kind::Double => Value::F64(raw.parse().map_err(|_| field_err(field, "not a double"))?),
        Kind::Float => Value::F32(raw.parse().map_err(|_| field_err(field, "not a float"))?),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            Value::I32(raw.parse().map_err(|_| field_err(field, "not an int32"))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(raw.parse().map_err(|_| field_err(field, "not an int64"))?)
        }
        Kind::Uint32 | Kind::Fixed32 => {
            Value::U32(raw.parse().map_err(|_| field_err(field, "not a uint32"))?)
        }
        Kind::Uint64 | Kind::Fixed64 => {
            Value::U64(raw.parse().map_err(|_| field_err(field, "not a uint64"))?)
        }
        Kind::Bool => Value::Bool(parse_bool(raw).ok_or_else(|| field_err(field, "not a bool"))?),
        Kind::String => Value::String(raw.to_owned()),
        Kind::Bytes => {
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(raw)
                .map_err(|e| field_err(field, format!("not valid base64: {e}")))?;
            Value::Bytes(Bytes::from(decoded))
        }
        Kind::Message(desc) => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(raw)
                .map_err(|e| field_err(field, format!("not a valid message literal: {e}")))?;
            let json = serde_yaml_to_json(yaml).map_err(|e| field_err(field, e))?;
            let msg = DynamicMessage::deserialize(desc.clone(), json)
                .map_err(|e| field_err(field, format!("decoding message: {e}")))?;
            Value::Message(msg)
        }
        Kind::Enum(desc) => {
            if let Ok(num) = raw.parse::<i32>() {
                Value::EnumNumber(num)
            } else {
                let ev = desc
                    .get_value_by_name(raw)
                    .ok_or_else(|| field_err(field, format!("unknown enum value {raw:?}")))?;
                Value::EnumNumber(ev.number())
            }
        }
    })
}

fn zero_value(kind: &Kind) -> Value {
    match kind {
        Kind::Double => Value::F64(0.0),
        Kind::Float => Value::F32(0.0),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::I32(0),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(0),
        Kind::Uint32 | Kind::Fixed32 => Value::U32(0),
        Kind::Uint64 | Kind::Fixed64 => Value::U64(0),
        Kind::Bool => Value::Bool(false),
        Kind::String => Value::String(String::new()),
        Kind::Bytes => Value::Bytes(Bytes::new()),
        Kind::Message(desc) => Value::Message(DynamicMessage::new(desc.clone())),
        Kind::Enum(desc) => Value::EnumNumber(desc.default_value().number()),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_matches_strconv_style() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("T"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }
}
