//! Payload encodings for arguments and results.
//!
//! Arguments travel as JSON. Two shapes are accepted on the way in: parallel
//! key/value arrays (`{"keys": [..], "values": [..]}`, values textual or JSON scalars)
//! and a flat object of scalars. Outgoing argument payloads always use the
//! key/value arrays.
//!
//! Results travel as `{"result": "<text>"}`, with an extra `"error"` kind on
//! failures.

use crate::types::{Args, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Shape(String),
}

#[derive(Serialize, Deserialize)]
struct KeyValues<V> {
    keys: Vec<String>,
    values: Vec<V>,
}

#[derive(Serialize, Deserialize)]
struct ResultWrapper {
    result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn encode_args(args: &Args) -> Result<Vec<u8>, ArgsError> {
    let wrapper = KeyValues {
        keys: args.keys().cloned().collect(),
        values: args.values().map(Value::to_string).collect(),
    };
    Ok(serde_json::to_vec(&wrapper)?)
}

pub fn decode_args(payload: &[u8]) -> Result<Args, ArgsError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Args::new());
    }

    let object = match serde_json::from_slice::<serde_json::Value>(payload)? {
        serde_json::Value::Object(object) => object,
        other => {
            return Err(ArgsError::Shape(format!(
                "expected an object of arguments, got {other}"
            )))
        }
    };

    if is_key_values(&object) {
        let KeyValues { keys, values }: KeyValues<serde_json::Value> =
            serde_json::from_value(serde_json::Value::Object(object))?;
        if keys.len() != values.len() {
            return Err(ArgsError::Shape(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        return Ok(keys.into_iter().zip(values.into_iter().map(from_json)).collect());
    }

    Ok(object
        .into_iter()
        .map(|(key, value)| (key, from_json(value)))
        .collect())
}

fn is_key_values(object: &serde_json::Map<String, serde_json::Value>) -> bool {
    object.len() == 2
        && object.get("keys").is_some_and(serde_json::Value::is_array)
        && object.get("values").is_some_and(serde_json::Value::is_array)
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s),
        nested => Value::String(nested.to_string()),
    }
}

pub fn encode_result(value: &Value) -> Result<Vec<u8>, ArgsError> {
    let wrapper = ResultWrapper {
        result: value.to_string(),
        error: None,
    };
    Ok(serde_json::to_vec(&wrapper)?)
}

pub fn encode_error(kind: &str, message: &str) -> Result<Vec<u8>, ArgsError> {
    let wrapper = ResultWrapper {
        result: message.to_owned(),
        error: Some(kind.to_owned()),
    };
    Ok(serde_json::to_vec(&wrapper)?)
}

/// A decoded result payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub text: String,
    /// Error kind, present only on failures.
    pub error: Option<String>,
}

impl Outcome {
    pub fn value(&self) -> Value {
        Value::from_text(&self.text)
    }
}

pub fn decode_result(payload: &[u8]) -> Result<Outcome, ArgsError> {
    let ResultWrapper { result, error } = serde_json::from_slice(payload)?;
    Ok(Outcome {
        text: result,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_key_value_arrays() {
        let args = decode_args(br#"{"keys":["a","b"],"values":["2","\"x\""]}"#).unwrap();
        assert_eq!(args["a"], Value::from("2"));
        assert_eq!(args["b"], Value::from("\"x\""));
    }

    #[test]
    fn key_value_arrays_may_carry_scalars() {
        let args = decode_args(br#"{"keys":["a","b","c","d"],"values":[2,2.5,true,null]}"#).unwrap();
        assert_eq!(args["a"], Value::Int(2));
        assert_eq!(args["b"], Value::Float(2.5));
        assert_eq!(args["c"], Value::Bool(true));
        assert_eq!(args["d"], Value::Nil);
    }

    #[test]
    fn decodes_flat_objects() {
        let args = decode_args(br#"{"a":2,"b":2.5,"c":true,"d":null,"e":"x","f":[1]}"#).unwrap();
        assert_eq!(args["a"], Value::Int(2));
        assert_eq!(args["b"], Value::Float(2.5));
        assert_eq!(args["c"], Value::Bool(true));
        assert_eq!(args["d"], Value::Nil);
        assert_eq!(args["e"], Value::from("x"));
        assert_eq!(args["f"], Value::from("[1]"));
    }

    #[test]
    fn empty_payload_is_no_arguments() {
        assert!(decode_args(b"").unwrap().is_empty());
        assert!(decode_args(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(decode_args(b"{nope"), Err(ArgsError::Json(_))));
        assert!(matches!(decode_args(b"[1,2]"), Err(ArgsError::Shape(_))));
        assert!(matches!(
            decode_args(br#"{"keys":["a"],"values":[]}"#),
            Err(ArgsError::Shape(_))
        ));
    }

    #[test]
    fn callback_arguments_use_key_values() {
        let mut args = Args::new();
        args.insert("text".into(), "hi".into());
        args.insert("n".into(), Value::Int(3));
        let payload = encode_args(&args).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["keys"], serde_json::json!(["n", "text"]));
        assert_eq!(json["values"], serde_json::json!(["3", "hi"]));
    }

    #[test]
    fn results_and_errors() {
        let ok = decode_result(&encode_result(&Value::Float(5.0)).unwrap()).unwrap();
        assert_eq!(ok.value(), Value::Int(5));
        assert_eq!(ok.error, None);

        let failed = decode_result(&encode_error("unknown_function", "unknown function: nope").unwrap()).unwrap();
        assert_eq!(failed.error.as_deref(), Some("unknown_function"));
        assert_eq!(failed.text, "unknown function: nope");
    }
}
