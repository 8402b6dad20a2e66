use std::{
    collections::BTreeMap,
    fmt,
};

use serde_json::Value as JsonValue;

use crate::{
    eval::LangError,
    parse::parse_one,
};

/// A runtime value. Values are also the syntax: an input expression is a
/// `Value` and evaluation is defined over it.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Atom(String),
    List(Vec<Value>),
    Lambda(Lambda),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Vec<Value>,
    /// Bindings captured at definition time. Looked up before the caller's
    /// environment when the lambda is applied.
    pub env: BTreeMap<String, Value>,
}

impl Value {
    pub fn atom(name: impl Into<String>) -> Self {
        Value::Atom(name.into())
    }

    pub fn nil() -> Self {
        Value::List(Vec::new())
    }

    /// Decode a value from its JSON transport form. Numbers, booleans and
    /// arrays map directly; a JSON string is read as expression source, so
    /// `"(+ 1 2)"` decodes to the call form and `"\"hi\""` to a string.
    pub fn from_json(json: &JsonValue) -> Result<Self, LangError> {
        match json {
            JsonValue::Number(n) => {
                let i = n
                    .as_i64()
                    .ok_or_else(|| LangError::UnsupportedJson(format!("non-integer number {n}")))?;
                Ok(Value::Int(i))
            },
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::String(source) => parse_one(source),
            JsonValue::Array(items) => {
                let vs = items.iter().map(Value::from_json).collect::<Result<_, _>>()?;
                Ok(Value::List(vs))
            },
            other => Err(LangError::UnsupportedJson(other.to_string())),
        }
    }

    /// Encode a value into its JSON transport form, the inverse of
    /// `from_json` for everything the reader can produce: literals map
    /// directly, symbolic values are printed back to source text.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Int(i) => JsonValue::from(*i),
            Value::Bool(b) => JsonValue::from(*b),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            printed => JsonValue::String(printed.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(true) => write!(f, "true"),
            Value::Bool(false) => write!(f, "false"),
            Value::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            },
            Value::Atom(a) => write!(f, "{a}"),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            },
            Value::Lambda(lambda) => {
                write!(f, "(fn (")?;
                for (i, p) in lambda.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")?;
                for b in &lambda.body {
                    write!(f, " {b}")?;
                }
                write!(f, ")")
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::Value;

    #[test]
    fn test_literals_round_trip_json() {
        for json in [json!(42), json!(-7), json!(true), json!([1, 2, 3])] {
            let v = Value::from_json(&json).unwrap();
            assert_eq!(v.to_json(), json);
        }
    }

    #[test]
    fn test_json_string_is_source_text() {
        let v = Value::from_json(&json!("(+ 1 2)")).unwrap();
        assert_eq!(
            v,
            Value::List(vec![Value::atom("+"), Value::Int(1), Value::Int(2)])
        );

        let s = Value::from_json(&json!("\"hello\"")).unwrap();
        assert_eq!(s, Value::Str("hello".to_string()));
        assert_eq!(s.to_json(), json!("\"hello\""));
    }

    #[test]
    fn test_unsupported_json_rejected() {
        assert!(Value::from_json(&json!(1.5)).is_err());
        assert!(Value::from_json(&json!({"a": 1})).is_err());
        assert!(Value::from_json(&json!(null)).is_err());
    }

    #[test]
    fn test_string_printing_escapes() {
        let v = Value::Str("a\"b\\c".to_string());
        assert_eq!(v.to_string(), r#""a\"b\\c""#);
    }
}
