//! Parsed script commands.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A typed command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Argument {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Map(Map<String, Value>),
    List(Vec<Value>),
}

impl Argument {
    /// The argument as it goes over the wire.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Long(l) => Value::from(*l),
            Self::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
            Self::Double(d) => Number::from_f64(*d).map_or(Value::Null, Value::Number),
            Self::String(s) => Value::String(s.clone()),
            Self::Map(m) => Value::Object(m.clone()),
            Self::List(l) => Value::Array(l.clone()),
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// One script command: service, command name and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    service: String,
    command: String,
    arguments: Vec<Argument>,
}

impl Token {
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        command: impl Into<String>,
        arguments: Vec<Argument>,
    ) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            arguments,
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Arguments converted for the generic command service.
    #[must_use]
    pub fn json_arguments(&self) -> Vec<Value> {
        self.arguments.iter().map(Argument::to_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_json() {
        let token = Token::new(
            "FileSystem",
            "open",
            vec![
                Argument::String("/tmp/a.txt".to_string()),
                Argument::Int(7),
                Argument::Long(1 << 40),
                Argument::Float(0.5),
                Argument::Bool(true),
                Argument::Null,
                Argument::List(vec![json!(1), json!(2)]),
            ],
        );

        assert_eq!(token.service(), "FileSystem");
        assert_eq!(token.command(), "open");
        assert_eq!(
            token.json_arguments(),
            vec![
                json!("/tmp/a.txt"),
                json!(7),
                json!(1_099_511_627_776_i64),
                json!(0.5),
                json!(true),
                Value::Null,
                json!([1, 2]),
            ]
        );
    }

    #[test]
    fn test_non_finite_becomes_null() {
        assert_eq!(Argument::Double(f64::NAN).to_json(), Value::Null);
        assert_eq!(Argument::Float(f32::INFINITY).to_json(), Value::Null);
    }

    #[test]
    fn test_display() {
        assert_eq!(Argument::String("a b".to_string()).to_string(), "\"a b\"");
        assert_eq!(Argument::Int(-3).to_string(), "-3");
    }
}
