pub mod registry;
pub mod scaled;
pub mod size;

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

pub use registry::{FlagEntry, Partition, Registry};
pub use scaled::ScaledIntegerParameter;
pub use size::{format_size, parse_size, SizeUnit};

/// separator between the start, end and (memory only) scale of a range
pub const RANGE_SEPARATOR: char = ',';

/// map of external flag -> Parameter
pub type ParamMap = BTreeMap<String, Parameter>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Empty range argument")]
    Empty,
    #[error("{kind} parameters accept at most {max} comma separated values, got {found}")]
    TooManyValues {
        kind: ParamKind,
        max: usize,
        found: usize,
    },
    #[error("Expected a positive int value, got '{0}'")]
    InvalidInteger(String),
    #[error("Invalid memory size '{0}'. Size must be specified as bytes (b), kibibytes (k), mebibytes (m), gibibytes (g), tebibytes (t), or pebibytes (p). E.g. 50b, 100kb, or 250mb")]
    InvalidSize(String),
    #[error("Invalid boolean '{0}', expected true or false")]
    InvalidBoolean(String),
    #[error("Input bytes must be integral, got {0}")]
    NonIntegralBytes(f64),
    #[error("Range start {start} is greater than its end {end}")]
    InvertedRange { start: u64, end: u64 },
    #[error("Illegal value {value} for {kind} parameter {name}")]
    IllegalValue {
        name: String,
        kind: ParamKind,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Memory,
    Boolean,
}

impl ParamKind {
    /// how many comma separated tokens `Parameter::parse` accepts
    pub fn max_values(self) -> usize {
        match self {
            Self::String => 1,
            Self::Integer | Self::Boolean => 2,
            Self::Memory => 3,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Memory => "memory",
            Self::Boolean => "boolean",
        })
    }
}

/// A parameter value, either a point or a search range.
///
/// Ranges only exist with `start < end`; the constructors collapse
/// `start == end` to a point and reject `start > end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Integer(u64),
    IntegerRange { start: u64, end: u64 },
    /// exact byte count
    Memory(u64),
    MemoryRange { start: u64, end: u64, scale: u64 },
    Boolean(bool),
    /// both `true` and `false` are candidates
    BooleanToggle,
}

impl Value {
    pub fn integer_range(start: u64, end: u64) -> Result<Self, ParseError> {
        match start.cmp(&end) {
            std::cmp::Ordering::Less => Ok(Self::IntegerRange { start, end }),
            std::cmp::Ordering::Equal => Ok(Self::Integer(start)),
            std::cmp::Ordering::Greater => Err(ParseError::InvertedRange { start, end }),
        }
    }

    pub fn memory_range(start: u64, end: u64, scale: u64) -> Result<Self, ParseError> {
        match start.cmp(&end) {
            std::cmp::Ordering::Less => Ok(Self::MemoryRange { start, end, scale }),
            std::cmp::Ordering::Equal => Ok(Self::Memory(start)),
            std::cmp::Ordering::Greater => Err(ParseError::InvertedRange { start, end }),
        }
    }

    pub fn kind(&self) -> ParamKind {
        match self {
            Self::String(_) => ParamKind::String,
            Self::Integer(_) | Self::IntegerRange { .. } => ParamKind::Integer,
            Self::Memory(_) | Self::MemoryRange { .. } => ParamKind::Memory,
            Self::Boolean(_) | Self::BooleanToggle => ParamKind::Boolean,
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Self::IntegerRange { .. } | Self::MemoryRange { .. } | Self::BooleanToggle
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Integer(value) | Self::Memory(value) => write!(f, "{value}"),
            Self::IntegerRange { start, end } => write!(f, "{start},{end}"),
            Self::MemoryRange { start, end, scale } => write!(f, "{start},{end},{scale}"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::BooleanToggle => f.write_str("false,true"),
        }
    }
}

/// A concrete value handed back by a search engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

/// A named, immutable Spark parameter.
///
/// Every transformation (`parse`, `materialize`) returns a new Parameter
/// sharing the name and description, so registry defaults can be handed
/// out by reference for every candidate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    name: String,
    value: Value,
    description: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Value, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            description: description.into(),
        }
    }

    pub fn string(name: &str, value: &str, description: &str) -> Self {
        Self::new(name, Value::String(value.to_string()), description)
    }

    pub fn integer(name: &str, value: u64, description: &str) -> Self {
        Self::new(name, Value::Integer(value), description)
    }

    pub fn memory(name: &str, bytes: u64, description: &str) -> Self {
        Self::new(name, Value::Memory(bytes), description)
    }

    pub fn boolean(name: &str, value: bool, description: &str) -> Self {
        Self::new(name, Value::Boolean(value), description)
    }

    /// native Spark name, e.g. `executor-memory`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> ParamKind {
        self.value.kind()
    }

    pub fn is_range(&self) -> bool {
        self.value.is_range()
    }

    pub(crate) fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn with_value(&self, value: Value) -> Self {
        Self {
            name: self.name.clone(),
            value,
            description: self.description.clone(),
        }
    }

    /// Create a new parameter of the same kind from a point (`4g`) or
    /// range (`1g,4g` or, for memory, `1g,4g,512m`) string
    pub fn parse(&self, raw: &str) -> Result<Self, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }

        let kind = self.kind();

        if kind == ParamKind::String {
            return Ok(self.with_value(Value::String(raw.to_string())));
        }

        let tokens: Vec<&str> = raw.split(RANGE_SEPARATOR).collect();

        if tokens.len() > kind.max_values() {
            return Err(ParseError::TooManyValues {
                kind,
                max: kind.max_values(),
                found: tokens.len(),
            });
        }

        let value = match kind {
            ParamKind::Integer => {
                let values = tokens
                    .iter()
                    .map(|token| parse_integer(token))
                    .collect::<Result<Vec<_>, _>>()?;

                match values[..] {
                    [point] => Value::Integer(point),
                    [start, end] => Value::integer_range(start, end)?,
                    _ => unreachable!("token count checked against max_values"),
                }
            }
            ParamKind::Memory => {
                let values = tokens
                    .iter()
                    .map(|token| parse_size(token))
                    .collect::<Result<Vec<_>, _>>()?;

                match values[..] {
                    [point] => Value::Memory(point),
                    // the implicit scale is one byte, not one unit of the input
                    [start, end] => Value::memory_range(start, end, 1)?,
                    [start, end, scale] => Value::memory_range(start, end, scale)?,
                    _ => unreachable!("token count checked against max_values"),
                }
            }
            ParamKind::Boolean => {
                let values = tokens
                    .iter()
                    .map(|token| parse_boolean(token))
                    .collect::<Result<Vec<_>, _>>()?;

                match values[..] {
                    [point] => Value::Boolean(point),
                    [first, second] if first == second => Value::Boolean(first),
                    [_, _] => Value::BooleanToggle,
                    _ => unreachable!("token count checked against max_values"),
                }
            }
            ParamKind::String => unreachable!("handled above"),
        };

        Ok(self.with_value(value))
    }

    /// Create a point parameter of the same kind from a value chosen by a
    /// search engine
    pub fn materialize(&self, scalar: &Scalar) -> Result<Self, ParseError> {
        let illegal = || ParseError::IllegalValue {
            name: self.name.clone(),
            kind: self.kind(),
            value: scalar.to_string(),
        };

        let value = match (self.kind(), scalar) {
            (ParamKind::String, Scalar::String(value)) => Value::String(value.clone()),
            (ParamKind::Integer, Scalar::Integer(value)) if *value > 0 => {
                Value::Integer(*value as u64)
            }
            (ParamKind::Memory, Scalar::Integer(value)) if *value > 0 => {
                Value::Memory(*value as u64)
            }
            (ParamKind::Boolean, Scalar::Boolean(value)) => Value::Boolean(*value),
            _ => return Err(illegal()),
        };

        Ok(self.with_value(value))
    }

    /// start of a numeric range, or the point value itself
    pub fn range_start(&self) -> Option<u64> {
        match self.value {
            Value::Integer(value) | Value::Memory(value) => Some(value),
            Value::IntegerRange { start, .. } | Value::MemoryRange { start, .. } => Some(start),
            Value::String(_) | Value::Boolean(_) | Value::BooleanToggle => None,
        }
    }

    /// end of a numeric range, or the point value itself
    pub fn range_end(&self) -> Option<u64> {
        match self.value {
            Value::Integer(value) | Value::Memory(value) => Some(value),
            Value::IntegerRange { end, .. } | Value::MemoryRange { end, .. } => Some(end),
            Value::String(_) | Value::Boolean(_) | Value::BooleanToggle => None,
        }
    }

    /// search step of a memory range, 1 for every other memory value
    pub fn scale(&self) -> Option<u64> {
        match self.value {
            Value::MemoryRange { scale, .. } => Some(scale),
            Value::Memory(_) => Some(1),
            _ => None,
        }
    }

    /// Render the value the way spark-submit should receive it. Memory is
    /// always written with an explicit unit, truncated to kibibytes, so
    /// Spark never guesses the unit of a bare number.
    pub fn render(&self) -> String {
        match &self.value {
            Value::Memory(bytes) => format_size(*bytes, Some(SizeUnit::Kibi)),
            value => value.to_string(),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.name,
            self.is_range(),
            self.kind(),
            self.value
        )
    }
}

fn parse_integer(token: &str) -> Result<u64, ParseError> {
    if token.is_empty() || !token.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ParseError::InvalidInteger(token.to_string()));
    }

    match token.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ParseError::InvalidInteger(token.to_string())),
    }
}

fn parse_boolean(token: &str) -> Result<bool, ParseError> {
    match token.to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ParseError::InvalidBoolean(token.to_string())),
    }
}
