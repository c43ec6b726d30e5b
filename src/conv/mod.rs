//! Register⇄value converters: the converter trait, argument schemas, the
//! `plugin.name(args…)` specification parser, and the plugin registry.

pub mod expr;
pub mod std_conv;
pub mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{BridgeError, Result};
pub use self::value::MqttValue;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConversionError {
    pub message: String,
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        ConversionError {
            message: message.into(),
        }
    }
}

/// A pure register⇄value function pair. Read-only converters keep the
/// default `to_modbus`.
pub trait Converter: Send + Sync {
    fn to_mqtt(&self, registers: &[u16]) -> std::result::Result<MqttValue, ConversionError>;

    fn to_modbus(
        &self,
        _value: &MqttValue,
        _register_count: u16,
    ) -> std::result::Result<Vec<u16>, ConversionError> {
        Err(ConversionError::new("converter does not support writes"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int,
    Double,
    Bool,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl ArgValue {
    pub fn as_int(&self) -> std::result::Result<i64, ConversionError> {
        match self {
            ArgValue::Int(v) => Ok(*v),
            other => Err(ConversionError::new(format!("expected int, got {other:?}"))),
        }
    }

    pub fn as_double(&self) -> std::result::Result<f64, ConversionError> {
        match self {
            ArgValue::Double(v) => Ok(*v),
            ArgValue::Int(v) => Ok(*v as f64),
            other => Err(ConversionError::new(format!(
                "expected number, got {other:?}"
            ))),
        }
    }

    pub fn as_bool(&self) -> std::result::Result<bool, ConversionError> {
        match self {
            ArgValue::Bool(v) => Ok(*v),
            other => Err(ConversionError::new(format!("expected bool, got {other:?}"))),
        }
    }

    pub fn as_str(&self) -> std::result::Result<&str, ConversionError> {
        match self {
            ArgValue::Str(v) => Ok(v),
            other => Err(ConversionError::new(format!(
                "expected string, got {other:?}"
            ))),
        }
    }
}

/// One entry of a converter's argument schema.
pub struct ArgSpec {
    pub name: &'static str,
    pub ty: ArgType,
    pub default: ArgValue,
}

impl ArgSpec {
    pub const fn new(name: &'static str, ty: ArgType, default: ArgValue) -> Self {
        ArgSpec { name, ty, default }
    }
}

/// Resolved argument values keyed by schema name.
#[derive(Debug, Default)]
pub struct ArgValues(BTreeMap<&'static str, ArgValue>);

impl ArgValues {
    pub fn get(&self, name: &str) -> &ArgValue {
        // schema resolution guarantees every declared name is present
        &self.0[name]
    }
}

/// A raw argument from a converter specification string, positional or
/// `key=value`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArg {
    pub name: Option<String>,
    pub value: String,
}

fn coerce(ty: ArgType, raw: &str) -> std::result::Result<ArgValue, ConversionError> {
    match ty {
        ArgType::Int => {
            let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))
            {
                i64::from_str_radix(hex, 16)
            } else {
                raw.parse::<i64>()
            };
            parsed
                .map(ArgValue::Int)
                .map_err(|_| ConversionError::new(format!("'{raw}' is not an integer")))
        }
        ArgType::Double => raw
            .parse::<f64>()
            .map(ArgValue::Double)
            .map_err(|_| ConversionError::new(format!("'{raw}' is not a number"))),
        ArgType::Bool => match raw {
            "true" | "1" => Ok(ArgValue::Bool(true)),
            "false" | "0" => Ok(ArgValue::Bool(false)),
            _ => Err(ConversionError::new(format!("'{raw}' is not a bool"))),
        },
        ArgType::String => Ok(ArgValue::Str(raw.to_string())),
    }
}

/// Match raw arguments against a schema: positional arguments fill the
/// schema in order, named arguments override by name, defaults fill the
/// rest.
pub fn resolve_args(
    schema: &[ArgSpec],
    raw: &[RawArg],
) -> std::result::Result<ArgValues, ConversionError> {
    let mut values = BTreeMap::new();
    for spec in schema {
        values.insert(spec.name, spec.default.clone());
    }

    let mut position = 0usize;
    for arg in raw {
        let spec = match &arg.name {
            Some(name) => schema
                .iter()
                .find(|s| s.name == name.as_str())
                .ok_or_else(|| ConversionError::new(format!("unknown argument '{name}'")))?,
            None => {
                let spec = schema.get(position).ok_or_else(|| {
                    ConversionError::new(format!(
                        "too many arguments, converter takes {}",
                        schema.len()
                    ))
                })?;
                position += 1;
                spec
            }
        };
        values.insert(spec.name, coerce(spec.ty, &arg.value)?);
    }

    Ok(ArgValues(values))
}

/// Parse a converter specification like `std.divide(10, precision=2)` into
/// `(plugin, converter, args)`. The plugin defaults to `std` when the name
/// carries no dot. Quoted arguments may contain commas and parentheses.
pub fn parse_converter_spec(spec: &str) -> Result<(String, String, Vec<RawArg>)> {
    let spec = spec.trim();
    let (name_part, args_part) = match spec.find('(') {
        Some(open) => {
            if !spec.ends_with(')') {
                return Err(BridgeError::config(format!(
                    "converter '{spec}': missing closing parenthesis"
                )));
            }
            (&spec[..open], Some(&spec[open + 1..spec.len() - 1]))
        }
        None => (spec, None),
    };

    let name_part = name_part.trim();
    if name_part.is_empty() {
        return Err(BridgeError::config("empty converter name"));
    }
    let (plugin, converter) = match name_part.split_once('.') {
        Some((plugin, converter)) => (plugin.to_string(), converter.to_string()),
        None => ("std".to_string(), name_part.to_string()),
    };

    let mut args = Vec::new();
    if let Some(args_part) = args_part {
        for piece in split_args(args_part)? {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let (name, value) = match split_named(piece) {
                Some((name, value)) => (Some(name.to_string()), value.trim()),
                None => (None, piece),
            };
            args.push(RawArg {
                name,
                value: unquote(value).to_string(),
            });
        }
    }

    Ok((plugin, converter, args))
}

/// Split on commas that are outside quotes and parentheses.
fn split_args(input: &str) -> Result<Vec<String>> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        BridgeError::config(format!("unbalanced parentheses in '{input}'"))
                    })?;
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    pieces.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return Err(BridgeError::config(format!("unterminated quote in '{input}'")));
    }
    pieces.push(current);
    Ok(pieces)
}

/// `key=value` split that ignores `=` inside quotes.
fn split_named(piece: &str) -> Option<(&str, &str)> {
    let trimmed = piece.trim_start();
    if trimmed.starts_with('"') || trimmed.starts_with('\'') {
        return None;
    }
    let eq = piece.find('=')?;
    let name = piece[..eq].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, &piece[eq + 1..]))
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// A converter family registered under one name, e.g. `std` or `expr`.
pub trait ConverterPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(
        &self,
        converter: &str,
        args: &[RawArg],
    ) -> std::result::Result<Box<dyn Converter>, ConversionError>;
}

/// `name → plugin` map populated at startup with the built-in families.
pub struct ConverterRegistry {
    plugins: BTreeMap<&'static str, Box<dyn ConverterPlugin>>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConverterRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = ConverterRegistry {
            plugins: BTreeMap::new(),
        };
        registry
            .register(Box::new(std_conv::StdPlugin))
            .expect("builtin plugin registration cannot collide");
        registry
            .register(Box::new(expr::ExprPlugin))
            .expect("builtin plugin registration cannot collide");
        registry
    }

    pub fn register(&mut self, plugin: Box<dyn ConverterPlugin>) -> Result<()> {
        let name = plugin.name();
        if self.plugins.contains_key(name) {
            return Err(BridgeError::config(format!(
                "converter plugin '{name}' already registered"
            )));
        }
        log::info!("added converter plugin {name}");
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn create(&self, spec: &str) -> Result<Arc<dyn Converter>> {
        let (plugin_name, converter, args) = parse_converter_spec(spec)?;
        let plugin = self.plugins.get(plugin_name.as_str()).ok_or_else(|| {
            BridgeError::config(format!("unknown converter plugin '{plugin_name}'"))
        })?;
        plugin
            .create(&converter, &args)
            .map(Arc::from)
            .map_err(|e| BridgeError::config(format!("converter '{spec}': {e}")))
    }
}
