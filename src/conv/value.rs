use serde_json::Value as JsonValue;

use crate::conv::ConversionError;

/// A value travelling between register words and MQTT payloads.
///
/// Floats remember their configured precision so payload formatting and
/// JSON generation stay consistent with what the converter produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttValue {
    Int(i64),
    Float { value: f64, precision: Option<u8> },
    Text(String),
}

impl MqttValue {
    pub fn from_register(value: u16) -> Self {
        MqttValue::Int(i64::from(value))
    }

    pub fn float(value: f64) -> Self {
        MqttValue::Float {
            value,
            precision: None,
        }
    }

    pub fn float_with_precision(value: f64, precision: Option<u8>) -> Self {
        MqttValue::Float { value, precision }
    }

    pub fn text(value: impl Into<String>) -> Self {
        MqttValue::Text(value.into())
    }

    pub fn as_i64(&self) -> Result<i64, ConversionError> {
        match self {
            MqttValue::Int(v) => Ok(*v),
            MqttValue::Float { value, .. } => Ok(*value as i64),
            MqttValue::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                ConversionError::new(format!("cannot convert '{s}' to an integer"))
            }),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ConversionError> {
        match self {
            MqttValue::Int(v) => Ok(*v as f64),
            MqttValue::Float { value, .. } => Ok(*value),
            MqttValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ConversionError::new(format!("cannot convert '{s}' to a number"))),
        }
    }

    /// Scalar payload representation: integral floats without an explicit
    /// precision collapse to their integer form.
    pub fn to_payload_string(&self) -> String {
        match self {
            MqttValue::Int(v) => v.to_string(),
            MqttValue::Float { value, precision } => format_float(*value, *precision),
            MqttValue::Text(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            MqttValue::Int(v) => JsonValue::from(*v),
            MqttValue::Float { value, precision } => {
                let rounded = match precision {
                    Some(p) => {
                        let factor = 10f64.powi(i32::from(*p));
                        (value * factor).round() / factor
                    }
                    None => *value,
                };
                serde_json::Number::from_f64(rounded)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
            MqttValue::Text(s) => JsonValue::from(s.clone()),
        }
    }
}

fn format_float(value: f64, precision: Option<u8>) -> String {
    match precision {
        Some(p) => format!("{value:.prec$}", prec = usize::from(p)),
        None => {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", value as i64)
            } else {
                format!("{value}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_float_formats_as_integer() {
        assert_eq!(MqttValue::float(3.0).to_payload_string(), "3");
        assert_eq!(MqttValue::float(-7.0).to_payload_string(), "-7");
    }

    #[test]
    fn fractional_float_keeps_fraction() {
        assert_eq!(MqttValue::float(3.25).to_payload_string(), "3.25");
    }

    #[test]
    fn precision_forces_fixed_format() {
        assert_eq!(
            MqttValue::float_with_precision(3.0, Some(2)).to_payload_string(),
            "3.00"
        );
        assert_eq!(
            MqttValue::float_with_precision(3.14159, Some(2)).to_payload_string(),
            "3.14"
        );
    }

    #[test]
    fn text_parses_to_numbers() {
        assert_eq!(MqttValue::text("42").as_i64().unwrap(), 42);
        assert_eq!(MqttValue::text("4.5").as_f64().unwrap(), 4.5);
        assert!(MqttValue::text("abc").as_i64().is_err());
    }

    #[test]
    fn json_respects_precision() {
        assert_eq!(
            MqttValue::float_with_precision(3.14159, Some(2)).to_json(),
            serde_json::json!(3.14)
        );
        assert_eq!(MqttValue::Int(5).to_json(), serde_json::json!(5));
    }
}
