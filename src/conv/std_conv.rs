//! The standard converter family: integer widths, IEEE-754 floats, linear
//! scaling, bit extraction, and strings, plus the default command
//! converter used when a command declares none.

use serde_json::Value as JsonValue;

use crate::conv::{
    resolve_args, ArgSpec, ArgType, ArgValue, ArgValues, ConversionError, Converter,
    ConverterPlugin, MqttValue, RawArg,
};

pub(crate) fn swap_word_bytes(word: u16) -> u16 {
    word.rotate_left(8)
}

/// Combine two register words into a 32-bit quantity. `low_first` selects
/// word order, `swap_bytes` the byte order within each word; together they
/// cover the ABCD/CDAB/BADC/DCBA layouts.
pub(crate) fn u32_from_words(
    words: &[u16],
    low_first: bool,
    swap_bytes: bool,
) -> Result<u32, ConversionError> {
    if words.len() < 2 {
        return Err(ConversionError::new(
            "cannot read a 32-bit value from a single register",
        ));
    }
    let (mut high, mut low) = if low_first {
        (words[1], words[0])
    } else {
        (words[0], words[1])
    };
    if swap_bytes {
        high = swap_word_bytes(high);
        low = swap_word_bytes(low);
    }
    Ok((u32::from(high) << 16) | u32::from(low))
}

pub(crate) fn words_from_u32(value: u32, low_first: bool, swap_bytes: bool, count: u16) -> Vec<u16> {
    if count < 2 {
        return vec![value as u16];
    }
    let mut high = (value >> 16) as u16;
    let mut low = value as u16;
    if swap_bytes {
        high = swap_word_bytes(high);
        low = swap_word_bytes(low);
    }
    if low_first {
        vec![low, high]
    } else {
        vec![high, low]
    }
}

fn to_u16(value: i64) -> Result<u16, ConversionError> {
    u16::try_from(value)
        .map_err(|_| ConversionError::new(format!("register value {value} out of range")))
}

fn precision_arg(values: &ArgValues) -> Result<Option<u8>, ConversionError> {
    let raw = values.get("precision").as_int()?;
    if raw < 0 {
        Ok(None)
    } else if raw <= 15 {
        Ok(Some(raw as u8))
    } else {
        Err(ConversionError::new(format!("precision {raw} too large")))
    }
}

const PRECISION: ArgSpec = ArgSpec::new("precision", ArgType::Int, ArgValue::Int(-1));
const LOW_FIRST: ArgSpec = ArgSpec::new("low_first", ArgType::Bool, ArgValue::Bool(false));
const SWAP_BYTES: ArgSpec = ArgSpec::new("swap_bytes", ArgType::Bool, ArgValue::Bool(false));

struct Int16Converter;

impl Converter for Int16Converter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        Ok(MqttValue::Int(i64::from(registers[0] as i16)))
    }

    fn to_modbus(&self, value: &MqttValue, _count: u16) -> Result<Vec<u16>, ConversionError> {
        let v = value.as_i64()?;
        let v = i16::try_from(v)
            .map_err(|_| ConversionError::new(format!("value {v} out of int16 range")))?;
        Ok(vec![v as u16])
    }
}

struct Int8Converter {
    first_byte: bool,
    signed: bool,
}

impl Converter for Int8Converter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        let word = registers[0];
        let byte = if self.first_byte {
            (word >> 8) as u8
        } else {
            word as u8
        };
        let value = if self.signed {
            i64::from(byte as i8)
        } else {
            i64::from(byte)
        };
        Ok(MqttValue::Int(value))
    }
}

struct Int32Converter {
    low_first: bool,
    swap_bytes: bool,
}

impl Converter for Int32Converter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        if registers.len() < 2 {
            return Ok(MqttValue::Int(i64::from(registers[0] as i16)));
        }
        let raw = u32_from_words(registers, self.low_first, self.swap_bytes)?;
        Ok(MqttValue::Int(i64::from(raw as i32)))
    }

    fn to_modbus(&self, value: &MqttValue, count: u16) -> Result<Vec<u16>, ConversionError> {
        let v = value.as_i64()?;
        let v = i32::try_from(v)
            .map_err(|_| ConversionError::new(format!("value {v} out of int32 range")))?;
        Ok(words_from_u32(v as u32, self.low_first, self.swap_bytes, count))
    }
}

struct UInt32Converter {
    low_first: bool,
    swap_bytes: bool,
}

impl Converter for UInt32Converter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        if registers.len() < 2 {
            return Ok(MqttValue::Int(i64::from(registers[0])));
        }
        let raw = u32_from_words(registers, self.low_first, self.swap_bytes)?;
        Ok(MqttValue::Int(i64::from(raw)))
    }

    fn to_modbus(&self, value: &MqttValue, count: u16) -> Result<Vec<u16>, ConversionError> {
        let v = value.as_i64()?;
        let v = u32::try_from(v)
            .map_err(|_| ConversionError::new(format!("value {v} out of uint32 range")))?;
        Ok(words_from_u32(v, self.low_first, self.swap_bytes, count))
    }
}

struct Float32Converter {
    precision: Option<u8>,
    low_first: bool,
    swap_bytes: bool,
}

impl Converter for Float32Converter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        let raw = u32_from_words(registers, self.low_first, self.swap_bytes)?;
        Ok(MqttValue::float_with_precision(
            f64::from(f32::from_bits(raw)),
            self.precision,
        ))
    }

    fn to_modbus(&self, value: &MqttValue, count: u16) -> Result<Vec<u16>, ConversionError> {
        if count < 2 {
            return Err(ConversionError::new(
                "cannot store a 32-bit float in a single register",
            ));
        }
        let bits = (value.as_f64()? as f32).to_bits();
        Ok(words_from_u32(bits, self.low_first, self.swap_bytes, count))
    }
}

struct DivideConverter {
    divider: f64,
    precision: Option<u8>,
    low_first: bool,
}

impl DivideConverter {
    fn round(&self, value: f64) -> f64 {
        match self.precision {
            Some(p) => {
                let factor = 10f64.powi(i32::from(p));
                (value * factor).round() / factor
            }
            None => value,
        }
    }
}

impl Converter for DivideConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        let value = if registers.len() == 1 {
            f64::from(registers[0] as i16)
        } else {
            f64::from(u32_from_words(registers, self.low_first, false)? as i32)
        };
        Ok(MqttValue::float_with_precision(
            self.round(value / self.divider),
            self.precision,
        ))
    }

    fn to_modbus(&self, value: &MqttValue, count: u16) -> Result<Vec<u16>, ConversionError> {
        let scaled = (value.as_f64()? * self.divider).round();
        if scaled < f64::from(i32::MIN) || scaled > f64::from(i32::MAX) {
            return Err(ConversionError::new(format!("value {scaled} out of range")));
        }
        Ok(words_from_u32(scaled as i32 as u32, self.low_first, false, count))
    }
}

struct ScaleConverter {
    source_from: f64,
    source_to: f64,
    target_from: f64,
    target_to: f64,
    precision: Option<u8>,
}

impl Converter for ScaleConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        let source = f64::from(registers[0]);
        let mut target = (self.target_to - self.target_from) * (source - self.source_from)
            / (self.source_to - self.source_from)
            + self.target_from;
        if let Some(p) = self.precision {
            let factor = 10f64.powi(i32::from(p));
            target = (target * factor).round() / factor;
        }
        Ok(MqttValue::float_with_precision(target, self.precision))
    }

    fn to_modbus(&self, value: &MqttValue, _count: u16) -> Result<Vec<u16>, ConversionError> {
        let target = value.as_f64()?;
        let source = (target - self.target_from) * (self.source_to - self.source_from)
            / (self.target_to - self.target_from)
            + self.source_from;
        to_u16(source.round() as i64).map(|v| vec![v])
    }
}

struct BitmaskConverter {
    mask: u16,
}

impl Converter for BitmaskConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        Ok(MqttValue::Int(i64::from(registers[0] & self.mask)))
    }

    fn to_modbus(&self, value: &MqttValue, _count: u16) -> Result<Vec<u16>, ConversionError> {
        let v = to_u16(value.as_i64()?)?;
        Ok(vec![v & self.mask])
    }
}

struct BitConverter {
    bit: u8,
}

impl Converter for BitConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        Ok(MqttValue::Int(i64::from(
            (registers[0] >> (self.bit - 1)) & 1,
        )))
    }
}

#[derive(PartialEq)]
enum StringEncoding {
    None,
    Ascii16Be,
}

struct StringConverter {
    encoding: StringEncoding,
}

impl Converter for StringConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &word in registers {
            match self.encoding {
                StringEncoding::None => bytes.extend_from_slice(&word.to_le_bytes()),
                StringEncoding::Ascii16Be => bytes.extend_from_slice(&word.to_be_bytes()),
            }
        }
        let text = String::from_utf8_lossy(&bytes)
            .trim_end_matches('\0')
            .to_string();
        Ok(MqttValue::Text(text))
    }

    fn to_modbus(&self, value: &MqttValue, count: u16) -> Result<Vec<u16>, ConversionError> {
        let mut bytes = value.to_payload_string().into_bytes();
        if bytes.len() % 2 != 0 {
            bytes.push(0);
        }
        let mut words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| match self.encoding {
                StringEncoding::None => u16::from_le_bytes([pair[0], pair[1]]),
                StringEncoding::Ascii16Be => u16::from_be_bytes([pair[0], pair[1]]),
            })
            .collect();
        words.truncate(usize::from(count));
        Ok(words)
    }
}

/// Fallback for commands without a configured converter: a scalar payload
/// maps to one register, a JSON array to a multi-register write of exactly
/// the declared size.
pub struct DefaultCommandConverter;

impl Converter for DefaultCommandConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        Ok(MqttValue::from_register(registers[0]))
    }

    fn to_modbus(&self, value: &MqttValue, count: u16) -> Result<Vec<u16>, ConversionError> {
        if count > 1 {
            let payload = value.to_payload_string();
            let parsed: JsonValue = serde_json::from_str(&payload)
                .map_err(|e| ConversionError::new(format!("invalid json payload: {e}")))?;
            let items = parsed.as_array().ok_or_else(|| {
                ConversionError::new("only a json array converts to multiple registers")
            })?;
            if items.len() != usize::from(count) {
                return Err(ConversionError::new(format!(
                    "wrong json array size ({}), need {count}",
                    items.len()
                )));
            }
            items
                .iter()
                .map(|item| {
                    item.as_i64()
                        .ok_or_else(|| ConversionError::new(format!("'{item}' is not an integer")))
                        .and_then(to_u16)
                })
                .collect()
        } else {
            to_u16(value.as_i64()?).map(|v| vec![v])
        }
    }
}

pub struct StdPlugin;

impl ConverterPlugin for StdPlugin {
    fn name(&self) -> &'static str {
        "std"
    }

    fn create(
        &self,
        converter: &str,
        raw: &[RawArg],
    ) -> Result<Box<dyn Converter>, ConversionError> {
        match converter {
            "int16" => {
                resolve_args(&[], raw)?;
                Ok(Box::new(Int16Converter))
            }
            "int8" | "uint8" => {
                let schema = [ArgSpec::new(
                    "first_byte",
                    ArgType::Bool,
                    ArgValue::Bool(false),
                )];
                let values = resolve_args(&schema, raw)?;
                Ok(Box::new(Int8Converter {
                    first_byte: values.get("first_byte").as_bool()?,
                    signed: converter == "int8",
                }))
            }
            "int32" | "uint32" => {
                let schema = [LOW_FIRST, SWAP_BYTES];
                let values = resolve_args(&schema, raw)?;
                let low_first = values.get("low_first").as_bool()?;
                let swap_bytes = values.get("swap_bytes").as_bool()?;
                if converter == "int32" {
                    Ok(Box::new(Int32Converter {
                        low_first,
                        swap_bytes,
                    }))
                } else {
                    Ok(Box::new(UInt32Converter {
                        low_first,
                        swap_bytes,
                    }))
                }
            }
            "float32" => {
                let schema = [PRECISION, LOW_FIRST, SWAP_BYTES];
                let values = resolve_args(&schema, raw)?;
                Ok(Box::new(Float32Converter {
                    precision: precision_arg(&values)?,
                    low_first: values.get("low_first").as_bool()?,
                    swap_bytes: values.get("swap_bytes").as_bool()?,
                }))
            }
            "divide" => {
                let schema = [
                    ArgSpec::new("divider", ArgType::Double, ArgValue::Double(1.0)),
                    PRECISION,
                    LOW_FIRST,
                ];
                let values = resolve_args(&schema, raw)?;
                let divider = values.get("divider").as_double()?;
                if divider == 0.0 {
                    return Err(ConversionError::new("divider cannot be zero"));
                }
                Ok(Box::new(DivideConverter {
                    divider,
                    precision: precision_arg(&values)?,
                    low_first: values.get("low_first").as_bool()?,
                }))
            }
            "scale" => {
                let schema = [
                    ArgSpec::new("source_from", ArgType::Double, ArgValue::Double(0.0)),
                    ArgSpec::new("source_to", ArgType::Double, ArgValue::Double(1.0)),
                    ArgSpec::new("target_from", ArgType::Double, ArgValue::Double(0.0)),
                    ArgSpec::new("target_to", ArgType::Double, ArgValue::Double(1.0)),
                    PRECISION,
                ];
                let values = resolve_args(&schema, raw)?;
                let source_from = values.get("source_from").as_double()?;
                let source_to = values.get("source_to").as_double()?;
                let target_from = values.get("target_from").as_double()?;
                let target_to = values.get("target_to").as_double()?;
                if source_from == source_to || target_from == target_to {
                    return Err(ConversionError::new("scale ranges cannot be empty"));
                }
                Ok(Box::new(ScaleConverter {
                    source_from,
                    source_to,
                    target_from,
                    target_to,
                    precision: precision_arg(&values)?,
                }))
            }
            "bitmask" => {
                let schema = [ArgSpec::new("mask", ArgType::Int, ArgValue::Int(0xffff))];
                let values = resolve_args(&schema, raw)?;
                let mask = values.get("mask").as_int()?;
                to_u16(mask).map(|mask| Box::new(BitmaskConverter { mask }) as Box<dyn Converter>)
            }
            "bit" => {
                let schema = [ArgSpec::new("bit", ArgType::Int, ArgValue::Int(1))];
                let values = resolve_args(&schema, raw)?;
                let bit = values.get("bit").as_int()?;
                if !(1..=16).contains(&bit) {
                    return Err(ConversionError::new("bit number must be in range 1-16"));
                }
                Ok(Box::new(BitConverter { bit: bit as u8 }))
            }
            "string" => {
                let schema = [ArgSpec::new(
                    "encoding",
                    ArgType::String,
                    ArgValue::Str("none".into()),
                )];
                let values = resolve_args(&schema, raw)?;
                let encoding = match values.get("encoding").as_str()? {
                    "none" => StringEncoding::None,
                    "ascii16-be" => StringEncoding::Ascii16Be,
                    other => {
                        return Err(ConversionError::new(format!(
                            "unsupported encoding: {other}"
                        )))
                    }
                };
                Ok(Box::new(StringConverter { encoding }))
            }
            other => Err(ConversionError::new(format!("unknown converter '{other}'"))),
        }
    }
}
