//! Expression converter: arithmetic over the register window exposed as
//! variables `R0…R9`, with fixed helper functions for multi-word decoding.
//! A comma-separated expression list yields a vector, mapping to a
//! multi-register write.

use crate::conv::std_conv::{swap_word_bytes, words_from_u32};
use crate::conv::{
    resolve_args, ArgSpec, ArgType, ArgValue, ConversionError, Converter, ConverterPlugin,
    MqttValue, RawArg,
};

pub const MAX_REGISTERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Int16,
    Int32,
    Int32Bs,
    UInt32,
    UInt32Bs,
    Flt32,
    Flt32Bs,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        match name {
            "int16" => Some(Func::Int16),
            "int32" => Some(Func::Int32),
            "int32bs" => Some(Func::Int32Bs),
            "uint32" => Some(Func::UInt32),
            "uint32bs" => Some(Func::UInt32Bs),
            "flt32" => Some(Func::Flt32),
            "flt32bs" => Some(Func::Flt32Bs),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Int16 => 1,
            _ => 2,
        }
    }

    fn eval(self, args: &[f64]) -> f64 {
        let combine = |swap: bool| -> u32 {
            let mut high = args[0] as i64 as u16;
            let mut low = args[1] as i64 as u16;
            if swap {
                high = swap_word_bytes(high);
                low = swap_word_bytes(low);
            }
            (u32::from(high) << 16) | u32::from(low)
        };
        match self {
            Func::Int16 => f64::from((args[0] as i64 as u16) as i16),
            Func::Int32 => f64::from(combine(false) as i32),
            Func::Int32Bs => f64::from(combine(true) as i32),
            Func::UInt32 => f64::from(combine(false)),
            Func::UInt32Bs => f64::from(combine(true)),
            Func::Flt32 => f64::from(f32::from_bits(combine(false))),
            Func::Flt32Bs => f64::from(f32::from_bits(combine(true))),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Register(usize),
    Negate(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    fn eval(&self, registers: &[f64]) -> Result<f64, ConversionError> {
        match self {
            Expr::Number(v) => Ok(*v),
            Expr::Register(index) => registers.get(*index).copied().ok_or_else(|| {
                ConversionError::new(format!("register variable R{index} out of window"))
            }),
            Expr::Negate(inner) => Ok(-inner.eval(registers)?),
            Expr::Binary(op, left, right) => {
                let l = left.eval(registers)?;
                let r = right.eval(registers)?;
                Ok(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Rem => l % r,
                })
            }
            Expr::Call(func, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.eval(registers)?);
                }
                Ok(func.eval(&values))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Open,
    Close,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConversionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else if c == 'e' || c == 'E' {
                        literal.push(c);
                        chars.next();
                        if let Some(&sign) = chars.peek() {
                            if sign == '+' || sign == '-' {
                                literal.push(sign);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                let value = literal.parse::<f64>().map_err(|_| {
                    ConversionError::new(format!("invalid number literal '{literal}'"))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ConversionError::new(format!(
                    "unexpected character '{other}' in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConversionError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(ConversionError::new(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn expression_list(&mut self) -> Result<Vec<Expr>, ConversionError> {
        let mut list = vec![self.expression()?];
        while self.peek() == Some(&Token::Comma) {
            self.next();
            list.push(self.expression()?);
        }
        Ok(list)
    }

    fn expression(&mut self) -> Result<Expr, ConversionError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ConversionError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.next();
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ConversionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Negate(Box::new(self.factor()?)))
            }
            Some(Token::Plus) => {
                self.next();
                self.factor()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ConversionError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Open) => {
                let inner = self.expression()?;
                self.expect(Token::Close)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if let Some(func) = Func::from_name(&name) {
                    self.expect(Token::Open)?;
                    let args = self.expression_list()?;
                    self.expect(Token::Close)?;
                    if args.len() != func.arity() {
                        return Err(ConversionError::new(format!(
                            "{name} takes {} argument(s), got {}",
                            func.arity(),
                            args.len()
                        )));
                    }
                    return Ok(Expr::Call(func, args));
                }
                if let Some(index) = name.strip_prefix('R') {
                    if let Ok(index) = index.parse::<usize>() {
                        if index >= MAX_REGISTERS {
                            return Err(ConversionError::new(format!(
                                "register variable {name} exceeds the window of {MAX_REGISTERS}"
                            )));
                        }
                        return Ok(Expr::Register(index));
                    }
                }
                Err(ConversionError::new(format!("unknown identifier '{name}'")))
            }
            other => Err(ConversionError::new(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }
}

fn parse(input: &str) -> Result<Vec<Expr>, ConversionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConversionError::new("empty expression"));
    }
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let list = parser.expression_list()?;
    if parser.peek().is_some() {
        return Err(ConversionError::new("trailing input after expression"));
    }
    Ok(list)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteAs {
    Raw,
    Int16,
    Int32,
    Int32Bs,
    UInt32,
    UInt32Bs,
    Flt32,
    Flt32Bs,
}

impl WriteAs {
    fn from_name(name: &str) -> Result<WriteAs, ConversionError> {
        match name {
            "" => Ok(WriteAs::Raw),
            "int16" => Ok(WriteAs::Int16),
            "int32" => Ok(WriteAs::Int32),
            "int32bs" => Ok(WriteAs::Int32Bs),
            "uint32" => Ok(WriteAs::UInt32),
            "uint32bs" => Ok(WriteAs::UInt32Bs),
            "flt32" => Ok(WriteAs::Flt32),
            "flt32bs" => Ok(WriteAs::Flt32Bs),
            other => Err(ConversionError::new(format!(
                "unknown write helper '{other}', valid: int16, int32, int32bs, uint32, uint32bs, flt32, flt32bs"
            ))),
        }
    }

    fn registers_per_value(self) -> usize {
        match self {
            WriteAs::Raw | WriteAs::Int16 => 1,
            _ => 2,
        }
    }

    fn encode(self, value: f64, low_first: bool) -> Result<Vec<u16>, ConversionError> {
        match self {
            WriteAs::Raw => {
                let v = value as i64;
                u16::try_from(v)
                    .map(|v| vec![v])
                    .map_err(|_| ConversionError::new(format!("value {v} out of range")))
            }
            WriteAs::Int16 => {
                let v = value as i64;
                i16::try_from(v)
                    .map(|v| vec![v as u16])
                    .map_err(|_| ConversionError::new(format!("value {v} out of int16 range")))
            }
            WriteAs::Int32 | WriteAs::Int32Bs => {
                let v = value as i64;
                let v = i32::try_from(v).map_err(|_| {
                    ConversionError::new(format!("value {v} out of int32 range"))
                })?;
                Ok(words_from_u32(
                    v as u32,
                    low_first,
                    self == WriteAs::Int32Bs,
                    2,
                ))
            }
            WriteAs::UInt32 | WriteAs::UInt32Bs => {
                let v = value as i64;
                let v = u32::try_from(v).map_err(|_| {
                    ConversionError::new(format!("value {v} out of uint32 range"))
                })?;
                Ok(words_from_u32(v, low_first, self == WriteAs::UInt32Bs, 2))
            }
            WriteAs::Flt32 | WriteAs::Flt32Bs => Ok(words_from_u32(
                (value as f32).to_bits(),
                low_first,
                self == WriteAs::Flt32Bs,
                2,
            )),
        }
    }
}

pub struct ExprConverter {
    expressions: Vec<Expr>,
    precision: Option<u8>,
    write_as: WriteAs,
    write_low_first: bool,
}

impl Converter for ExprConverter {
    fn to_mqtt(&self, registers: &[u16]) -> Result<MqttValue, ConversionError> {
        if registers.len() > MAX_REGISTERS {
            return Err(ConversionError::new(format!(
                "maximum {MAX_REGISTERS} registers allowed"
            )));
        }
        if self.expressions.len() != 1 {
            return Err(ConversionError::new(
                "an expression list can only be used for writes",
            ));
        }
        let mut window = [0f64; MAX_REGISTERS];
        for (slot, &value) in window.iter_mut().zip(registers) {
            *slot = f64::from(value);
        }
        let result = self.expressions[0].eval(&window)?;
        match self.precision {
            Some(0) => Ok(MqttValue::Int(result as i64)),
            precision => Ok(MqttValue::float_with_precision(result, precision)),
        }
    }

    fn to_modbus(&self, value: &MqttValue, register_count: u16) -> Result<Vec<u16>, ConversionError> {
        let mut window = [0f64; MAX_REGISTERS];
        window[0] = value.as_f64()?;

        let needed = self.expressions.len() * self.write_as.registers_per_value();
        if needed != usize::from(register_count) {
            return Err(ConversionError::new(format!(
                "expression produces {needed} register(s), command needs {register_count}"
            )));
        }

        let mut registers = Vec::with_capacity(needed);
        for expression in &self.expressions {
            let result = expression.eval(&window)?;
            registers.extend(self.write_as.encode(result, self.write_low_first)?);
        }
        Ok(registers)
    }
}

pub struct ExprPlugin;

impl ConverterPlugin for ExprPlugin {
    fn name(&self) -> &'static str {
        "expr"
    }

    fn create(
        &self,
        converter: &str,
        raw: &[RawArg],
    ) -> Result<Box<dyn Converter>, ConversionError> {
        if converter != "evaluate" {
            return Err(ConversionError::new(format!(
                "unknown converter '{converter}'"
            )));
        }
        let schema = [
            ArgSpec::new("expression", ArgType::String, ArgValue::Str(String::new())),
            ArgSpec::new("precision", ArgType::Int, ArgValue::Int(-1)),
            ArgSpec::new("write_as", ArgType::String, ArgValue::Str(String::new())),
            ArgSpec::new("low_first", ArgType::Bool, ArgValue::Bool(false)),
        ];
        let values = resolve_args(&schema, raw)?;

        let source = values.get("expression").as_str()?;
        if source.is_empty() {
            return Err(ConversionError::new("expression argument is required"));
        }
        let expressions = parse(source)?;

        let precision = match values.get("precision").as_int()? {
            p if p < 0 => None,
            p if p <= 15 => Some(p as u8),
            p => return Err(ConversionError::new(format!("precision {p} too large"))),
        };

        Ok(Box::new(ExprConverter {
            expressions,
            precision,
            write_as: WriteAs::from_name(values.get("write_as").as_str()?)?,
            write_low_first: values.get("low_first").as_bool()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::ConverterRegistry;

    fn make(spec: &str) -> std::sync::Arc<dyn Converter> {
        ConverterRegistry::with_builtins().create(spec).unwrap()
    }

    #[test]
    fn evaluates_arithmetic_with_precedence() {
        let conv = make("expr.evaluate(\"1 + 2 * 3\", 0)");
        assert_eq!(conv.to_mqtt(&[0]).unwrap(), MqttValue::Int(7));
        let conv = make("expr.evaluate(\"(1 + 2) * 3\", 0)");
        assert_eq!(conv.to_mqtt(&[0]).unwrap(), MqttValue::Int(9));
        let conv = make("expr.evaluate(\"-R0 + 1\", 0)");
        assert_eq!(conv.to_mqtt(&[5]).unwrap(), MqttValue::Int(-4));
    }

    #[test]
    fn exposes_register_window_as_variables() {
        let conv = make("expr.evaluate(\"R0 + R1 * 100\", 0)");
        assert_eq!(conv.to_mqtt(&[7, 3]).unwrap(), MqttValue::Int(307));
    }

    #[test]
    fn precision_controls_output_type() {
        let conv = make("expr.evaluate(\"R0 / 10\", 1)");
        assert_eq!(
            conv.to_mqtt(&[255]).unwrap(),
            MqttValue::float_with_precision(25.5, Some(1))
        );
        let conv = make("expr.evaluate(\"R0 / 10\")");
        assert!(matches!(
            conv.to_mqtt(&[255]).unwrap(),
            MqttValue::Float {
                precision: None,
                ..
            }
        ));
    }

    #[test]
    fn helper_functions_decode_multiword_values() {
        let conv = make("expr.evaluate(\"int32(R0, R1)\", 0)");
        assert_eq!(conv.to_mqtt(&[2, 1]).unwrap(), MqttValue::Int(131073));

        let conv = make("expr.evaluate(\"uint32(R0, R1)\", 0)");
        assert_eq!(
            conv.to_mqtt(&[0xffff, 0xffff]).unwrap(),
            MqttValue::Int(4294967295)
        );

        let conv = make("expr.evaluate(\"int16(R0)\", 0)");
        assert_eq!(conv.to_mqtt(&[0xffff]).unwrap(), MqttValue::Int(-1));

        let bits = 12.5f32.to_bits();
        let conv = make("expr.evaluate(\"flt32(R0, R1)\", 1)");
        assert_eq!(
            conv.to_mqtt(&[(bits >> 16) as u16, bits as u16]).unwrap(),
            MqttValue::float_with_precision(12.5, Some(1))
        );
    }

    #[test]
    fn write_scalar_maps_value_through_expression() {
        let conv = make("expr.evaluate(\"R0 * 10\")");
        assert_eq!(
            conv.to_modbus(&MqttValue::float(25.5), 1).unwrap(),
            vec![255]
        );
    }

    #[test]
    fn write_list_produces_multiple_registers() {
        let conv = make("expr.evaluate(\"R0 % 65536, R0 / 65536\")");
        let registers = conv.to_modbus(&MqttValue::Int(131073), 2).unwrap();
        assert_eq!(registers, vec![1, 2]);
    }

    #[test]
    fn write_as_helper_expands_to_two_registers() {
        let conv = make("expr.evaluate(\"R0\", write_as=\"int32\")");
        let registers = conv.to_modbus(&MqttValue::Int(131073), 2).unwrap();
        assert_eq!(registers, vec![2, 1]);

        let conv = make("expr.evaluate(\"R0\", write_as=\"int32\", low_first=true)");
        let registers = conv.to_modbus(&MqttValue::Int(131073), 2).unwrap();
        assert_eq!(registers, vec![1, 2]);
    }

    #[test]
    fn write_register_count_must_match() {
        let conv = make("expr.evaluate(\"R0\")");
        assert!(conv.to_modbus(&MqttValue::Int(1), 2).is_err());
        let conv = make("expr.evaluate(\"R0\", write_as=\"int32\")");
        assert!(conv.to_modbus(&MqttValue::Int(1), 1).is_err());
    }

    #[test]
    fn rejects_bad_expressions() {
        let registry = ConverterRegistry::with_builtins();
        assert!(registry.create("expr.evaluate(\"R0 +\")").is_err());
        assert!(registry.create("expr.evaluate(\"R15\")").is_err());
        assert!(registry.create("expr.evaluate(\"foo(R0)\")").is_err());
        assert!(registry.create("expr.evaluate(\"int32(R0)\")").is_err());
        assert!(registry.create("expr.evaluate").is_err());
    }

    #[test]
    fn expression_list_cannot_be_read() {
        let conv = make("expr.evaluate(\"R0, R1\")");
        assert!(conv.to_mqtt(&[1, 2]).is_err());
    }
}
