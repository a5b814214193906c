use std::collections::HashMap;

use super::InterpreterError;
use super::lexer::BinaryOp;
use super::parser::{Access, Expr, Stmt};

/// A value of the restricted language
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Declared but never assigned
    Undefined,
    /// IEEE 754 double, as every JS number
    Number(f64),
    /// Immutable string
    Str(String),
}

impl Value {
    /// JS `ToNumber`
    #[must_use]
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Number(n) => *n,
            Self::Str(s) => string_to_number(s),
        }
    }

    /// JS `ToString`
    #[must_use]
    pub fn to_js_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Number(n) => format_number(*n),
            Self::Str(s) => s.clone(),
        }
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        #[allow(clippy::cast_precision_loss)]
        let value = u64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
        return value;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    // Rust also accepts `inf` and `NaN`, JS does not
    if trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        trimmed.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

/// Format a number the way JS `ToString` prints it
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if n == 0.0 {
        "0".to_string()
    } else if n.abs() >= 1e21 || n.abs() < 1e-6 {
        let formatted = format!("{n:e}");
        match formatted.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{mantissa}e+{exponent}")
            }
            _ => formatted,
        }
    } else {
        format!("{n}")
    }
}

#[derive(Debug)]
struct Binding {
    value: Value,
    constant: bool,
}

/// Tree-walking evaluator over one scope
#[derive(Debug, Default)]
pub(super) struct Scope {
    bindings: HashMap<String, Binding>,
}

impl Scope {
    pub(super) fn define(&mut self, name: &str, value: Value) {
        self.bindings.insert(
            name.to_string(),
            Binding {
                value,
                constant: false,
            },
        );
    }

    /// Run `program`, returning the value of its last statement
    pub(super) fn run(&mut self, program: &[Stmt]) -> Result<Value, InterpreterError> {
        let mut last = Value::Undefined;
        for statement in program {
            last = self.statement(statement)?;
        }
        Ok(last)
    }

    fn statement(&mut self, statement: &Stmt) -> Result<Value, InterpreterError> {
        match statement {
            Stmt::Expr(expr) => self.expr(expr),
            Stmt::Declare {
                constant,
                declarators,
            } => {
                let mut last = Value::Undefined;
                for (name, init) in declarators {
                    if let Some(existing) = self.bindings.get(name)
                        && existing.constant
                    {
                        return Err(InterpreterError::AssignToConst(name.clone()));
                    }
                    match init {
                        Some(init) => {
                            let value = self.expr(init)?;
                            self.bindings.insert(
                                name.clone(),
                                Binding {
                                    value: value.clone(),
                                    constant: *constant,
                                },
                            );
                            last = value;
                        }
                        // `var x;` keeps the value of an existing `x`
                        None => {
                            self.bindings.entry(name.clone()).or_insert(Binding {
                                value: Value::Undefined,
                                constant: *constant,
                            });
                        }
                    }
                }
                Ok(last)
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<&Value, InterpreterError> {
        self.bindings
            .get(name)
            .map(|binding| &binding.value)
            .ok_or_else(|| InterpreterError::UndefinedVariable(name.to_string()))
    }

    fn expr(&mut self, expr: &Expr) -> Result<Value, InterpreterError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(name) => self.lookup(name).cloned(),
            Expr::Negate(operand) => Ok(Value::Number(-self.expr(operand)?.to_number())),
            Expr::ToNumber(operand) => Ok(Value::Number(self.expr(operand)?.to_number())),
            Expr::Binary(first, rest) => {
                let mut acc = self.expr(first)?;
                for (op, rhs) in rest {
                    let rhs = self.expr(rhs)?;
                    acc = binary(*op, &acc, &rhs);
                }
                Ok(acc)
            }
            Expr::Assign { target, op, value } => {
                let value = self.expr(value)?;
                let value = match op {
                    Some(op) => binary(*op, self.lookup(target)?, &value),
                    None => value,
                };
                match self.bindings.get_mut(target) {
                    Some(binding) if binding.constant => {
                        Err(InterpreterError::AssignToConst(target.clone()))
                    }
                    Some(binding) => {
                        binding.value = value.clone();
                        Ok(value)
                    }
                    None => {
                        self.define(target, value.clone());
                        Ok(value)
                    }
                }
            }
            Expr::Access(target, accesses) => {
                let mut value = self.expr(target)?;
                for access in accesses {
                    value = self.access(value, access)?;
                }
                Ok(value)
            }
        }
    }

    fn access(&mut self, target: Value, access: &Access) -> Result<Value, InterpreterError> {
        match access {
            Access::Member(name) => match (&target, name.as_str()) {
                (Value::Str(s), "length") => Ok(Value::Number(utf16_len(s))),
                _ => Err(InterpreterError::UnsupportedMember(name.clone())),
            },
            Access::Index(index) => {
                let index = self.expr(index)?.to_number();
                match target {
                    Value::Str(s) => Ok(utf16_at(&s, index)
                        .map_or(Value::Undefined, |unit| {
                            Value::Str(String::from_utf16_lossy(&[unit]))
                        })),
                    _ => Err(InterpreterError::UnsupportedMember("[]".to_string())),
                }
            }
            Access::Call { method, args } => {
                let index = match args.first() {
                    Some(arg) => self.expr(arg)?.to_number(),
                    None => 0.0,
                };
                let index = if index.is_nan() { 0.0 } else { index };
                match (&target, method.as_str()) {
                    (Value::Str(s), "charAt") => Ok(Value::Str(
                        utf16_at(s, index)
                            .map(|unit| String::from_utf16_lossy(&[unit]))
                            .unwrap_or_default(),
                    )),
                    (Value::Str(s), "charCodeAt") => Ok(Value::Number(
                        utf16_at(s, index).map_or(f64::NAN, f64::from),
                    )),
                    _ => Err(InterpreterError::UnsupportedMember(format!("{method}()"))),
                }
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    if op == BinaryOp::Add && (matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_))) {
        return Value::Str(lhs.to_js_string() + &rhs.to_js_string());
    }
    let (a, b) = (lhs.to_number(), rhs.to_number());
    Value::Number(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
    })
}

#[allow(clippy::cast_precision_loss)]
fn utf16_len(s: &str) -> f64 {
    s.encode_utf16().count() as f64
}

fn utf16_at(s: &str, index: f64) -> Option<u16> {
    if index < 0.0 || index.fract() != 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = index as usize;
    s.encode_utf16().nth(index)
}
