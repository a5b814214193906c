use super::InterpreterError;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    /// `var`, `let` or `const`; the flag is set for `const`
    Declare(bool),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    /// Compound assignment such as `+=`, holding the arithmetic operator
    AssignOp(BinaryOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Semicolon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    const fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Add),
            '-' => Some(Self::Sub),
            '*' => Some(Self::Mul),
            '/' => Some(Self::Div),
            '%' => Some(Self::Rem),
            _ => None,
        }
    }
}

/// A token with its byte offset in the source
pub(super) type Spanned = (Token, usize);

pub(super) fn tokenize(source: &str) -> Result<Vec<Spanned>, InterpreterError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' if c != '.' || next_is_digit(source, pos) => {
                let end = number_end(source, pos);
                let literal = &source[pos..end];
                let value = parse_number(literal).ok_or_else(|| InterpreterError::Syntax {
                    pos,
                    message: format!("invalid number `{literal}`"),
                })?;
                tokens.push((Token::Number(value), pos));
                while chars.peek().is_some_and(|&(i, _)| i < end) {
                    chars.next();
                }
            }
            '\'' | '"' => {
                chars.next();
                tokens.push((Token::Str(string_literal(&mut chars, c, pos)?), pos));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match ident.as_str() {
                    "var" | "let" => Token::Declare(false),
                    "const" => Token::Declare(true),
                    _ => Token::Ident(ident),
                };
                tokens.push((token, pos));
            }
            '+' | '-' | '*' | '/' | '%' => {
                chars.next();
                let op = BinaryOp::from_char(c).ok_or(InterpreterError::Syntax {
                    pos,
                    message: format!("unexpected `{c}`"),
                })?;
                if chars.peek().is_some_and(|&(_, next)| next == '=') {
                    chars.next();
                    tokens.push((Token::AssignOp(op), pos));
                } else {
                    tokens.push((operator_token(op), pos));
                }
            }
            _ => {
                chars.next();
                let token = match c {
                    '=' => Token::Assign,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    '.' => Token::Dot,
                    ';' => Token::Semicolon,
                    other => {
                        return Err(InterpreterError::Syntax {
                            pos,
                            message: format!("unsupported character `{other}`"),
                        });
                    }
                };
                tokens.push((token, pos));
            }
        }
    }
    Ok(tokens)
}

const fn operator_token(op: BinaryOp) -> Token {
    match op {
        BinaryOp::Add => Token::Plus,
        BinaryOp::Sub => Token::Minus,
        BinaryOp::Mul => Token::Star,
        BinaryOp::Div => Token::Slash,
        BinaryOp::Rem => Token::Percent,
    }
}

fn next_is_digit(source: &str, pos: usize) -> bool {
    source[pos + 1..]
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit())
}

fn number_end(source: &str, start: usize) -> usize {
    let rest = &source[start..];
    if rest.starts_with("0x") || rest.starts_with("0X") {
        let digits = rest[2..]
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(rest.len() - 2);
        return start + 2 + digits;
    }
    let mut end = start;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = source.as_bytes();
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if !seen_exp => {
                seen_exp = true;
                if matches!(bytes.get(end + 1), Some(b'+' | b'-')) {
                    end += 1;
                }
            }
            _ => break,
        }
        end += 1;
    }
    end
}

fn parse_number(literal: &str) -> Option<f64> {
    if let Some(hex) = literal
        .strip_prefix("0x")
        .or_else(|| literal.strip_prefix("0X"))
    {
        #[allow(clippy::cast_precision_loss)]
        let value = u64::from_str_radix(hex, 16).ok().map(|n| n as f64);
        return value;
    }
    literal.parse().ok()
}

fn string_literal(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
    start: usize,
) -> Result<String, InterpreterError> {
    let mut value = String::new();
    while let Some((pos, c)) = chars.next() {
        match c {
            c if c == quote => return Ok(value),
            '\\' => {
                let (_, escaped) = chars.next().ok_or(InterpreterError::UnexpectedEnd)?;
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    'x' => value.push(hex_escape(chars, 2, pos)?),
                    'u' => value.push(hex_escape(chars, 4, pos)?),
                    other => value.push(other),
                }
            }
            '\n' => break,
            c => value.push(c),
        }
    }
    Err(InterpreterError::Syntax {
        pos: start,
        message: "unterminated string literal".to_string(),
    })
}

fn hex_escape(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    len: usize,
    pos: usize,
) -> Result<char, InterpreterError> {
    let digits: String = chars.by_ref().take(len).map(|(_, c)| c).collect();
    u32::from_str_radix(&digits, 16)
        .ok()
        .filter(|_| digits.len() == len)
        .and_then(char::from_u32)
        .ok_or(InterpreterError::Syntax {
            pos,
            message: format!("invalid escape sequence `{digits}`"),
        })
}
