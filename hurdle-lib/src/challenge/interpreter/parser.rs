use super::InterpreterError;
use super::lexer::{BinaryOp, Spanned, Token};

/// Nesting limit for parenthesized, unary and assignment expressions and
/// call arguments. Operator and member chains are kept flat and do not
/// count against it.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Stmt {
    Declare {
        constant: bool,
        declarators: Vec<(String, Option<Expr>)>,
    },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Expr {
    Number(f64),
    Str(String),
    Var(String),
    Negate(Box<Expr>),
    ToNumber(Box<Expr>),
    /// Left-associative chain of operators of the same precedence
    Binary(Box<Expr>, Vec<(BinaryOp, Expr)>),
    Assign {
        target: String,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    /// Member accesses, calls and indexing applied left to right
    Access(Box<Expr>, Vec<Access>),
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Access {
    Member(String),
    Call { method: String, args: Vec<Expr> },
    Index(Expr),
}

pub(super) fn parse(tokens: Vec<Spanned>) -> Result<Vec<Stmt>, InterpreterError> {
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(token, _)| token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(token, _)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self) -> InterpreterError {
        match self.tokens.get(self.pos) {
            Some((token, pos)) => InterpreterError::Syntax {
                pos: *pos,
                message: format!("unexpected token {token:?}"),
            },
            None => InterpreterError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), InterpreterError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn ident(&mut self) -> Result<String, InterpreterError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn program(mut self) -> Result<Vec<Stmt>, InterpreterError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Semicolon) {}
            if self.peek().is_none() {
                return Ok(statements);
            }
            statements.push(self.statement()?);
            // statements end with `;`, or implicitly at the end of input
            if self.peek().is_some() && !self.eat(&Token::Semicolon) {
                return Err(self.unexpected());
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, InterpreterError> {
        if let Some(&Token::Declare(constant)) = self.peek() {
            self.pos += 1;
            let mut declarators = Vec::new();
            loop {
                let name = self.ident()?;
                let init = if self.eat(&Token::Assign) {
                    Some(self.expression()?)
                } else {
                    None
                };
                declarators.push((name, init));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            return Ok(Stmt::Declare {
                constant,
                declarators,
            });
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, InterpreterError> {
        if let (Some(Token::Ident(target)), Some(Token::Assign | Token::AssignOp(_))) =
            (self.peek(), self.peek_at(1))
        {
            let target = target.clone();
            self.pos += 1;
            let op = match self.next() {
                Some(Token::AssignOp(op)) => Some(op),
                _ => None,
            };
            let value = self.nested(Self::expression)?;
            return Ok(Expr::Assign {
                target,
                op,
                value: Box::new(value),
            });
        }
        self.additive()
    }

    fn additive(&mut self) -> Result<Expr, InterpreterError> {
        let first = self.multiplicative()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(chain(first, rest)),
            };
            self.pos += 1;
            rest.push((op, self.multiplicative()?));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, InterpreterError> {
        let first = self.unary()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(chain(first, rest)),
            };
            self.pos += 1;
            rest.push((op, self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, InterpreterError> {
        if self.eat(&Token::Minus) {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        if self.eat(&Token::Plus) {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::ToNumber(Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, InterpreterError> {
        let target = self.primary()?;
        let mut accesses = Vec::new();
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident()?;
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.nested(Self::expression)?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma)?;
                        }
                    }
                    accesses.push(Access::Call { method: name, args });
                } else {
                    accesses.push(Access::Member(name));
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.nested(Self::expression)?;
                self.expect(&Token::RBracket)?;
                accesses.push(Access::Index(index));
            } else if accesses.is_empty() {
                return Ok(target);
            } else {
                return Ok(Expr::Access(Box::new(target), accesses));
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, InterpreterError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let expr = self.nested(Self::expression)?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(_) => {
                self.pos -= 1;
                Err(self.unexpected())
            }
            None => Err(InterpreterError::UnexpectedEnd),
        }
    }

    fn nested(
        &mut self,
        rule: fn(&mut Self) -> Result<Expr, InterpreterError>,
    ) -> Result<Expr, InterpreterError> {
        if self.depth >= MAX_DEPTH {
            return Err(InterpreterError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = rule(self);
        self.depth -= 1;
        result
    }
}

fn chain(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    if rest.is_empty() {
        first
    } else {
        Expr::Binary(Box::new(first), rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::interpreter::lexer::tokenize;

    fn parse_str(source: &str) -> Result<Vec<Stmt>, InterpreterError> {
        parse(tokenize(source)?)
    }

    #[test]
    fn test_precedence() {
        let program = parse_str("1 + 2 * 3").unwrap();
        assert_eq!(
            program,
            vec![Stmt::Expr(Expr::Binary(
                Box::new(Expr::Number(1.0)),
                vec![(
                    BinaryOp::Add,
                    Expr::Binary(
                        Box::new(Expr::Number(2.0)),
                        vec![(BinaryOp::Mul, Expr::Number(3.0))],
                    ),
                )],
            ))]
        );
    }

    #[test]
    fn test_multi_declaration() {
        let program = parse_str("var s, t, a = 1;").unwrap();
        assert_eq!(
            program,
            vec![Stmt::Declare {
                constant: false,
                declarators: vec![
                    ("s".into(), None),
                    ("t".into(), None),
                    ("a".into(), Some(Expr::Number(1.0))),
                ],
            }]
        );
    }

    #[test]
    fn test_method_call_and_index() {
        let program = parse_str("t.charCodeAt(0) + t[1]").unwrap();
        let Stmt::Expr(Expr::Binary(lhs, rest)) = &program[0] else {
            panic!("expected a binary expression, got {program:?}");
        };
        assert!(matches!(
            &**lhs,
            Expr::Access(_, accesses) if matches!(accesses[..], [Access::Call { .. }])
        ));
        assert!(matches!(
            &rest[..],
            [(BinaryOp::Add, Expr::Access(_, accesses))] if matches!(accesses[..], [Access::Index(_)])
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let source = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse_str(&source), Err(InterpreterError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn test_long_chains_stay_flat() {
        let source = "1+".repeat(30_000) + "1";
        let program = parse_str(&source).unwrap();
        assert!(matches!(
            &program[0],
            Stmt::Expr(Expr::Binary(_, rest)) if rest.len() == 30_000
        ));

        let source = format!("t{}", "[0]".repeat(10_000));
        let program = parse_str(&source).unwrap();
        assert!(matches!(
            &program[0],
            Stmt::Expr(Expr::Access(_, accesses)) if accesses.len() == 10_000
        ));
    }

    #[test]
    fn test_missing_separator() {
        assert!(parse_str("a = 1 b = 2").is_err());
        assert_eq!(parse_str("a = (1"), Err(InterpreterError::UnexpectedEnd));
    }
}
