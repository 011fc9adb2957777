//! Recursive-descent parser producing the condition AST.

use super::lexer::{Spanned, Token, tokenize};
use super::value::Value;
use super::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

pub fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: src.len(),
    };
    let expr = parser.or_expr()?;
    if let Some(t) = parser.peek() {
        return Err(Error::Parse {
            offset: t.offset,
            message: format!("unexpected trailing token {:?}", t.token),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek().map(|s| &s.token) == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {expected:?}")))
        }
    }

    fn unexpected(&self, message: &str) -> Error {
        let offset = self.peek().map_or(self.end, |s| s.offset);
        Error::Parse {
            offset,
            message: message.to_string(),
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::BangEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnOp::Not, Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnOp::Neg, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        while self.eat(&Token::Dot) {
            match self.advance() {
                Some(Spanned {
                    token: Token::Ident(field),
                    ..
                }) => {
                    expr = Expr::Member(Box::new(expr), field);
                }
                _ => return Err(self.unexpected("expected field name after '.'")),
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Spanned {
                token: Token::Number(n),
                ..
            }) => Ok(Expr::Literal(Value::Number(n))),
            Some(Spanned {
                token: Token::Str(s), ..
            }) => Ok(Expr::Literal(Value::Text(s))),
            Some(Spanned {
                token: Token::True, ..
            }) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Spanned {
                token: Token::False, ..
            }) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Spanned {
                token: Token::Ident(name),
                ..
            }) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(Token::RParen)?;
                            break;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Spanned {
                token: Token::LParen,
                ..
            }) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(other) => Err(Error::Parse {
                offset: other.offset,
                message: format!("unexpected token {:?}", other.token),
            }),
            None => Err(Error::Parse {
                offset: self.end,
                message: "unexpected end of condition".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_precedence() {
        // a || b && c  =>  a || (b && c)
        let expr = parse("a || b && c").unwrap();
        match expr {
            Expr::Binary(BinOp::Or, _, rhs) => {
                assert!(matches!(*rhs, Expr::Binary(BinOp::And, _, _)));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parses_arithmetic_into_comparison() {
        // valueNumber * 2 > 10 + 1
        let expr = parse("valueNumber * 2 > 10 + 1").unwrap();
        match expr {
            Expr::Binary(BinOp::Gt, lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Binary(BinOp::Mul, _, _)));
                assert!(matches!(*rhs, Expr::Binary(BinOp::Add, _, _)));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parses_call_with_member_args() {
        let expr = parse("geoDistance(value.Latitude, value.Longitude, 0, 0)").unwrap();
        match expr {
            Expr::Call(name, args) => {
                assert_eq!(name, "geoDistance");
                assert_eq!(args.len(), 4);
                assert!(matches!(&args[0], Expr::Member(_, f) if f == "Latitude"));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parses_nested_parens_and_not() {
        let expr = parse("!(a && (b || !c))").unwrap();
        assert!(matches!(expr, Expr::Unary(UnOp::Not, _)));
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(matches!(parse("a > 1 b"), Err(Error::Parse { .. })));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(parse(""), Err(Error::Parse { .. })));
    }

    #[test]
    fn rejects_dangling_operator() {
        assert!(matches!(parse("a >"), Err(Error::Parse { .. })));
    }
}
