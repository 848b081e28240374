// Guard Expression Parser
// Recursive descent parser producing an AST for guard expressions

use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Abstract syntax tree of a guard expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Top-level variable: params, context, tasks
    Ident(String),

    /// Function or method call; a method receiver becomes the first argument
    Call { name: String, args: Vec<Expr> },

    /// Index access: list[0], map['key']
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Member access: params.env
    Member { object: Box<Expr>, property: String },

    Unary { op: UnaryOp, expr: Box<Expr> },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    /// List literal: ['a', 'b']
    List(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

/// Parser error
#[derive(Debug, Clone)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at token {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse an expression from source text
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        let expr = self.parse_ternary()?;
        if self.peek() != &Token::Eof {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }
        Ok(expr)
    }

    // Precedence (lowest to highest):
    // ternary, ||, &&, relations (== != < <= > >= in),
    // additive, multiplicative, unary, postfix

    fn parse_ternary(&mut self) -> Result<Expr, ParseExprError> {
        let condition = self.parse_or()?;

        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then_expr = self.parse_ternary()?;
        self.expect(&Token::Colon, "expected ':' in ternary expression")?;
        let else_expr = self.parse_ternary()?;

        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_relation()?;
        while self.eat(&Token::And) {
            let right = self.parse_relation()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_relation(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_additive()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::In => BinaryOp::In,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.eat(&Token::Dot) {
                let Token::Identifier(property) = self.advance().clone() else {
                    return Err(self.error("expected property name after '.'"));
                };
                expr = if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    Expr::Call {
                        name: property,
                        args: std::iter::once(expr).chain(args).collect(),
                    }
                } else {
                    Expr::Member {
                        object: Box::new(expr),
                        property,
                    }
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_ternary()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        let token = self.advance().clone();
        match token {
            Token::Null => Ok(Expr::Null),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::String(s) => Ok(Expr::String(s)),
            Token::Identifier(name) => {
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                let expr = self.parse_ternary()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                let items = self.parse_list(&Token::RBracket, "expected ']'")?;
                Ok(Expr::List(items))
            }
            token => Err(self.error(&format!("unexpected token: {}", token))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&Token::LParen, "expected '('")?;
        self.parse_list(&Token::RParen, "expected ')'")
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed
    fn parse_list(&mut self, close: &Token, msg: &str) -> Result<Vec<Expr>, ParseExprError> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.parse_ternary()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close, msg)?;
        Ok(items)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Expr {
        ExprParser::parse_str(input).unwrap()
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("null"), Expr::Null);
        assert_eq!(parse("true"), Expr::Bool(true));
        assert_eq!(parse("7"), Expr::Number(7.0));
        assert_eq!(parse("'x'"), Expr::String("x".to_string()));
    }

    #[test]
    fn test_parse_member_chain() {
        assert_eq!(
            parse("params.env"),
            Expr::Member {
                object: Box::new(Expr::Ident("params".to_string())),
                property: "env".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_method_call_moves_receiver() {
        let Expr::Call { name, args } = parse("params.branch.startsWith('release/')") else {
            panic!("expected call");
        };
        assert_eq!(name, "startsWith");
        assert_eq!(args.len(), 2);
        assert!(matches!(args[0], Expr::Member { .. }));
    }

    #[test]
    fn test_parse_in_operator() {
        let expr = parse("'prod' in ['prod', 'staging']");
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::In);
        assert!(matches!(*right, Expr::List(ref items) if items.len() == 2));
    }

    #[test]
    fn test_parse_precedence() {
        // a || b && c parses as a || (b && c)
        let Expr::Binary { op, right, .. } = parse("a || b && c") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));

        // relation binds tighter than &&
        let Expr::Binary { op, left, .. } = parse("x == 1 && y != 2") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::And);
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn test_parse_ternary_and_index() {
        assert!(matches!(parse("a ? b[0] : c"), Expr::Ternary { .. }));
        assert!(matches!(parse("m['k']"), Expr::Index { .. }));
    }

    #[test]
    fn test_parse_trailing_comma() {
        assert_eq!(parse("[1, 2,]"), Expr::List(vec![Expr::Number(1.0), Expr::Number(2.0)]));
        assert_eq!(parse("[]"), Expr::List(vec![]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExprParser::parse_str("a ==").is_err());
        assert!(ExprParser::parse_str("(a").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
        assert!(ExprParser::parse_str("a.").is_err());
    }
}
