// Guard Expression Lexer
// Tokenizes CEL-style boolean guard expressions

use std::fmt;

/// Token types for guard expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    Percent,  // %
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
    And,      // &&
    Or,       // ||
    Not,      // !
    In,       // in
    Dot,      // .
    Comma,    // ,
    Colon,    // :
    Question, // ?

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::In => write!(f, "in"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Question => write!(f, "?"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lex error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for LexError {}

impl LexError {
    fn at(position: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input, ending with `Token::Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };
        self.position = pos;

        let single = match ch {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '?' => Some(Token::Question),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '=' => self.pair('=', Token::Eq, None, "expected '==' operator"),
            '!' => self.pair('=', Token::Ne, Some(Token::Not), ""),
            '<' => self.pair('=', Token::Le, Some(Token::Lt), ""),
            '>' => self.pair('=', Token::Ge, Some(Token::Gt), ""),
            '&' => self.pair('&', Token::And, None, "expected '&&' operator"),
            '|' => self.pair('|', Token::Or, None, "expected '||' operator"),
            '\'' | '"' => self.read_string(ch),
            '0'..='9' => self.read_number(),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),
            _ => Err(LexError::at(pos, format!("unexpected character: '{}'", ch))),
        }
    }

    /// Consume a one- or two-character operator
    fn pair(
        &mut self,
        second: char,
        double: Token,
        single: Option<Token>,
        message: &str,
    ) -> Result<Token, LexError> {
        let pos = self.position;
        self.advance();
        if self.peek_char() == Some(second) {
            self.advance();
            return Ok(double);
        }
        single.ok_or_else(|| LexError::at(pos, message))
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, c)) if c == quote => return Ok(Token::String(value)),
                Some((pos, '\\')) => {
                    let escaped = match self.advance() {
                        Some((_, 'n')) => '\n',
                        Some((_, 't')) => '\t',
                        Some((_, 'r')) => '\r',
                        Some((_, c @ ('\\' | '\'' | '"'))) => c,
                        Some((_, c)) => {
                            return Err(LexError::at(pos, format!("unknown escape '\\{}'", c)))
                        }
                        None => return Err(LexError::at(start, "unterminated string")),
                    };
                    value.push(escaped);
                }
                Some((_, c)) => value.push(c),
                None => return Err(LexError::at(start, "unterminated string")),
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut text = String::new();

        while let Some(c) = self.peek_char().filter(|c| c.is_ascii_digit()) {
            text.push(c);
            self.advance();
        }

        // A '.' only continues the number when a digit follows it
        if self.peek_char() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some(&(_, d)) if d.is_ascii_digit()) {
                text.push('.');
                self.advance();
                while let Some(c) = self.peek_char().filter(|c| c.is_ascii_digit()) {
                    text.push(c);
                    self.advance();
                }
            }
        }

        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError::at(start, format!("invalid number: {}", text)))
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(c) = self.peek_char().filter(|c| c.is_alphanumeric() || *c == '_') {
            ident.push(c);
            self.advance();
        }

        match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            "in" => Token::In,
            _ => Token::Identifier(ident),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_lexer_operators() {
        assert_eq!(
            lex("== != < <= > >= && || !"),
            vec![
                Token::Eq,
                Token::Ne,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::And,
                Token::Or,
                Token::Not,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_both_quote_styles() {
        assert_eq!(
            lex(r#"'prod' "it's""#),
            vec![
                Token::String("prod".to_string()),
                Token::String("it's".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_escapes() {
        assert_eq!(
            lex(r"'a\'b\n'"),
            vec![Token::String("a'b\n".to_string()), Token::Eof]
        );
        assert!(Lexer::new(r"'\q'").tokenize().is_err());
    }

    #[test]
    fn test_lexer_numbers() {
        assert_eq!(
            lex("42 2.5"),
            vec![Token::Number(42.0), Token::Number(2.5), Token::Eof]
        );
    }

    #[test]
    fn test_lexer_keywords_are_case_sensitive() {
        assert_eq!(
            lex("true in True"),
            vec![
                Token::True,
                Token::In,
                Token::Identifier("True".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_method_call() {
        assert_eq!(
            lex("branch.startsWith('rel')"),
            vec![
                Token::Identifier("branch".to_string()),
                Token::Dot,
                Token::Identifier("startsWith".to_string()),
                Token::LParen,
                Token::String("rel".to_string()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_errors() {
        let err = Lexer::new("a = b").tokenize().unwrap_err();
        assert_eq!(err.position, 2);
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a # b").tokenize().is_err());
    }
}
