use serde_json::Value;

use super::lexer::Token;
use super::{CmpOp, Expr, Segment};

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Parse a complete expression; trailing tokens are an error.
    pub(crate) fn parse(mut self) -> Result<Expr, String> {
        if self.tokens.is_empty() {
            return Err("empty expression".into());
        }
        let expr = self.parse_or()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {} after expression", describe(token))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(ref token) if *token == expected => Ok(()),
            Some(token) => Err(format!(
                "expected {}, found {}",
                describe(&expected),
                describe(&token)
            )),
            None => Err(format!("expected {}, found end of input", describe(&expected))),
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.at_keyword("or") || self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.at_keyword("and") || self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.at_keyword("not") || self.peek() == Some(&Token::Bang) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        let (op, width) = match self.peek() {
            Some(Token::EqEq) => (CmpOp::Eq, 1),
            Some(Token::NotEq) => (CmpOp::Ne, 1),
            Some(Token::Lt) => (CmpOp::Lt, 1),
            Some(Token::Le) => (CmpOp::Le, 1),
            Some(Token::Gt) => (CmpOp::Gt, 1),
            Some(Token::Ge) => (CmpOp::Ge, 1),
            Some(Token::Ident(name)) if name == "in" => (CmpOp::In, 1),
            Some(Token::Ident(name))
                if name == "not"
                    && matches!(self.peek_at(1), Some(Token::Ident(next)) if next == "in") =>
            {
                (CmpOp::NotIn, 2)
            }
            _ => return Ok(left),
        };
        for _ in 0..width {
            self.advance();
        }
        let right = self.parse_primary()?;
        if matches!(
            self.peek(),
            Some(Token::EqEq | Token::NotEq | Token::Lt | Token::Le | Token::Gt | Token::Ge)
        ) {
            return Err("chained comparisons are not supported; combine them with `and`".into());
        }
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let token = self
            .advance()
            .ok_or_else(|| "unexpected end of input".to_string())?;
        match token {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => serde_json::Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| format!("invalid number {f}")),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => self.parse_list(),
            Token::Ident(name) => self.parse_ident(name),
            other => Err(format!("unexpected {}", describe(&other))),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, String> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.advance();
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.parse_or()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                Some(other) => return Err(format!("expected `,` or `]`, found {}", describe(&other))),
                None => return Err("unterminated list literal".into()),
            }
        }
        Ok(Expr::List(items))
    }

    fn parse_ident(&mut self, name: String) -> Result<Expr, String> {
        match name.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            "and" | "or" | "in" | "not" => {
                return Err(format!("unexpected keyword `{name}`"));
            }
            _ => {}
        }

        if self.peek() == Some(&Token::LParen) {
            if name != "len" {
                return Err(format!("unsupported function `{name}`; only `len` is available"));
            }
            self.advance();
            let arg = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::Len(Box::new(arg)));
        }

        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(field)) => segments.push(Segment::Field(field)),
                        Some(other) => {
                            return Err(format!("expected field name after `.`, found {}", describe(&other)))
                        }
                        None => return Err("expected field name after `.`".into()),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let segment = match self.advance() {
                        Some(Token::Int(i)) => Segment::Index(i),
                        Some(Token::Str(key)) => Segment::Field(key),
                        Some(other) => {
                            return Err(format!(
                                "index must be an integer or string literal, found {}",
                                describe(&other)
                            ))
                        }
                        None => return Err("unterminated index".into()),
                    };
                    self.expect(Token::RBracket)?;
                    segments.push(segment);
                }
                _ => break,
            }
        }
        Ok(Expr::Path { root: name, segments })
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("`{name}`"),
        Token::Int(n) => format!("`{n}`"),
        Token::Float(f) => format!("`{f}`"),
        Token::Str(s) => format!("string \"{s}\""),
        Token::LParen => "`(`".into(),
        Token::RParen => "`)`".into(),
        Token::LBracket => "`[`".into(),
        Token::RBracket => "`]`".into(),
        Token::Comma => "`,`".into(),
        Token::Dot => "`.`".into(),
        Token::EqEq => "`==`".into(),
        Token::NotEq => "`!=`".into(),
        Token::Lt => "`<`".into(),
        Token::Le => "`<=`".into(),
        Token::Gt => "`>`".into(),
        Token::Ge => "`>=`".into(),
        Token::AndAnd => "`&&`".into(),
        Token::OrOr => "`||`".into(),
        Token::Bang => "`!`".into(),
    }
}
