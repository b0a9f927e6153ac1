#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
}

impl Token {
    /// Whether a following `-` can start a negative number literal.
    fn allows_negative_literal(prev: Option<&Token>) -> bool {
        if let Some(Token::Ident(word)) = prev {
            return matches!(word.as_str(), "and" | "or" | "not" | "in");
        }
        !matches!(
            prev,
            Some(Token::Int(_))
                | Some(Token::Int(_))
                | Some(Token::Float(_))
                | Some(Token::Str(_))
                | Some(Token::RParen)
                | Some(Token::RBracket)
        )
    }
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '=' => return Err("assignment is not supported; use `==`".into()),
            '!' if next == Some('=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '"' | '\'' => {
                let (text, consumed) = lex_string(&chars[i..], c)?;
                tokens.push(Token::Str(text));
                i += consumed;
            }
            '-' if next.is_some_and(|n| n.is_ascii_digit())
                && Token::allows_negative_literal(tokens.last()) =>
            {
                let (token, consumed) = lex_number(&chars[i + 1..], true)?;
                tokens.push(token);
                i += 1 + consumed;
            }
            c if c.is_ascii_digit() => {
                let (token, consumed) = lex_number(&chars[i..], false)?;
                tokens.push(token);
                i += consumed;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '%' => {
                return Err(format!("arithmetic operator `{c}` is not supported"))
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

fn lex_number(chars: &[char], negative: bool) -> Result<(Token, usize), String> {
    let mut end = 0;
    while end < chars.len() && chars[end].is_ascii_digit() {
        end += 1;
    }
    let is_float = end + 1 < chars.len() && chars[end] == '.' && chars[end + 1].is_ascii_digit();
    if is_float {
        end += 1;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }
    }
    let mut text: String = chars[..end].iter().collect();
    if negative {
        text.insert(0, '-');
    }
    let token = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| format!("invalid number `{text}`"))?,
        )
    } else {
        Token::Int(
            text.parse()
                .map_err(|_| format!("integer `{text}` is out of range"))?,
        )
    };
    Ok((token, end))
}

fn lex_string(chars: &[char], quote: char) -> Result<(String, usize), String> {
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated string literal".into())
}
