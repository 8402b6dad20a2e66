use crate::{
    eval::LangError,
    value::Value,
};

/// Read exactly one expression from source text.
pub fn parse_one(source: &str) -> Result<Value, LangError> {
    let mut tokens = tokenize(source)?;
    tokens.reverse();
    let value = parse_value(&mut tokens)?;
    if let Some(extra) = tokens.last() {
        return Err(LangError::Parse(format!(
            "unexpected trailing input starting at `{extra}`"
        )));
    }
    Ok(value)
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Quote,
    Str(String),
    Chunk(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
            Token::Quote => write!(f, "'"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Chunk(s) => write!(f, "{s}"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, LangError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {},
            ';' => {
                // Comment to end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            },
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '\'' => tokens.push(Token::Quote),
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(LangError::Parse("unterminated string".to_string())),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('n') => s.push('\n'),
                            other => {
                                return Err(LangError::Parse(format!(
                                    "invalid string escape {other:?}"
                                )))
                            },
                        },
                        Some(c) => s.push(c),
                    }
                }
                tokens.push(Token::Str(s));
            },
            c => {
                let mut chunk = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | '\'' | '"' | ';') {
                        break;
                    }
                    chunk.push(next);
                    chars.next();
                }
                tokens.push(Token::Chunk(chunk));
            },
        }
    }
    if tokens.is_empty() {
        return Err(LangError::Parse("empty input".to_string()));
    }
    Ok(tokens)
}

/// Tokens arrive reversed so the next token pops off the back.
fn parse_value(tokens: &mut Vec<Token>) -> Result<Value, LangError> {
    match tokens.pop() {
        None => Err(LangError::Parse("unexpected end of input".to_string())),
        Some(Token::Close) => Err(LangError::Parse("unbalanced `)`".to_string())),
        Some(Token::Str(s)) => Ok(Value::Str(s)),
        Some(Token::Quote) => {
            let quoted = parse_value(tokens)?;
            Ok(Value::List(vec![Value::atom("quote"), quoted]))
        },
        Some(Token::Open) => {
            let mut items = Vec::new();
            loop {
                if tokens.last() == Some(&Token::Close) {
                    tokens.pop();
                    return Ok(Value::List(items));
                }
                items.push(parse_value(tokens)?);
            }
        },
        Some(Token::Chunk(chunk)) => Ok(read_chunk(&chunk)),
    }
}

fn read_chunk(chunk: &str) -> Value {
    if let Ok(i) = chunk.parse::<i64>() {
        return Value::Int(i);
    }
    match chunk {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Atom(chunk.to_string()),
    }
}
