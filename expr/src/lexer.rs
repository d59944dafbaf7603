//! Tokenizer for the hook predicate language.

use crate::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    /// A dotted path: `event.detail.missing`.
    Path(String),
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn err(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Parse {
        offset,
        message: message.into(),
    }
}

pub fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(err(i, "single '=' is not an operator; use '=='"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(err(i, "expected '!='"));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (value, next) = lex_string(source, i, c)?;
                tokens.push(Token::Str(value));
                i = next;
            }
            '0'..='9' => {
                let (value, next) = lex_number(source, i)?;
                tokens.push(Token::Number(value));
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (word, next) = lex_word(source, i);
                i = next;
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "in" => tokens.push(Token::In),
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Path(word)),
                }
            }
            other => return Err(err(i, format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

fn lex_string(source: &str, start: usize, quote: char) -> Result<(String, usize), ExprError> {
    let mut value = String::new();
    let mut chars = source[start + 1..].char_indices();
    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped @ ('"' | '\'' | '\\'))) => value.push(escaped),
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => {
                    return Err(err(start + 1 + offset, format!("bad escape '\\{other}'")));
                }
                None => return Err(err(start + 1 + offset, "unterminated escape")),
            },
            c if c == quote => return Ok((value, start + 1 + offset + c.len_utf8())),
            c => value.push(c),
        }
    }
    Err(err(start, "unterminated string literal"))
}

fn lex_number(source: &str, start: usize) -> Result<(f64, usize), ExprError> {
    let bytes = source.as_bytes();
    let mut end = start;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            // A dot is part of the number only when a digit follows;
            // otherwise it would swallow path separators.
            b'.' if !seen_dot && matches!(bytes.get(end + 1), Some(&(b'0'..=b'9'))) => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    source[start..end]
        .parse::<f64>()
        .map(|n| (n, end))
        .map_err(|e| err(start, format!("bad number: {e}")))
}

fn lex_word(source: &str, start: usize) -> (String, usize) {
    let bytes = source.as_bytes();
    let mut end = start;
    while end < bytes.len() {
        match bytes[end] {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => end += 1,
            // Dots join path segments only when another segment follows.
            b'.' if matches!(
                bytes.get(end + 1),
                Some(&(b'a'..=b'z' | b'A'..=b'Z' | b'_'))
            ) =>
            {
                end += 1;
            }
            _ => break,
        }
    }
    (source[start..end].to_string(), end)
}

#[cfg(test)]
mod tests {
    use super::{Token, lex};

    #[test]
    fn lexes_paths_keywords_and_operators() {
        let tokens = lex("event.code == \"x\" and not cost.turns >= 3").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Path("event.code".to_string()),
                Token::Eq,
                Token::Str("x".to_string()),
                Token::And,
                Token::Not,
                Token::Path("cost.turns".to_string()),
                Token::Ge,
                Token::Number(3.0),
            ]
        );
    }

    #[test]
    fn lexes_floats_without_eating_paths() {
        let tokens = lex("1.5 + a.b").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Number(1.5),
                Token::Plus,
                Token::Path("a.b".to_string()),
            ]
        );
    }

    #[test]
    fn single_quotes_and_escapes() {
        let tokens = lex(r"'it\'s'").unwrap();
        assert_eq!(tokens, vec![Token::Str("it's".to_string())]);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(lex("\"open").is_err());
    }

    #[test]
    fn rejects_single_equals() {
        assert!(lex("a = 1").is_err());
    }
}
