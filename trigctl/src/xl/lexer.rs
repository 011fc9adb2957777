//! Tokenizer for condition source text.

use super::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    LParen,
    RParen,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    BangEq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A token with the byte offset it started at, for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => push_simple(&mut tokens, &mut chars, offset, Token::LParen),
            ')' => push_simple(&mut tokens, &mut chars, offset, Token::RParen),
            ',' => push_simple(&mut tokens, &mut chars, offset, Token::Comma),
            '.' => push_simple(&mut tokens, &mut chars, offset, Token::Dot),
            '+' => push_simple(&mut tokens, &mut chars, offset, Token::Plus),
            '-' => push_simple(&mut tokens, &mut chars, offset, Token::Minus),
            '*' => push_simple(&mut tokens, &mut chars, offset, Token::Star),
            '/' => push_simple(&mut tokens, &mut chars, offset, Token::Slash),
            '%' => push_simple(&mut tokens, &mut chars, offset, Token::Percent),
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Spanned { token: Token::BangEq, offset });
                } else {
                    tokens.push(Spanned { token: Token::Bang, offset });
                }
            }
            '=' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Spanned { token: Token::EqEq, offset });
                } else {
                    return Err(Error::Parse {
                        offset,
                        message: "expected '==' (assignment is not supported)".to_string(),
                    });
                }
            }
            '<' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Spanned { token: Token::Le, offset });
                } else {
                    tokens.push(Spanned { token: Token::Lt, offset });
                }
            }
            '>' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Spanned { token: Token::Ge, offset });
                } else {
                    tokens.push(Spanned { token: Token::Gt, offset });
                }
            }
            '&' => {
                chars.next();
                match chars.peek() {
                    Some((_, '&')) => {
                        chars.next();
                        tokens.push(Spanned { token: Token::AndAnd, offset });
                    }
                    _ => {
                        return Err(Error::Parse {
                            offset,
                            message: "expected '&&'".to_string(),
                        });
                    }
                }
            }
            '|' => {
                chars.next();
                match chars.peek() {
                    Some((_, '|')) => {
                        chars.next();
                        tokens.push(Spanned { token: Token::OrOr, offset });
                    }
                    _ => {
                        return Err(Error::Parse {
                            offset,
                            message: "expected '||'".to_string(),
                        });
                    }
                }
            }
            '\'' | '"' => {
                tokens.push(lex_string(&mut chars, offset, c)?);
            }
            c if c.is_ascii_digit() => {
                tokens.push(lex_number(src, &mut chars, offset)?);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = offset;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &src[offset..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, offset });
            }
            other => {
                return Err(Error::Parse {
                    offset,
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }

    Ok(tokens)
}

fn push_simple(
    tokens: &mut Vec<Spanned>,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    offset: usize,
    token: Token,
) {
    chars.next();
    tokens.push(Spanned { token, offset });
}

fn lex_number(
    src: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    offset: usize,
) -> Result<Spanned> {
    let mut end = offset;
    let mut seen_dot = false;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() {
            end = i + 1;
            chars.next();
        } else if c == '.' && !seen_dot {
            // Only consume the dot when a digit follows, so `value.Latitude`
            // style member access still lexes after a bare integer.
            let mut lookahead = chars.clone();
            lookahead.next();
            match lookahead.peek() {
                Some((_, d)) if d.is_ascii_digit() => {
                    seen_dot = true;
                    end = i + 1;
                    chars.next();
                }
                _ => break,
            }
        } else {
            break;
        }
    }
    let text = &src[offset..end];
    let number = text.parse::<f64>().map_err(|e| Error::Parse {
        offset,
        message: format!("invalid number {text:?}: {e}"),
    })?;
    Ok(Spanned {
        token: Token::Number(number),
        offset,
    })
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    offset: usize,
    quote: char,
) -> Result<Spanned> {
    chars.next(); // opening quote
    let mut out = String::new();
    loop {
        match chars.next() {
            Some((_, c)) if c == quote => break,
            Some((i, '\\')) => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, c)) if c == quote => out.push(c),
                Some((_, other)) => {
                    return Err(Error::Parse {
                        offset: i,
                        message: format!("unsupported escape \\{other}"),
                    });
                }
                None => {
                    return Err(Error::Parse {
                        offset: i,
                        message: "unterminated string literal".to_string(),
                    });
                }
            },
            Some((_, c)) => out.push(c),
            None => {
                return Err(Error::Parse {
                    offset,
                    message: "unterminated string literal".to_string(),
                });
            }
        }
    }
    Ok(Spanned {
        token: Token::Str(out),
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn lexes_comparison() {
        assert_eq!(
            kinds("valueNumber > 55"),
            vec![
                Token::Ident("valueNumber".into()),
                Token::Gt,
                Token::Number(55.0)
            ]
        );
    }

    #[test]
    fn lexes_member_access_after_integer_context() {
        assert_eq!(
            kinds("value.Latitude"),
            vec![
                Token::Ident("value".into()),
                Token::Dot,
                Token::Ident("Latitude".into())
            ]
        );
    }

    #[test]
    fn lexes_floats_and_operators() {
        assert_eq!(
            kinds("1.5 != 2 && !true || a <= b"),
            vec![
                Token::Number(1.5),
                Token::BangEq,
                Token::Number(2.0),
                Token::AndAnd,
                Token::Bang,
                Token::True,
                Token::OrOr,
                Token::Ident("a".into()),
                Token::Le,
                Token::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn lexes_both_quote_styles() {
        assert_eq!(
            kinds(r#"name == 'HarshBraking' && source != "ruptela""#),
            vec![
                Token::Ident("name".into()),
                Token::EqEq,
                Token::Str("HarshBraking".into()),
                Token::AndAnd,
                Token::Ident("source".into()),
                Token::BangEq,
                Token::Str("ruptela".into()),
            ]
        );
    }

    #[test]
    fn rejects_single_ampersand() {
        assert!(matches!(tokenize("a & b"), Err(Error::Parse { .. })));
    }

    #[test]
    fn rejects_single_equals() {
        assert!(matches!(tokenize("a = 1"), Err(Error::Parse { .. })));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(matches!(tokenize("'oops"), Err(Error::Parse { .. })));
    }
}
