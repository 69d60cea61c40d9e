//! Grammar description reader.
//!
//! One statement per line, `%` starts a comment:
//!
//! ```text
//! @top S                  % accepted root labels
//! S  -> NP VP             % binary rule
//! NP -> PRP               % unary rule
//! PRP -> "I" "you"        % terminal label with tag-dictionary words
//! NN -> *                 % terminal label for any word
//! ```
//!
//! Labels are any run of non-blank characters other than `%` and `"`, so
//! punctuation labels such as `.` or `,` need no quoting.
//!
//! # Example
//!
//! ```rust
//! use span_chart::parser::parse_grammar;
//!
//! let grammar = parse_grammar(r#"
//!     @top S
//!     S -> A B
//!     A -> "a"
//!     B -> "b"
//! "#).unwrap();
//!
//! assert_eq!(grammar.binary_rules().len(), 1);
//! assert!(grammar.label("S").is_some());
//! ```

use crate::grammar::{Grammar, GrammarError};
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

/// Grammar text errors, tagged with the 1-based line number.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("line {line}: expected {expected}, found {found}")]
    Expected {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },
    #[error("line {line}: unknown directive @{name}")]
    UnknownDirective { line: usize, name: String },
    #[error("line {line}: {source}")]
    Grammar {
        line: usize,
        #[source]
        source: GrammarError,
    },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Symbol(String),
    Quoted(String),
    Directive(String),
    Arrow,
    Star,
    Newline,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Symbol(s) => format!("label `{}`", s),
            Token::Quoted(s) => format!("word \"{}\"", s),
            Token::Directive(s) => format!("@{}", s),
            Token::Arrow => "`->`".to_string(),
            Token::Star => "`*`".to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer {
            input: input.chars().peekable(),
            line: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.input.peek().copied()
    }

    fn advance(&mut self) -> Option<char> {
        self.input.next()
    }

    /// Skip blanks and comments, stopping at a newline.
    fn skip_blanks(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            } else if c.is_whitespace() {
                self.advance();
            } else if c == '%' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_while<F: Fn(char) -> bool>(&mut self, predicate: F) -> String {
        let mut result = String::new();
        while let Some(c) = self.peek() {
            if predicate(c) {
                result.push(c);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_string(&mut self) -> ParseResult<String> {
        self.advance();
        let mut result = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(result),
                Some('\\') => match self.advance() {
                    Some('"') => result.push('"'),
                    Some('\\') => result.push('\\'),
                    Some(c) => result.push(c),
                    None => return Err(ParseError::UnterminatedString { line: self.line }),
                },
                Some('\n') | None => return Err(ParseError::UnterminatedString { line: self.line }),
                Some(c) => result.push(c),
            }
        }
    }

    fn next_token(&mut self) -> ParseResult<Token> {
        self.skip_blanks();
        match self.peek() {
            None => Ok(Token::Eof),
            Some('\n') => {
                self.advance();
                self.line += 1;
                Ok(Token::Newline)
            }
            Some('"') => Ok(Token::Quoted(self.read_string()?)),
            Some('@') => {
                self.advance();
                Ok(Token::Directive(self.read_while(is_symbol_char)))
            }
            Some(_) => {
                let symbol = self.read_while(is_symbol_char);
                Ok(match symbol.as_str() {
                    "->" => Token::Arrow,
                    "*" => Token::Star,
                    _ => Token::Symbol(symbol),
                })
            }
        }
    }
}

fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && c != '%' && c != '"'
}

/// Reads statements into a grammar.
struct GrammarReader<'a> {
    lexer: Lexer<'a>,
}

impl<'a> GrammarReader<'a> {
    fn new(input: &'a str) -> Self {
        GrammarReader {
            lexer: Lexer::new(input),
        }
    }

    /// Tokens of the next non-empty line with its line number, or `None` at
    /// the end of input.
    fn next_line(&mut self) -> ParseResult<Option<(usize, Vec<Token>)>> {
        loop {
            let line = self.lexer.line;
            let mut tokens = Vec::new();
            let eof = loop {
                match self.lexer.next_token()? {
                    Token::Newline => break false,
                    Token::Eof => break true,
                    token => tokens.push(token),
                }
            };
            if !tokens.is_empty() {
                return Ok(Some((line, tokens)));
            }
            if eof {
                return Ok(None);
            }
        }
    }

    fn read_into(&mut self, grammar: &mut Grammar) -> ParseResult<()> {
        while let Some((line, tokens)) = self.next_line()? {
            statement(grammar, line, &tokens)?;
        }
        Ok(())
    }
}

fn statement(grammar: &mut Grammar, line: usize, tokens: &[Token]) -> ParseResult<()> {
    let lift = |source: GrammarError| ParseError::Grammar { line, source };
    let expected = |what: &str, found: Option<&Token>| ParseError::Expected {
        line,
        expected: what.to_string(),
        found: found.map_or_else(|| Token::Eof.describe(), Token::describe),
    };

    match tokens {
        [Token::Directive(name), labels @ ..] if name == "top" => {
            if labels.is_empty() {
                return Err(expected("a root label", None));
            }
            for token in labels {
                let Token::Symbol(label) = token else {
                    return Err(expected("a root label", Some(token)));
                };
                grammar.add_top_level_named(label).map_err(lift)?;
            }
            Ok(())
        }
        [Token::Directive(name), ..] => Err(ParseError::UnknownDirective {
            line,
            name: name.clone(),
        }),
        [Token::Symbol(parent), Token::Arrow, rest @ ..] => match rest {
            [Token::Symbol(left), Token::Symbol(right)] => {
                grammar.add_binary_named(parent, left, right).map_err(lift)?;
                Ok(())
            }
            [Token::Symbol(child)] => {
                grammar.add_unary_named(parent, child).map_err(lift)?;
                Ok(())
            }
            [Token::Star] => {
                grammar.add_terminal_named(parent).map_err(lift)?;
                Ok(())
            }
            [Token::Quoted(_), ..] => {
                for token in rest {
                    let Token::Quoted(word) = token else {
                        return Err(expected("a quoted word", Some(token)));
                    };
                    grammar.add_lexical_named(parent, word).map_err(lift)?;
                }
                Ok(())
            }
            [Token::Symbol(_), Token::Symbol(_), extra, ..] => Err(expected("end of line", Some(extra))),
            [first, ..] => Err(expected("a label, a quoted word or `*`", Some(first))),
            [] => Err(expected("a rule body", None)),
        },
        [Token::Symbol(_), other, ..] => Err(expected("`->`", Some(other))),
        [Token::Symbol(_)] => Err(expected("`->`", None)),
        [first, ..] => Err(expected("a label or directive", Some(first))),
        [] => Ok(()),
    }
}

/// Parse a grammar description.
pub fn parse_grammar(input: &str) -> ParseResult<Grammar> {
    let mut grammar = Grammar::new();
    parse_grammar_into(&mut grammar, input)?;
    Ok(grammar)
}

/// Add the statements of `input` to an existing grammar.
pub fn parse_grammar_into(grammar: &mut Grammar, input: &str) -> ParseResult<()> {
    GrammarReader::new(input).read_into(grammar)
}
