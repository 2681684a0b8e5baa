//! Byte positions for statement text tokenized by `sqlparser`.
//!
//! `sqlparser` reports locations as 1-based line and column pairs, while
//! rewrites splice the original text by byte offset. [`SourceText`] keeps the
//! significant tokens of the statement with their byte spans and parenthesis
//! depth, and translates parser locations into offsets.

use sqlparser::ast::Ident as SqlIdent;
use sqlparser::dialect::Dialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::ParserError;
use sqlparser::tokenizer::{Location, Span as SqlSpan, Token, Tokenizer};

use crate::error::{Result, ShardingError};

use super::ast::{Ident, Span};

/// A non-whitespace token with its byte span.
#[derive(Debug, Clone)]
pub(crate) struct SourceToken {
    pub token: Token,
    pub span: Span,
    /// Number of enclosing parentheses. A closing `)` has the depth of its `(`.
    pub depth: usize,
}

pub(crate) struct SourceText<'a> {
    sql: &'a str,
    line_starts: Vec<usize>,
    tokens: Vec<SourceToken>,
    /// `(byte offset, parameter index)` for every marker, in textual order.
    params: Vec<(usize, usize)>,
}

impl<'a> SourceText<'a> {
    pub fn tokenize(dialect: &dyn Dialect, sql: &'a str) -> Result<Self> {
        let line_starts = std::iter::once(0)
            .chain(sql.match_indices('\n').map(|(at, _)| at + 1))
            .collect();
        let mut source = Self {
            sql,
            line_starts,
            tokens: Vec::new(),
            params: Vec::new(),
        };
        let located = Tokenizer::new(dialect, sql)
            .tokenize_with_location()
            .map_err(|err| ShardingError::Parse {
                position: source.offset(err.location).unwrap_or(0),
                message: err.message.clone(),
            })?;

        let mut depth = 0usize;
        let mut positional = 0usize;
        for located in located {
            if matches!(located.token, Token::Whitespace(_)) {
                continue;
            }
            let span = source
                .span(located.span)
                .ok_or_else(|| ShardingError::Parse {
                    position: 0,
                    message: format!("token `{}` has no source location", located.token),
                })?;
            if located.token == Token::RParen {
                depth = depth.saturating_sub(1);
            }
            let token_depth = depth;
            match &located.token {
                Token::LParen => depth += 1,
                Token::Placeholder(marker) => {
                    let index = parameter_index(marker, &mut positional).ok_or_else(|| {
                        ShardingError::Parse {
                            position: span.start,
                            message: format!("unsupported parameter marker `{marker}`"),
                        }
                    })?;
                    source.params.push((span.start, index));
                }
                _ => {}
            }
            source.tokens.push(SourceToken {
                token: located.token,
                span,
                depth: token_depth,
            });
        }
        Ok(source)
    }

    pub fn sql(&self) -> &'a str {
        self.sql
    }

    pub fn tokens(&self) -> &[SourceToken] {
        &self.tokens
    }

    /// Byte offset of a parser location; `None` for the empty location.
    pub fn offset(&self, location: Location) -> Option<usize> {
        let line = usize::try_from(location.line).ok()?.checked_sub(1)?;
        let column = usize::try_from(location.column).ok()?.checked_sub(1)?;
        let start = *self.line_starts.get(line)?;
        let rest = &self.sql[start..];
        match rest.char_indices().nth(column) {
            Some((at, _)) => Some(start + at),
            None if rest.chars().count() == column => Some(self.sql.len()),
            None => None,
        }
    }

    pub fn span(&self, span: SqlSpan) -> Option<Span> {
        Some(Span::new(self.offset(span.start)?, self.offset(span.end)?))
    }

    /// Byte span of a parsed node, failing when the parser recorded none.
    pub fn located(&self, span: SqlSpan, what: &str) -> Result<Span> {
        self.span(span).ok_or_else(|| {
            ShardingError::Unsupported(format!("{what} without a source location"))
        })
    }

    pub fn ident(&self, ident: &SqlIdent) -> Result<Ident> {
        Ok(Ident {
            value: ident.value.clone(),
            quote: ident.quote_style,
            span: self.located(ident.span, "identifier")?,
        })
    }

    /// Index of the token starting at `offset`.
    pub fn position(&self, offset: usize) -> Option<usize> {
        self.tokens
            .binary_search_by_key(&offset, |token| token.span.start)
            .ok()
    }

    pub fn is_keyword(&self, index: usize, keyword: Keyword) -> bool {
        matches!(
            self.tokens.get(index),
            Some(SourceToken { token: Token::Word(word), .. })
                if word.keyword == keyword && word.quote_style.is_none()
        )
    }

    pub fn is_any_keyword(&self, index: usize, keywords: &[Keyword]) -> bool {
        keywords.iter().any(|keyword| self.is_keyword(index, *keyword))
    }

    pub fn is_token(&self, index: usize, token: &Token) -> bool {
        self.tokens.get(index).is_some_and(|found| &found.token == token)
    }

    /// First token at or after `from`, outside any parentheses, matching `pred`.
    pub fn find_top_level(&self, from: usize, pred: impl Fn(usize) -> bool) -> Option<usize> {
        (from..self.tokens.len()).find(|&index| self.tokens[index].depth == 0 && pred(index))
    }

    /// First `keyword BY` pair outside parentheses at or after `from`.
    pub fn find_clause(&self, from: usize, keyword: Keyword) -> Option<usize> {
        self.find_top_level(from, |index| {
            self.is_keyword(index, keyword) && self.is_keyword(index + 1, Keyword::BY)
        })
    }

    /// Splits `start..end` into item ranges at top-level commas.
    pub fn split_items(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut items = Vec::new();
        let mut item_start = start;
        for index in start..end {
            if self.tokens[index].depth == 0 && self.tokens[index].token == Token::Comma {
                items.push((item_start, index));
                item_start = index + 1;
            }
        }
        if item_start < end {
            items.push((item_start, end));
        }
        items
    }

    /// Byte span from the first to the last token of a non-empty range.
    pub fn range_span(&self, start: usize, end: usize) -> Span {
        Span::new(self.tokens[start].span.start, self.tokens[end - 1].span.end)
    }

    /// End offset of the token before `index`, or of the last token.
    pub fn end_before(&self, index: Option<usize>) -> usize {
        let last = match index {
            Some(index) => index.checked_sub(1),
            None => self.tokens.len().checked_sub(1),
        };
        last.map_or(0, |last| self.tokens[last].span.end)
    }

    /// Parameter index of the marker starting at `offset`.
    pub fn param_index(&self, offset: usize) -> Option<usize> {
        self.params
            .binary_search_by_key(&offset, |(at, _)| *at)
            .ok()
            .map(|found| self.params[found].1)
    }

    pub fn parameter_count(&self) -> usize {
        self.params
            .iter()
            .map(|(_, index)| index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Upper-cased first word of the statement, for error messages.
    pub fn leading_word(&self) -> String {
        match self.tokens.first() {
            Some(SourceToken {
                token: Token::Word(word),
                ..
            }) => word.value.to_ascii_uppercase(),
            Some(token) => token.token.to_string(),
            None => String::new(),
        }
    }

    /// Maps a parser failure to a parse error positioned at the reported location.
    pub fn parse_error(&self, err: ParserError) -> ShardingError {
        let message = match err {
            ParserError::TokenizerError(message) | ParserError::ParserError(message) => message,
            ParserError::RecursionLimitExceeded => "recursion limit exceeded".to_string(),
        };
        ShardingError::Parse {
            position: self.error_position(&message).unwrap_or(0),
            message,
        }
    }

    fn error_position(&self, message: &str) -> Option<usize> {
        let (_, tail) = message.rsplit_once("Line: ")?;
        let (line, tail) = tail.split_once(", Column: ")?;
        let column: String = tail.chars().take_while(char::is_ascii_digit).collect();
        self.offset(Location {
            line: line.trim().parse().ok()?,
            column: column.parse().ok()?,
        })
    }
}

/// `?` markers are numbered in textual order; `$n` refers to parameter `n - 1`.
fn parameter_index(marker: &str, positional: &mut usize) -> Option<usize> {
    if marker == "?" {
        *positional += 1;
        return Some(*positional - 1);
    }
    let number: usize = marker.strip_prefix('$')?.parse().ok()?;
    number.checked_sub(1)
}

#[cfg(test)]
mod tests {
    use sqlparser::dialect::GenericDialect;

    use super::*;

    #[test]
    fn multi_byte_text_maps_columns_to_byte_offsets() {
        let sql = "SELECT 'é'\n  FROM t_order";
        let source = SourceText::tokenize(&GenericDialect {}, sql).expect("tokenize");
        let from = source
            .find_top_level(0, |index| source.is_keyword(index, Keyword::FROM))
            .expect("from");
        let table = source.tokens()[from + 1].span;
        assert_eq!(table.slice(sql), "t_order");
        assert_eq!(
            source.offset(Location { line: 2, column: 3 }),
            Some(sql.find("FROM").expect("from offset"))
        );
        assert_eq!(source.offset(Location { line: 0, column: 0 }), None);
    }

    #[test]
    fn markers_are_numbered_and_depth_tracks_parentheses() {
        let sql = "INSERT INTO t (a, b) VALUES (?, COALESCE(?, 1)), ($4, ?)";
        let source = SourceText::tokenize(&GenericDialect {}, sql).expect("tokenize");
        let indexes: Vec<usize> = source.params.iter().map(|(_, index)| *index).collect();
        assert_eq!(indexes, vec![0, 1, 3, 2]);
        assert_eq!(source.parameter_count(), 4);
        let close = source
            .tokens()
            .iter()
            .rposition(|token| token.token == Token::RParen)
            .expect("close");
        assert_eq!(source.tokens()[close].depth, 0);
    }

    #[test]
    fn unterminated_string_is_a_parse_error() {
        let err = SourceText::tokenize(&GenericDialect {}, "SELECT 'abc").err();
        assert!(matches!(err, Some(ShardingError::Parse { .. })));
    }
}
