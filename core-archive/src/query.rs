//! Search query parser.
//!
//! Translates user queries into an FTS5 `MATCH` expression plus SQL filters,
//! validating them first so callers never see raw FTS5 syntax errors.
//!
//! ```text
//! invoice                  free text across all indexed fields
//! "exact phrase"           phrase match
//! meet*                    prefix match
//! from:alice               sender column (alias: sender:)
//! to:bob                   recipients column (alias: recipients:)
//! subject:meeting          subject column
//! attachment:pdf           attachment names (alias: attachments:)
//! label:inbox              label filter (alias: tag:)
//! has:attachment           messages with attachments
//! before:2024-06-01        date filter (also YYYYMMDD)
//! after:2024-01-01         date filter
//! -keyword, -from:alice    exclusion
//! a OR b, (a OR b) c       boolean OR, grouping; AND is implicit
//! ```
//!
//! Label, date and attachment-flag filters apply to the whole query even
//! when written inside a group.

use crate::error::{ArchiveError, Result};
use chrono::NaiveDate;

/// FTS5 characters that force a value to be quoted.
const FTS5_SPECIAL_CHARS: &[char] = &['.', '@', '-', '+', '*', '"', '(', ')', ':', '^'];

const KNOWN_FILTERS: &[&str] = &[
    "from",
    "sender",
    "to",
    "recipients",
    "subject",
    "label",
    "tag",
    "before",
    "after",
    "has",
    "attachment",
    "attachments",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Phrase(String),
    Filter {
        field: String,
        value: String,
        negated: bool,
    },
    Negation(String),
    Or,
    LParen,
    RParen,
}

/// Filter evaluated in SQL rather than by the full-text index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlFilter {
    Label { value: String, negated: bool },
    Before { date: String, negated: bool },
    After { date: String, negated: bool },
    HasAttachment { negated: bool },
}

/// Validated search query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    /// FTS5 expression the result rows must match
    pub fts_query: Option<String>,
    /// FTS5 expression the result rows must not match. Only set when the
    /// query consists solely of exclusions.
    pub excluded_fts: Option<String>,
    pub filters: Vec<SqlFilter>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.fts_query.is_none() && self.excluded_fts.is_none() && self.filters.is_empty()
    }
}

/// Parse a user query.
///
/// # Errors
///
/// `ArchiveError::InvalidQuery` with a user-facing message.
pub fn parse_query(query: &str) -> Result<ParsedQuery> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(ParsedQuery::default());
    }

    let tokens = tokenize(query).map_err(ArchiveError::InvalidQuery)?;
    validate_tokens(&tokens).map_err(ArchiveError::InvalidQuery)?;

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        filters: Vec::new(),
    };
    let expr = parser.parse_or().map_err(ArchiveError::InvalidQuery)?;
    let filters = parser.filters;

    let mut parsed = ParsedQuery {
        filters,
        ..ParsedQuery::default()
    };

    match expr {
        None => {}
        // Exclusions alone cannot be expressed in FTS5; the store turns them
        // into a NOT IN subquery instead.
        Some(Expr::And(items)) if items.iter().all(|e| matches!(e, Expr::Not(_))) => {
            let excluded: Vec<String> = items
                .into_iter()
                .filter_map(|e| match e {
                    Expr::Not(term) => Some(term),
                    _ => None,
                })
                .collect();
            parsed.excluded_fts = Some(excluded.join(" OR "));
        }
        Some(Expr::Not(term)) => parsed.excluded_fts = Some(term),
        Some(expr) => parsed.fts_query = Some(render(&expr).map_err(ArchiveError::InvalidQuery)?),
    }

    Ok(parsed)
}

fn normalize_field(field: &str) -> &str {
    match field {
        "sender" => "from",
        "recipients" => "to",
        "tag" => "label",
        "attachments" => "attachment",
        other => other,
    }
}

fn truncated(rest: &str) -> String {
    let partial: String = rest.chars().take(19).collect();
    if rest.chars().count() > 19 {
        format!("{}...", partial)
    } else {
        partial
    }
}

/// Try to read `segment` as `field:value`.
fn split_filter(segment: &str, negated: bool) -> std::result::Result<Option<Token>, String> {
    let Some((field, value)) = segment.split_once(':') else {
        return Ok(None);
    };
    if field.is_empty() {
        return Ok(None);
    }

    let field = field.to_lowercase();
    if !KNOWN_FILTERS.contains(&field.as_str()) {
        return Ok(None);
    }
    if value.is_empty() {
        let prefix = if negated { "-" } else { "" };
        return Err(format!("Empty value for '{}{}:' filter", prefix, field));
    }

    Ok(Some(Token::Filter {
        field: normalize_field(&field).to_string(),
        value: value.to_string(),
        negated,
    }))
}

fn tokenize(query: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = query.chars().collect();
    let text = |from: usize, to: usize| chars[from..to].iter().collect::<String>();
    let find_quote = |from: usize| (from..chars.len()).find(|&k| chars[k] == '"');

    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        match chars[i] {
            '"' => {
                let end = find_quote(i + 1).ok_or_else(|| {
                    format!("Unclosed quote after '{}'", truncated(&text(i + 1, chars.len())))
                })?;
                tokens.push(Token::Phrase(text(i + 1, end)));
                i = end + 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' if i + 1 < chars.len() && !chars[i + 1].is_whitespace() => {
                if chars[i + 1] == '"' {
                    let end = find_quote(i + 2).ok_or_else(|| {
                        format!("Unclosed quote after '{}'", truncated(&text(i + 2, chars.len())))
                    })?;
                    tokens.push(Token::Negation(text(i + 2, end)));
                    i = end + 1;
                    continue;
                }

                let mut j = i + 1;
                while j < chars.len() && !chars[j].is_whitespace() && !matches!(chars[j], '(' | ')')
                {
                    j += 1;
                }
                let word = text(i + 1, j);
                if !word.is_empty() {
                    match split_filter(&word, true)? {
                        Some(filter) => tokens.push(filter),
                        None => tokens.push(Token::Negation(word)),
                    }
                }
                i = j;
            }
            _ => {
                let mut j = i;
                while j < chars.len()
                    && !chars[j].is_whitespace()
                    && !matches!(chars[j], '(' | ')' | '"')
                {
                    j += 1;
                }
                let segment = text(i, j);
                i = j;

                if segment.eq_ignore_ascii_case("OR") {
                    tokens.push(Token::Or);
                } else if segment.eq_ignore_ascii_case("AND") {
                    // implicit
                } else if let Some(filter) = split_filter(&segment, false)? {
                    tokens.push(filter);
                } else {
                    tokens.push(Token::Word(segment));
                }
            }
        }
    }

    Ok(tokens)
}

fn validate_tokens(tokens: &[Token]) -> std::result::Result<(), String> {
    match (tokens.first(), tokens.last()) {
        (Some(Token::Or), _) => return Err("Search cannot start with OR".to_string()),
        (_, Some(Token::Or)) => return Err("Search cannot end with OR".to_string()),
        _ => {}
    }

    if tokens
        .windows(2)
        .any(|pair| pair[0] == Token::Or && pair[1] == Token::Or)
    {
        return Err("Invalid: consecutive OR operators".to_string());
    }

    let mut depth = 0i32;
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err("Unmatched closing parenthesis".to_string());
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        return Err("Unclosed parenthesis".to_string());
    }

    Ok(())
}

/// Escape a value for inclusion in an FTS5 expression, keeping a trailing
/// `*` as a prefix operator.
pub fn escape_fts5_value(value: &str) -> String {
    let needs_quoting =
        |s: &str| s.chars().any(|c| FTS5_SPECIAL_CHARS.contains(&c) || c.is_whitespace());
    let quote = |s: &str| format!("\"{}\"", s.replace('"', "\"\""));

    if let Some(prefix) = value.strip_suffix('*') {
        if needs_quoting(prefix) {
            return format!("{}*", quote(prefix));
        }
        return value.to_string();
    }

    // Bare operator keywords would change the expression's meaning.
    if needs_quoting(value) || matches!(value, "NOT" | "NEAR" | "OR" | "AND") {
        quote(value)
    } else {
        value.to_string()
    }
}

/// Accepts `YYYY-MM-DD` or `YYYYMMDD`, returns `YYYY-MM-DD`.
fn normalize_date(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(|c| *c != '-').collect();
    let dashes = value.chars().filter(|c| *c == '-').count();
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if dashes != 0 && !(dashes == 2 && value.len() == 10) {
        return None;
    }

    NaiveDate::parse_from_str(&digits, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Boolean structure of the full-text part of a query. Terms are already
/// rendered FTS5 fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Term(String),
    Not(String),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    filters: Vec<SqlFilter>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> std::result::Result<Option<Expr>, String> {
        let mut branches = Vec::new();

        loop {
            if let Some(branch) = self.parse_and()? {
                branches.push(branch);
            }

            match self.peek() {
                Some(Token::Or) => self.pos += 1,
                _ => break,
            }
        }

        Ok(match branches.len() {
            0 => None,
            1 => branches.pop(),
            _ => Some(Expr::Or(branches)),
        })
    }

    fn parse_and(&mut self) -> std::result::Result<Option<Expr>, String> {
        let mut items = Vec::new();

        while let Some(token) = self.peek().cloned() {
            match token {
                Token::Or | Token::RParen => break,
                Token::LParen => {
                    self.pos += 1;
                    let inner = self.parse_or()?;
                    if self.peek() == Some(&Token::RParen) {
                        self.pos += 1;
                    }
                    if let Some(inner) = inner {
                        items.push(inner);
                    }
                }
                Token::Word(word) => {
                    self.pos += 1;
                    items.push(Expr::Term(escape_fts5_value(&word)));
                }
                Token::Phrase(phrase) => {
                    self.pos += 1;
                    if !phrase.trim().is_empty() {
                        items.push(Expr::Term(format!("\"{}\"", phrase.replace('"', "\"\""))));
                    }
                }
                Token::Negation(word) => {
                    self.pos += 1;
                    if !word.trim().is_empty() {
                        items.push(Expr::Not(escape_fts5_value(&word)));
                    }
                }
                Token::Filter {
                    field,
                    value,
                    negated,
                } => {
                    self.pos += 1;
                    if let Some(term) = self.filter(&field, &value, negated)? {
                        items.push(if negated {
                            Expr::Not(term)
                        } else {
                            Expr::Term(term)
                        });
                    }
                }
            }
        }

        Ok(match items.len() {
            0 => None,
            1 => items.pop(),
            _ => Some(Expr::And(items)),
        })
    }

    /// Column filters become FTS terms; the rest are collected as SQL filters.
    fn filter(
        &mut self,
        field: &str,
        value: &str,
        negated: bool,
    ) -> std::result::Result<Option<String>, String> {
        let column = match field {
            "from" => Some("sender"),
            "to" => Some("recipients"),
            "subject" => Some("subject"),
            "attachment" => Some("attachments"),
            _ => None,
        };
        if let Some(column) = column {
            return Ok(Some(format!("{}:{}", column, escape_fts5_value(value))));
        }

        let filter = match field {
            "label" => SqlFilter::Label {
                value: value.to_string(),
                negated,
            },
            "before" => SqlFilter::Before {
                date: normalize_date(value)
                    .ok_or_else(|| format!("Invalid date format for 'before:': {}", value))?,
                negated,
            },
            "after" => SqlFilter::After {
                date: normalize_date(value)
                    .ok_or_else(|| format!("Invalid date format for 'after:': {}", value))?,
                negated,
            },
            "has" if matches!(value.to_lowercase().as_str(), "attachment" | "attachments") => {
                SqlFilter::HasAttachment { negated }
            }
            _ => return Err(format!("Unsupported filter value '{}:{}'", field, value)),
        };
        self.filters.push(filter);
        Ok(None)
    }
}

/// Render an expression as FTS5 syntax. FTS5 `NOT` is binary, so every
/// exclusion must follow a positive term of its own group.
fn render(expr: &Expr) -> std::result::Result<String, String> {
    match expr {
        Expr::Term(term) => Ok(term.clone()),
        Expr::Not(_) => Err("An excluded term needs a positive term in the same group".to_string()),
        Expr::Or(branches) => {
            let rendered = branches
                .iter()
                .map(|b| render(b).map(|s| group(b, s)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rendered.join(" OR "))
        }
        Expr::And(items) => {
            let (negated, positive): (Vec<&Expr>, Vec<&Expr>) =
                items.iter().partition(|e| matches!(e, Expr::Not(_)));
            if positive.is_empty() {
                return Err("An excluded term needs a positive term in the same group".to_string());
            }

            let positive = positive
                .into_iter()
                .map(|e| render(e).map(|s| group(e, s)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut out = if positive.len() == 1 {
                positive.join(" ")
            } else {
                format!("({})", positive.join(" "))
            };
            for item in negated {
                if let Expr::Not(term) = item {
                    out.push_str(" NOT ");
                    out.push_str(term);
                }
            }
            Ok(out)
        }
    }
}

fn group(expr: &Expr, rendered: String) -> String {
    match expr {
        Expr::Or(_) | Expr::And(_) => format!("({})", rendered),
        _ => rendered,
    }
}
