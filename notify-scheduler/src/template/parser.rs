//! Template parsing and rendering.
//!
//! Supported syntax:
//! - `{{ name }}` / `{{ .name }}` - variable interpolation, unknown names render empty
//! - `{{ name | default:"fallback" | upper }}` - filters: `default`, `upper`, `lower`, `title`, `trim`
//! - `{{#if name}}...{{else}}...{{/if}}` and `{{#unless name}}...{{/unless}}`

use std::fmt;

use crate::database::models::Metadata;

/// Parse failure with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    Default(String),
    Upper,
    Lower,
    Title,
    Trim,
}

impl Filter {
    fn apply(&self, value: String) -> String {
        match self {
            Filter::Default(fallback) if value.is_empty() => fallback.clone(),
            Filter::Default(_) => value,
            Filter::Upper => value.to_uppercase(),
            Filter::Lower => value.to_lowercase(),
            Filter::Title => title_case(&value),
            Filter::Trim => value.trim().to_string(),
        }
    }
}

fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut at_word_start = true;
    for c in value.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Var {
        name: String,
        filters: Vec<Filter>,
    },
    Cond {
        name: String,
        negate: bool,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// A parsed template ready for repeated rendering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledTemplate {
    nodes: Vec<Node>,
}

impl CompiledTemplate {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(source)?;
        let mut iter = tokens.into_iter().peekable();
        let nodes = parse_nodes(&mut iter, None)?;
        Ok(Self { nodes })
    }

    pub fn render(&self, vars: &Metadata) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, vars, &mut out);
        out
    }
}

#[derive(Debug)]
enum Token {
    Text(String),
    Var {
        name: String,
        filters: Vec<Filter>,
    },
    Open {
        offset: usize,
        kind: BlockKind,
        name: String,
    },
    Else {
        offset: usize,
    },
    Close {
        offset: usize,
        kind: BlockKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    Unless,
}

impl BlockKind {
    fn as_str(self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::Unless => "unless",
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        let tag_offset = offset + start;
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return Err(ParseError::new(tag_offset, "unclosed tag"));
        };
        tokens.push(parse_tag(after_open[..end].trim(), tag_offset)?);

        let consumed = start + 2 + end + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
    Ok(tokens)
}

fn parse_tag(tag: &str, offset: usize) -> Result<Token, ParseError> {
    if let Some(directive) = tag.strip_prefix('#') {
        let (keyword, arg) = directive
            .split_once(char::is_whitespace)
            .unwrap_or((directive, ""));
        let kind = match keyword {
            "if" => BlockKind::If,
            "unless" => BlockKind::Unless,
            other => return Err(ParseError::new(offset, format!("unknown block '{other}'"))),
        };
        let name = parse_name(arg.trim(), offset)?;
        return Ok(Token::Open { offset, kind, name });
    }

    if let Some(keyword) = tag.strip_prefix('/') {
        let kind = match keyword.trim() {
            "if" => BlockKind::If,
            "unless" => BlockKind::Unless,
            other => return Err(ParseError::new(offset, format!("unknown block '{other}'"))),
        };
        return Ok(Token::Close { offset, kind });
    }

    if tag == "else" {
        return Ok(Token::Else { offset });
    }

    let mut parts = split_pipes(tag, offset)?.into_iter();
    let name = parse_name(parts.next().unwrap_or_default().trim(), offset)?;
    let filters = parts
        .map(|part| parse_filter(part.trim(), offset))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Token::Var { name, filters })
}

/// Split on `|` outside of quoted strings.
fn split_pipes(tag: &str, offset: usize) -> Result<Vec<&str>, ParseError> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in tag.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '|') => {
                parts.push(&tag[start..i]);
                start = i + 1;
            }
            (None, _) => {}
        }
    }
    if quote.is_some() {
        return Err(ParseError::new(offset, "unterminated string literal"));
    }
    parts.push(&tag[start..]);
    Ok(parts)
}

fn parse_name(raw: &str, offset: usize) -> Result<String, ParseError> {
    let name = raw.strip_prefix('.').unwrap_or(raw);
    if name.is_empty() {
        return Err(ParseError::new(offset, "empty variable name"));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ParseError::new(offset, format!("invalid variable name '{name}'")));
    }
    Ok(name.to_string())
}

fn parse_filter(raw: &str, offset: usize) -> Result<Filter, ParseError> {
    if let Some(arg) = raw.strip_prefix("default") {
        let arg = arg.trim_start();
        let arg = arg.strip_prefix(':').unwrap_or(arg).trim();
        return parse_string_literal(arg, offset).map(Filter::Default);
    }
    match raw {
        "upper" => Ok(Filter::Upper),
        "lower" => Ok(Filter::Lower),
        "title" => Ok(Filter::Title),
        "trim" => Ok(Filter::Trim),
        "" => Err(ParseError::new(offset, "empty filter")),
        other => Err(ParseError::new(offset, format!("unknown filter '{other}'"))),
    }
}

fn parse_string_literal(raw: &str, offset: usize) -> Result<String, ParseError> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open), Some(close)) if open == close && matches!(open, '"' | '\'') => {
            Ok(chars.as_str().to_string())
        }
        _ => Err(ParseError::new(
            offset,
            "default filter expects a quoted string",
        )),
    }
}

fn parse_nodes<I>(
    tokens: &mut std::iter::Peekable<I>,
    open: Option<(BlockKind, usize)>,
) -> Result<Vec<Node>, ParseError>
where
    I: Iterator<Item = Token>,
{
    let mut nodes = Vec::new();

    loop {
        if let Some(Token::Else { offset } | Token::Close { offset, .. }) = tokens.peek() {
            if open.is_none() {
                return Err(ParseError::new(*offset, "unexpected closing tag"));
            }
            return Ok(nodes);
        }

        let Some(token) = tokens.next() else { break };
        match token {
            Token::Text(text) => nodes.push(Node::Text(text)),
            Token::Var { name, filters } => nodes.push(Node::Var { name, filters }),
            Token::Open { offset, kind, name } => {
                let then = parse_nodes(tokens, Some((kind, offset)))?;
                let mut otherwise = Vec::new();

                if let Some(Token::Else { .. }) = tokens.peek() {
                    tokens.next();
                    otherwise = parse_nodes(tokens, Some((kind, offset)))?;
                }

                match tokens.next() {
                    Some(Token::Close {
                        kind: close_kind, ..
                    }) if close_kind == kind => {}
                    Some(Token::Close { offset, kind: close_kind }) => {
                        return Err(ParseError::new(
                            offset,
                            format!(
                                "mismatched block: expected {{{{/{}}}}}, found {{{{/{}}}}}",
                                kind.as_str(),
                                close_kind.as_str()
                            ),
                        ));
                    }
                    Some(Token::Else { offset }) => {
                        return Err(ParseError::new(offset, "duplicate else"));
                    }
                    _ => {
                        return Err(ParseError::new(
                            offset,
                            format!("unclosed {{{{#{}}}}} block", kind.as_str()),
                        ));
                    }
                }

                nodes.push(Node::Cond {
                    name,
                    negate: kind == BlockKind::Unless,
                    then,
                    otherwise,
                });
            }
            Token::Else { .. } | Token::Close { .. } => {}
        }
    }

    if let Some((kind, offset)) = open {
        return Err(ParseError::new(
            offset,
            format!("unclosed {{{{#{}}}}} block", kind.as_str()),
        ));
    }
    Ok(nodes)
}

fn is_truthy(value: Option<&String>) -> bool {
    match value.map(|v| v.trim()) {
        None | Some("") => false,
        Some(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
    }
}

fn render_nodes(nodes: &[Node], vars: &Metadata, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { name, filters } => {
                let value = vars.get(name).cloned().unwrap_or_default();
                let value = filters.iter().fold(value, |acc, f| f.apply(acc));
                out.push_str(&value);
            }
            Node::Cond {
                name,
                negate,
                then,
                otherwise,
            } => {
                if is_truthy(vars.get(name)) != *negate {
                    render_nodes(then, vars, out);
                } else {
                    render_nodes(otherwise, vars, out);
                }
            }
        }
    }
}
