//! Named-parameter statements
//!
//! Compiles `:name` placeholders into Postgres positionals. Each distinct
//! name gets one `$n`; repeated names reuse it. `::type` casts, quoted
//! literals, quoted identifiers and comments pass through untouched.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::{DbError, Result};
use crate::value::Value;

/// A compiled named statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStatement {
    sql: String,
    names: Vec<String>,
}

impl NamedStatement {
    pub fn parse(source: &str) -> Result<Self> {
        let chars: Vec<char> = source.chars().collect();
        let mut sql = String::with_capacity(source.len());
        let mut names: Vec<String> = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            let end = match c {
                '\'' => {
                    let backslash = is_escape_string(&chars, i);
                    Some(skip_quoted(&chars, i, '\'', backslash).ok_or_else(|| {
                        DbError::invalid_named_query("unterminated single quote")
                    })?)
                }
                '"' => Some(skip_quoted(&chars, i, '"', false).ok_or_else(|| {
                    DbError::invalid_named_query("unterminated double quote")
                })?),
                '-' if next == Some('-') => Some(
                    chars[i..]
                        .iter()
                        .position(|&ch| ch == '\n')
                        .map_or(chars.len(), |offset| i + offset + 1),
                ),
                '/' if next == Some('*') => Some(skip_block_comment(&chars, i).ok_or_else(|| {
                    DbError::invalid_named_query("unterminated block comment")
                })?),
                '$' if i == 0 || !is_ident_char(chars[i - 1]) => match dollar_tag(&chars, i) {
                    Some(tag_end) => Some(skip_dollar_quoted(&chars, i, tag_end).ok_or_else(
                        || DbError::invalid_named_query("unterminated dollar-quoted string"),
                    )?),
                    None => None,
                },
                _ => None,
            };

            if let Some(end) = end {
                sql.extend(&chars[i..end]);
                i = end;
                continue;
            }

            match (c, next) {
                (':', Some(':')) => {
                    sql.push_str("::");
                    i += 2;
                }
                (':', Some(first)) if first.is_ascii_alphabetic() || first == '_' => {
                    let start = i + 1;
                    let mut stop = start;
                    while stop < chars.len()
                        && (chars[stop].is_ascii_alphanumeric()
                            || chars[stop] == '_'
                            || chars[stop] == '.')
                    {
                        stop += 1;
                    }
                    let name: String = chars[start..stop].iter().collect();
                    let position = match names.iter().position(|n| *n == name) {
                        Some(existing) => existing + 1,
                        None => {
                            names.push(name);
                            names.len()
                        }
                    };
                    sql.push('$');
                    sql.push_str(&position.to_string());
                    i = stop;
                }
                _ => {
                    sql.push(c);
                    i += 1;
                }
            }
        }

        Ok(Self { sql, names })
    }

    /// Positional SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Argument names in positional order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Positional arguments drawn from `args`.
    pub fn bind(&self, args: &impl NamedArgs) -> Result<Vec<Value>> {
        self.names
            .iter()
            .map(|name| {
                args.named_value(name)
                    .ok_or_else(|| DbError::MissingNamedArg { name: name.clone() })
            })
            .collect()
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// `E'...'` strings treat backslash as an escape character.
fn is_escape_string(chars: &[char], quote: usize) -> bool {
    quote >= 1
        && matches!(chars[quote - 1], 'e' | 'E')
        && (quote < 2 || !is_ident_char(chars[quote - 2]))
}

/// Index just past the closing quote; a doubled quote is an escaped one.
fn skip_quoted(chars: &[char], start: usize, quote: char, backslash: bool) -> Option<usize> {
    let mut j = start + 1;
    while j < chars.len() {
        let c = chars[j];
        if backslash && c == '\\' {
            j += 2;
            continue;
        }
        if c == quote {
            if chars.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return Some(j + 1);
        }
        j += 1;
    }
    None
}

/// Block comments nest in Postgres.
fn skip_block_comment(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut j = start;
    while j + 1 < chars.len() {
        match (chars[j], chars[j + 1]) {
            ('/', '*') => {
                depth += 1;
                j += 2;
            }
            ('*', '/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => j += 1,
        }
    }
    None
}

/// End of an opening `$tag$` (or `$$`) starting at `start`.
fn dollar_tag(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if let Some(first) = chars.get(j) {
        if first.is_ascii_digit() {
            return None;
        }
    }
    while let Some(&c) = chars.get(j) {
        if c == '$' {
            return Some(j + 1);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        j += 1;
    }
    None
}

fn skip_dollar_quoted(chars: &[char], start: usize, tag_end: usize) -> Option<usize> {
    let tag = &chars[start..tag_end];
    let mut j = tag_end;
    while j + tag.len() <= chars.len() {
        if &chars[j..j + tag.len()] == tag {
            return Some(j + tag.len());
        }
        j += 1;
    }
    None
}

/// Source of values for named placeholders.
pub trait NamedArgs {
    fn named_value(&self, name: &str) -> Option<Value>;
}

impl NamedArgs for BTreeMap<String, Value> {
    fn named_value(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl NamedArgs for HashMap<String, Value> {
    fn named_value(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Flatten a serializable struct into named arguments.
///
/// Top-level fields become names as serde renders them. Nested objects are
/// reachable with dotted names (`:owner.id`). Arrays bind as JSON.
pub fn named_args_from<T: Serialize>(value: &T) -> Result<BTreeMap<String, Value>> {
    let json = serde_json::to_value(value)
        .map_err(|e| DbError::invalid_named_query(format!("cannot serialize arguments: {e}")))?;
    let serde_json::Value::Object(fields) = json else {
        return Err(DbError::invalid_named_query(
            "named arguments must serialize to an object",
        ));
    };
    let mut out = BTreeMap::new();
    flatten_into(&mut out, None, fields);
    Ok(out)
}

fn flatten_into(
    out: &mut BTreeMap<String, Value>,
    prefix: Option<&str>,
    fields: serde_json::Map<String, serde_json::Value>,
) {
    for (key, field) in fields {
        let name = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key,
        };
        match field {
            serde_json::Value::Object(nested) => {
                out.insert(name.clone(), Value::Json(serde_json::Value::Object(nested.clone())));
                flatten_into(out, Some(&name), nested);
            }
            other => {
                out.insert(name, json_to_value(other));
            }
        }
    }
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Json(serde_json::Value::Number(n))),
        },
        serde_json::Value::String(s) => Value::Text(s),
        other => Value::Json(other),
    }
}
