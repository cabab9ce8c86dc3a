use std::collections::HashMap;

use crate::error::SqlBatchError;
use crate::types::{PlaceholderStyle, RowValues};

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

/// Rewrite `:name` placeholders into the driver's positional style and
/// collect the parameter values in placeholder order.
///
/// Quoted strings, comments, dollar-quoted bodies, and `::type` casts are
/// left untouched. With [`PlaceholderStyle::Dollar`] a name used twice
/// binds once and reuses its `$n`; with [`PlaceholderStyle::Question`] the
/// value is repeated per occurrence.
///
/// ```rust
/// use sql_batch_middleware::named::bind_named;
/// use sql_batch_middleware::prelude::*;
///
/// let (query, params) = bind_named(
///     "SELECT * FROM users WHERE org = :org AND name = :name",
///     &[("org", RowValues::Int(7)), ("name", RowValues::Text("alice".into()))],
///     PlaceholderStyle::Dollar,
/// )?;
/// assert_eq!(query, "SELECT * FROM users WHERE org = $1 AND name = $2");
/// assert_eq!(params.len(), 2);
/// # Ok::<(), SqlBatchError>(())
/// ```
///
/// # Errors
/// `ParameterError` when the query names a parameter the caller did not
/// supply.
pub fn bind_named(
    query: &str,
    params: &[(&str, RowValues)],
    style: PlaceholderStyle,
) -> Result<(String, Vec<RowValues>), SqlBatchError> {
    let by_name: HashMap<&str, &RowValues> =
        params.iter().map(|(name, value)| (*name, value)).collect();

    let bytes = query.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(query.len());
    let mut positional: Vec<RowValues> = Vec::with_capacity(params.len());
    let mut bound: HashMap<String, usize> = HashMap::new();
    let mut state = State::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state.clone() {
            State::Normal => {
                if b == b'\'' {
                    state = State::SingleQuoted;
                } else if b == b'"' {
                    state = State::DoubleQuoted;
                } else if is_line_comment_start(bytes, idx) {
                    state = State::LineComment;
                } else if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(1);
                    out.extend_from_slice(b"/*");
                    idx += 2;
                    continue;
                } else if b == b'$' {
                    if let Some((tag, tag_end)) = try_start_dollar_quote(bytes, idx) {
                        out.extend_from_slice(&bytes[idx..=tag_end]);
                        state = State::DollarQuoted(tag);
                        idx = tag_end + 1;
                        continue;
                    }
                } else if b == b':' && !is_cast(bytes, idx) {
                    if let Some((name_end, name)) = scan_ident(bytes, idx + 1) {
                        let value = *by_name.get(name).ok_or_else(|| {
                            SqlBatchError::ParameterError(format!(
                                "missing value for named parameter :{name}"
                            ))
                        })?;

                        match style {
                            PlaceholderStyle::Dollar => {
                                let position = if let Some(&position) = bound.get(name) {
                                    position
                                } else {
                                    positional.push(value.clone());
                                    let position = positional.len();
                                    bound.insert(name.to_string(), position);
                                    position
                                };
                                out.push(b'$');
                                out.extend_from_slice(position.to_string().as_bytes());
                            }
                            PlaceholderStyle::Question => {
                                positional.push(value.clone());
                                out.push(b'?');
                            }
                        }

                        idx = name_end;
                        continue;
                    }
                }
                out.push(b);
            }
            State::SingleQuoted => {
                out.push(b);
                if b == b'\'' {
                    state = State::Normal;
                }
            }
            State::DoubleQuoted => {
                out.push(b);
                if b == b'"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                out.push(b);
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    out.extend_from_slice(b"/*");
                    idx += 2;
                    continue;
                }
                if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    out.extend_from_slice(b"*/");
                    idx += 2;
                    continue;
                }
                out.push(b);
            }
            State::DollarQuoted(tag) => {
                if b == b'$' && matches_tag(bytes, idx, &tag) {
                    out.extend_from_slice(&bytes[idx..idx + tag.len() + 2]);
                    idx += tag.len() + 2;
                    state = State::Normal;
                    continue;
                }
                out.push(b);
            }
        }
        idx += 1;
    }

    // Only original query bytes and ASCII placeholders go into `out`, so
    // the result is valid UTF-8 whenever the input was.
    let rewritten = String::from_utf8(out)
        .map_err(|_| SqlBatchError::ParameterError("query is not valid UTF-8".to_string()))?;

    Ok((rewritten, positional))
}

fn is_cast(bytes: &[u8], idx: usize) -> bool {
    (idx > 0 && bytes[idx - 1] == b':') || bytes.get(idx + 1) == Some(&b':')
}

fn scan_ident(bytes: &[u8], start: usize) -> Option<(usize, &str)> {
    let mut idx = start;
    while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
        idx += 1;
    }
    if idx == start || bytes[start].is_ascii_digit() {
        None
    } else {
        std::str::from_utf8(&bytes[start..idx])
            .ok()
            .map(|name| (idx, name))
    }
}

fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }

    if idx < bytes.len() && bytes[idx] == b'$' {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    bytes.len() > end
        && bytes[idx + 1..end].starts_with(tag.as_bytes())
        && bytes.get(end) == Some(&b'$')
}
