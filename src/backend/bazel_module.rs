//! Editing `bazel_dep(...)` entries in `MODULE.bazel`.
//!
//! Edits are textual so comments and formatting elsewhere in the file are
//! preserved.

use std::ops::Range;

use super::Dependency;
use super::project::keyword_string;

pub const MODULE_FILE: &str = "MODULE.bazel";

/// One `bazel_dep(...)` call: the byte span of the whole call and of its
/// argument list.
struct DepCall {
    span: Range<usize>,
    args: Range<usize>,
}

fn is_comment(source: &str, pos: usize) -> bool {
    let line_start = source[..pos].rfind('\n').map_or(0, |i| i + 1);
    source[line_start..pos].trim_start().starts_with('#')
}

fn dep_calls(source: &str) -> Vec<DepCall> {
    const FUNC: &str = "bazel_dep";
    let mut calls = Vec::new();
    let mut search = 0;
    while let Some(found) = source[search..].find(FUNC) {
        let pos = search + found;
        search = pos + FUNC.len();

        let boundary = source[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'));
        if !boundary || is_comment(source, pos) {
            continue;
        }
        let rest = &source[search..];
        let trimmed = rest.trim_start();
        if !trimmed.starts_with('(') {
            continue;
        }
        let open = search + (rest.len() - trimmed.len()) + 1;
        let Some(close) = source[open..].find(')').map(|i| open + i) else {
            break;
        };
        calls.push(DepCall {
            span: pos..close + 1,
            args: open..close,
        });
        search = close + 1;
    }
    calls
}

fn find_dep(source: &str, name: &str) -> Option<DepCall> {
    dep_calls(source)
        .into_iter()
        .find(|call| keyword_string(&source[call.args.clone()], "name").as_deref() == Some(name))
}

/// Byte range of the quoted value of `key = "..."` inside `args`.
fn keyword_value_span(args: &str, key: &str) -> Option<Range<usize>> {
    let mut offset = 0;
    for part in args.split(',') {
        if let Some((k, v)) = part.split_once('=')
            && k.trim() == key
        {
            let value_start = offset + k.len() + 1;
            let open = v.find('"')?;
            let close = v[open + 1..].find('"')?;
            let start = value_start + open + 1;
            return Some(start..start + close);
        }
        offset += part.len() + 1;
    }
    None
}

pub fn list(source: &str) -> Vec<Dependency> {
    dep_calls(source)
        .into_iter()
        .filter_map(|call| {
            let args = &source[call.args];
            Some(Dependency {
                name: keyword_string(args, "name")?,
                version: keyword_string(args, "version"),
                description: None,
            })
        })
        .collect()
}

/// Set the version of an existing `bazel_dep`, or append a new one.
pub fn upsert(source: &str, name: &str, version: &str) -> String {
    let Some(call) = find_dep(source, name) else {
        let mut out = source.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("bazel_dep(name = \"{name}\", version = \"{version}\")\n"));
        return out;
    };

    let args = &source[call.args.clone()];
    match keyword_value_span(args, "version") {
        Some(value) => {
            let start = call.args.start + value.start;
            let end = call.args.start + value.end;
            format!("{}{version}{}", &source[..start], &source[end..])
        }
        None => {
            let insert_at = call.args.start + args.trim_end().trim_end_matches(',').len();
            format!(
                "{}, version = \"{version}\"{}",
                &source[..insert_at],
                &source[insert_at..]
            )
        }
    }
}

/// Remove the `bazel_dep` for `name`. Returns `None` when it is not declared.
pub fn remove(source: &str, name: &str) -> Option<String> {
    let call = find_dep(source, name)?;
    let mut end = call.span.end;
    if source[end..].starts_with('\n') {
        end += 1;
    }
    Some(format!("{}{}", &source[..call.span.start], &source[end..]))
}
