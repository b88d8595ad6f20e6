//! Path-segment to APL compiler.
//!
//! A sequence of path segments under `<dataset>/q/` is translated into a
//! pipeline query. The grammar is a flat keyword language where each keyword
//! consumes a fixed number of following segments; expression arguments may be
//! percent-encoded or raw-URL-safe base64 to survive path-hostile characters.
//! Compilation is pure: no I/O, no clock, and identical inputs always yield
//! identical output.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::{Error, Result};

/// Output encodings a query file can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Ndjson,
    Csv,
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "ndjson" => Some(Format::Ndjson),
            "csv" => Some(Format::Csv),
            "json" => Some(Format::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Ndjson => "ndjson",
            Format::Csv => "csv",
            Format::Json => "json",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiler knobs. Zero caps disable the corresponding check.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Duration passed to `ago()` when no range segment appears. Empty
    /// means `1h`.
    pub default_range: String,
    /// Row cap appended when no `limit`/`top` appears. 0 falls back to 10000.
    pub default_limit: usize,
    /// Rejects ranges longer than this. Zero disables.
    pub max_range: Duration,
    /// Rejects `limit`/`top` values above this. 0 disables.
    pub max_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub dataset: String,
    pub apl: String,
    pub format: Format,
}

struct State {
    steps: Vec<String>,
    has_range: bool,
    has_limit: bool,
    format: Format,
}

impl State {
    fn push(&mut self, step: String) {
        self.steps.push(step);
    }

    fn push_range(&mut self, step: String) {
        self.has_range = true;
        self.steps.push(step);
    }
}

/// Compiles the segments after `q/` into an APL query.
pub fn compile_segments<S: AsRef<str>>(
    dataset: &str,
    segments: &[S],
    opts: &Options,
) -> Result<CompiledQuery> {
    if dataset.is_empty() {
        return Err(Error::Compile("dataset is required".to_string()));
    }

    let default_range = if opts.default_range.is_empty() {
        "1h"
    } else {
        &opts.default_range
    };
    let default_limit = if opts.default_limit > 0 {
        opts.default_limit
    } else {
        10_000
    };

    let mut state = State {
        steps: Vec::new(),
        has_range: false,
        has_limit: false,
        format: Format::default(),
    };

    let mut i = 0;
    while i < segments.len() {
        let seg = segments[i].as_ref();
        match seg {
            "range" => {
                if i + 2 >= segments.len() {
                    return Err(Error::Compile("range missing arguments".to_string()));
                }
                match segments[i + 1].as_ref() {
                    "ago" => {
                        let dur = segments[i + 2].as_ref();
                        check_range_ago(dur, opts.max_range)?;
                        state.push_range(range_ago(dur));
                        i += 3;
                    }
                    "from" => {
                        if i + 4 >= segments.len() || segments[i + 3].as_ref() != "to" {
                            return Err(Error::Compile("range/from missing to".to_string()));
                        }
                        let from = segments[i + 2].as_ref();
                        let to = segments[i + 4].as_ref();
                        check_range_from_to(from, to, opts.max_range)?;
                        state.push_range(range_from_to(from, to));
                        i += 5;
                    }
                    mode => {
                        return Err(Error::Compile(format!("range mode unsupported: {mode:?}")));
                    }
                }
            }
            "where" => {
                let expr = arg(segments, i, "where missing expression")?;
                let expr = decode_expr(expr)
                    .map_err(|err| Error::Compile(format!("where decode: {err}")))?;
                state.push(format!("where {expr}"));
                i += 2;
            }
            "search" => {
                let term = arg(segments, i, "search missing term")?;
                let term = decode_expr(term)
                    .map_err(|err| Error::Compile(format!("search decode: {err}")))?;
                state.push(format!("search \"{}\"", escape_apl_string(&term)));
                i += 2;
            }
            "summarize" => {
                let agg = arg(segments, i, "summarize missing agg")?;
                let agg = decode_expr(agg)
                    .map_err(|err| Error::Compile(format!("summarize decode: {err}")))?;
                if i + 2 < segments.len() && segments[i + 2].as_ref() == "by" {
                    if i + 3 >= segments.len() {
                        return Err(Error::Compile("summarize/by missing fields".to_string()));
                    }
                    let fields = decode_expr(segments[i + 3].as_ref())
                        .map_err(|err| Error::Compile(format!("summarize/by decode: {err}")))?;
                    state.push(format!("summarize {agg} by {fields}"));
                    i += 4;
                } else {
                    state.push(format!("summarize {agg}"));
                    i += 2;
                }
            }
            "project" => {
                let fields = arg(segments, i, "project missing fields")?;
                let fields = decode_expr(fields)
                    .map_err(|err| Error::Compile(format!("project decode: {err}")))?;
                state.push(format!("project {fields}"));
                i += 2;
            }
            "project-away" => {
                let fields = arg(segments, i, "project-away missing fields")?;
                let fields = decode_expr(fields)
                    .map_err(|err| Error::Compile(format!("project-away decode: {err}")))?;
                state.push(format!("project-away {fields}"));
                i += 2;
            }
            "order" => {
                let spec = arg(segments, i, "order missing field:dir")?;
                let (field, dir) = split_field_dir(spec)
                    .map_err(|err| Error::Compile(format!("order invalid: {err}")))?;
                state.push(format!("order by {field} {dir}"));
                i += 2;
            }
            "limit" => {
                let raw = arg(segments, i, "limit missing value")?;
                let n: usize = raw
                    .parse()
                    .map_err(|_| Error::Compile(format!("limit invalid: {raw:?}")))?;
                check_limit(n, opts.max_limit)?;
                state.push(format!("take {n}"));
                state.has_limit = true;
                i += 2;
            }
            "top" => {
                if i + 3 >= segments.len() || segments[i + 2].as_ref() != "by" {
                    return Err(Error::Compile("top requires n/by/field:dir".to_string()));
                }
                let raw = segments[i + 1].as_ref();
                let n: usize = raw
                    .parse()
                    .map_err(|_| Error::Compile(format!("top invalid: {raw:?}")))?;
                check_limit(n, opts.max_limit)?;
                let (field, dir) = split_field_dir(segments[i + 3].as_ref())
                    .map_err(|err| Error::Compile(format!("top invalid: {err}")))?;
                state.push(format!("top {n} by {field} {dir}"));
                state.has_limit = true;
                i += 4;
            }
            "format" => {
                let raw = arg(segments, i, "format missing value")?;
                state.format = Format::parse(raw)
                    .ok_or_else(|| Error::Compile(format!("format invalid: {raw:?}")))?;
                i += 2;
            }
            _ => {
                if let Some(ext) = seg.strip_prefix("result.") {
                    // `result.error` is the error-artifact sink; the query
                    // text it wraps is assembled as ndjson.
                    state.format = if ext == "error" {
                        Format::Ndjson
                    } else {
                        Format::parse(ext).ok_or_else(|| {
                            Error::Compile(format!("result extension invalid: {seg:?}"))
                        })?
                    };
                    if i + 1 != segments.len() {
                        return Err(Error::Compile(format!(
                            "unexpected segment after {seg:?}"
                        )));
                    }
                    i += 1;
                } else {
                    return Err(Error::Compile(format!("unknown segment: {seg:?}")));
                }
            }
        }
    }

    let mut steps = state.steps;
    if !state.has_range {
        steps.insert(0, range_ago(default_range));
    }
    if !state.has_limit && default_limit > 0 {
        steps.push(format!("take {default_limit}"));
    }

    let mut apl = format!("['{dataset}']");
    if !steps.is_empty() {
        apl.push_str("\n| ");
        apl.push_str(&steps.join("\n| "));
    }

    Ok(CompiledQuery {
        dataset: dataset.to_string(),
        apl,
        format: state.format,
    })
}

fn arg<'a, S: AsRef<str>>(segments: &'a [S], i: usize, missing: &str) -> Result<&'a str> {
    segments
        .get(i + 1)
        .map(|s| s.as_ref())
        .ok_or_else(|| Error::Compile(missing.to_string()))
}

fn range_ago(dur: &str) -> String {
    format!("where _time between (ago({dur}) .. now())")
}

fn range_from_to(from: &str, to: &str) -> String {
    format!(
        "where _time between (datetime(\"{from}\") .. datetime(\"{to}\"))"
    )
}

fn split_field_dir(input: &str) -> std::result::Result<(&str, &str), String> {
    let mut parts = input.split(':');
    let (Some(field), Some(dir), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("expected field:dir".to_string());
    };
    if field.is_empty() || dir.is_empty() {
        return Err("field and dir required".to_string());
    }
    if dir != "asc" && dir != "desc" {
        return Err("dir must be asc or desc".to_string());
    }
    Ok((field, dir))
}

/// Decodes an expression argument. Segments containing `%` are treated as
/// percent-encoded; otherwise a segment that is exact raw-URL-safe base64 of
/// UTF-8 text is decoded; everything else passes through unchanged.
fn decode_expr(input: &str) -> std::result::Result<String, String> {
    if input.is_empty() {
        return Err("empty input".to_string());
    }

    let decoded = percent_decode(input)?;
    if input.contains('%') {
        return Ok(decoded);
    }

    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(input) {
        if URL_SAFE_NO_PAD.encode(&bytes) == input {
            if let Ok(text) = String::from_utf8(bytes) {
                return Ok(text);
            }
        }
    }

    Ok(decoded)
}

fn percent_decode(input: &str) -> std::result::Result<String, String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| format!("truncated percent escape in {input:?}"))?;
            let hi = hex_digit(hex[0]).ok_or_else(|| format!("invalid percent escape in {input:?}"))?;
            let lo = hex_digit(hex[1]).ok_or_else(|| format!("invalid percent escape in {input:?}"))?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| format!("decoded text is not utf-8 in {input:?}"))
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn escape_apl_string(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

fn check_range_ago(dur: &str, max_range: Duration) -> Result<()> {
    let parsed = humantime::parse_duration(dur)
        .map_err(|_| Error::Compile(format!("range/ago invalid duration: {dur:?}")))?;
    if max_range > Duration::ZERO && parsed > max_range {
        return Err(Error::Compile(format!(
            "range exceeds max: {} > {}",
            humantime::format_duration(parsed),
            humantime::format_duration(max_range)
        )));
    }
    Ok(())
}

fn check_range_from_to(from: &str, to: &str, max_range: Duration) -> Result<()> {
    let start = chrono::DateTime::parse_from_rfc3339(from)
        .map_err(|_| Error::Compile(format!("range/from invalid time: {from:?}")))?;
    let end = chrono::DateTime::parse_from_rfc3339(to)
        .map_err(|_| Error::Compile(format!("range/to invalid time: {to:?}")))?;
    if end < start {
        return Err(Error::Compile("range invalid: end before start".to_string()));
    }
    if max_range > Duration::ZERO {
        let span = (end - start)
            .to_std()
            .map_err(|_| Error::Compile("range invalid: end before start".to_string()))?;
        if span > max_range {
            return Err(Error::Compile(format!(
                "range exceeds max: {} > {}",
                humantime::format_duration(span),
                humantime::format_duration(max_range)
            )));
        }
    }
    Ok(())
}

fn check_limit(n: usize, max_limit: usize) -> Result<()> {
    if max_limit > 0 && n > max_limit {
        return Err(Error::Compile(format!("limit exceeds max: {n} > {max_limit}")));
    }
    Ok(())
}
