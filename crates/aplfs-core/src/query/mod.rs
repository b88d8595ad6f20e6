//! Query execution: default injection, deduplication, encoding, spill.
//!
//! The executor sits between the VFS and the upstream client. Identical
//! in-flight requests collapse onto one upstream call keyed by the
//! fingerprint `<apl>|<format>`, results are encoded through a spill writer
//! so oversize payloads land on disk instead of in memory, and small results
//! feed the byte cache.

mod encode;
mod spill;

use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::cache::ByteCache;
use crate::client::{QueryResult, QueryService};
use crate::compiler::Format;
use crate::error::{Error, Result};
use crate::singleflight::Group;

pub use encode::encode_result;

/// Per-request execution policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub use_cache: bool,
    pub ensure_time_range: bool,
    pub ensure_row_cap: bool,
}

/// An executed result: either in-memory bytes or a disk-backed temp file.
/// Cloning shares the underlying storage; a spilled file is unlinked when the
/// last clone drops.
#[derive(Clone)]
pub enum ResultPayload {
    Memory(Arc<Vec<u8>>),
    Spilled(Arc<SpillFile>),
}

pub struct SpillFile {
    file: NamedTempFile,
    size: u64,
}

impl ResultPayload {
    pub fn len(&self) -> u64 {
        match self {
            ResultPayload::Memory(bytes) => bytes.len() as u64,
            ResultPayload::Spilled(spill) => spill.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at `offset`; short reads happen only at
    /// the end of the payload.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            ResultPayload::Memory(bytes) => {
                let start = usize::try_from(offset.min(bytes.len() as u64))
                    .map_err(|_| Error::Invalid("offset out of range".to_string()))?;
                let end = (start + buf.len()).min(bytes.len());
                let n = end - start;
                buf[..n].copy_from_slice(&bytes[start..end]);
                Ok(n)
            }
            ResultPayload::Spilled(spill) => {
                let mut read = 0;
                while read < buf.len() {
                    let n = spill
                        .file
                        .as_file()
                        .read_at(&mut buf[read..], offset + read as u64)?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                Ok(read)
            }
        }
    }

    /// Materializes the whole payload in memory.
    pub fn to_bytes(&self) -> Result<Arc<Vec<u8>>> {
        match self {
            ResultPayload::Memory(bytes) => Ok(Arc::clone(bytes)),
            ResultPayload::Spilled(spill) => {
                let size = usize::try_from(spill.size)
                    .map_err(|_| Error::Invalid("payload too large".to_string()))?;
                let mut data = vec![0u8; size];
                let n = self.read_at(&mut data, 0)?;
                data.truncate(n);
                Ok(Arc::new(data))
            }
        }
    }
}

pub struct Executor {
    client: Arc<dyn QueryService>,
    cache: Arc<ByteCache>,
    default_range: String,
    default_limit: usize,
    max_cache_bytes: usize,
    max_in_memory_bytes: usize,
    temp_dir: Option<PathBuf>,
    flight: Group<std::result::Result<ResultPayload, Error>>,
}

impl Executor {
    pub fn new(
        client: Arc<dyn QueryService>,
        cache: Arc<ByteCache>,
        default_range: String,
        default_limit: usize,
        max_cache_bytes: usize,
        max_in_memory_bytes: usize,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            cache,
            default_range,
            default_limit,
            max_cache_bytes,
            max_in_memory_bytes,
            temp_dir,
            flight: Group::new(),
        }
    }

    fn effective_apl(&self, apl: &str, opts: ExecOptions) -> String {
        let mut apl = apl.to_string();
        if opts.ensure_time_range {
            apl = ensure_time_range(&apl, &self.default_range);
        }
        if opts.ensure_row_cap {
            apl = ensure_row_cap(&apl, self.default_limit);
        }
        apl
    }

    /// Runs a query and returns the raw tabular result, bypassing the result
    /// cache and deduplication. Used by schema and stats files that need the
    /// field descriptors rather than encoded bytes.
    pub fn query(&self, apl: &str, opts: ExecOptions) -> Result<QueryResult> {
        let apl = self.effective_apl(apl, opts);
        self.client.query_apl(&apl)
    }

    /// Runs a query and encodes it in `format`, deduplicating concurrent
    /// identical requests and consulting the cache when allowed.
    pub fn execute(&self, apl: &str, format: Format, opts: ExecOptions) -> Result<ResultPayload> {
        let apl = self.effective_apl(apl, opts);
        let key = fingerprint(&apl, format);

        if opts.use_cache {
            if let Some(bytes) = self.cache.get(&key) {
                return Ok(ResultPayload::Memory(bytes));
            }
        }

        self.flight.run(&key, || {
            debug!(%apl, %format, "executing query");
            let result = self.client.query_apl(&apl)?;
            let mut writer = spill::SpillWriter::new(self.max_in_memory_bytes, self.temp_dir.clone());
            encode_result(&result, format, &mut writer)?;
            match writer.finish()? {
                spill::SpillOutcome::Memory(bytes) => {
                    if opts.use_cache && self.should_cache(bytes.len()) {
                        self.cache.set(&key, bytes.clone());
                    }
                    Ok(ResultPayload::Memory(Arc::new(bytes)))
                }
                spill::SpillOutcome::Spilled { file, size } => {
                    Ok(ResultPayload::Spilled(Arc::new(SpillFile { file, size })))
                }
            }
        })
    }

    /// `execute`, fully materialized.
    pub fn execute_bytes(
        &self,
        apl: &str,
        format: Format,
        opts: ExecOptions,
    ) -> Result<Arc<Vec<u8>>> {
        self.execute(apl, format, opts)?.to_bytes()
    }

    fn should_cache(&self, size: usize) -> bool {
        self.max_cache_bytes == 0 || size <= self.max_cache_bytes
    }
}

/// Cache and single-flight key.
pub fn fingerprint(apl: &str, format: Format) -> String {
    format!("{apl}|{format}")
}

/// Returns an empty-input error for blank slot contents.
pub fn validate_apl(apl: &str) -> Result<()> {
    if apl.trim().is_empty() {
        return Err(Error::Invalid("apl is empty".to_string()));
    }
    Ok(())
}

/// Prepends the default time filter unless the query already constrains
/// `_time`. The filter goes right after the dataset reference so later
/// operators still see it first.
pub fn ensure_time_range(apl: &str, default_range: &str) -> String {
    if apl.contains("_time between") {
        return apl.to_string();
    }
    let clause = format!("where _time between (ago({default_range}) .. now())");
    match apl.split_once('|') {
        Some((head, rest)) => format!(
            "{}\n| {clause}\n| {}",
            head.trim_end_matches([' ', '\n']),
            rest.trim_start_matches([' ', '\n'])
        ),
        None => format!("{apl}\n| {clause}"),
    }
}

/// Appends `take <n>` unless the query already has a row bound.
pub fn ensure_row_cap(apl: &str, default_limit: usize) -> String {
    if default_limit == 0 {
        return apl.to_string();
    }
    let lower = apl.to_lowercase();
    if lower.contains(" take ") || lower.contains("| take") || lower.contains(" top ") {
        return apl.to_string();
    }
    format!("{apl}\n| take {default_limit}")
}

/// JSON artifact describing a query attempt. Never fails: a serialization
/// problem degrades to a minimal failure object.
pub fn error_envelope(apl: &str, err: Option<&Error>) -> Vec<u8> {
    let at = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let payload = json!({
        "apl": apl,
        "ok": err.is_none(),
        "error": err.map(|e| e.to_string()).unwrap_or_default(),
        "at": at,
    });
    let mut data = serde_json::to_vec_pretty(&payload)
        .unwrap_or_else(|_| format!("{{\"ok\": false, \"at\": {at:?}}}").into_bytes());
    data.push(b'\n');
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_apl_pipe_format() {
        assert_eq!(fingerprint("['logs']", Format::Csv), "['logs']|csv");
    }

    #[test]
    fn ensure_time_range_inserts_after_head() {
        let apl = "['logs']\n| take 5";
        let out = ensure_time_range(apl, "1h");
        assert_eq!(
            out,
            "['logs']\n| where _time between (ago(1h) .. now())\n| take 5"
        );
    }

    #[test]
    fn ensure_time_range_appends_without_pipeline() {
        let out = ensure_time_range("['logs']", "2h");
        assert_eq!(out, "['logs']\n| where _time between (ago(2h) .. now())");
    }

    #[test]
    fn ensure_time_range_respects_existing_filter() {
        let apl = "['logs']\n| where _time between (ago(3h) .. now())";
        assert_eq!(ensure_time_range(apl, "1h"), apl);
    }

    #[test]
    fn ensure_row_cap_skips_existing_bounds() {
        for apl in [
            "['logs']\n| take 5",
            "['logs']\n| TAKE 5",
            "['logs']\n| top 5 by x desc",
        ] {
            assert_eq!(ensure_row_cap(apl, 100), apl);
        }
        assert_eq!(ensure_row_cap("['logs']", 100), "['logs']\n| take 100");
        assert_eq!(ensure_row_cap("['logs']", 0), "['logs']");
    }

    #[test]
    fn envelope_shape() {
        let ok = error_envelope("['logs']", None);
        let value: serde_json::Value = serde_json::from_slice(&ok).unwrap();
        assert_eq!(value["apl"], "['logs']");
        assert_eq!(value["ok"], true);
        assert_eq!(value["error"], "");
        assert!(value["at"].as_str().unwrap().contains('T'));
        assert!(ok.ends_with(b"\n"));

        let err = Error::Upstream("boom".to_string());
        let bad = error_envelope("['logs']", Some(&err));
        let value: serde_json::Value = serde_json::from_slice(&bad).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "upstream error: boom");
    }

    #[test]
    fn validate_apl_rejects_blank() {
        assert!(validate_apl("  \n ").is_err());
        assert!(validate_apl("['logs']").is_ok());
    }

    #[test]
    fn memory_payload_read_at() {
        let payload = ResultPayload::Memory(Arc::new(b"hello world".to_vec()));
        let mut buf = [0u8; 5];
        assert_eq!(payload.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(payload.read_at(&mut buf, 100).unwrap(), 0);
    }
}
