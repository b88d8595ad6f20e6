//! The path-grammar tree under `<dataset>/q/`.

use crate::compiler::{self, CompiledQuery, Options};
use crate::config::Config;
use crate::error::Result;
use crate::query::{error_envelope, ExecOptions, ResultPayload};

use super::{memory, Node, Vfs};

/// Any `result.*` name terminates the walk in a computed file; everything
/// else extends the segment list one level deeper.
pub(crate) fn lookup(dataset: &str, segments: &[String], name: &str) -> Node {
    let mut next = segments.to_vec();
    next.push(name.to_string());
    if name.starts_with("result.") {
        Node::QueryPathFile {
            dataset: dataset.to_string(),
            segments: next,
            error: name == "result.error",
        }
    } else {
        Node::QueryPathDir {
            dataset: dataset.to_string(),
            segments: next,
        }
    }
}

pub(crate) fn compile_path(
    dataset: &str,
    segments: &[String],
    config: &Config,
) -> Result<CompiledQuery> {
    let opts = Options {
        default_range: config.default_range.clone(),
        default_limit: config.default_limit,
        max_range: config.max_range,
        max_limit: config.max_limit,
    };
    compiler::compile_segments(dataset, segments, &opts)
}

impl Vfs {
    pub(crate) fn open_query_path(
        &self,
        dataset: &str,
        segments: &[String],
        error_sink: bool,
    ) -> Result<ResultPayload> {
        // Compiled text already carries the defaults, so the executor must
        // not inject them a second time.
        let opts = ExecOptions {
            use_cache: !error_sink,
            ensure_time_range: false,
            ensure_row_cap: false,
        };
        let compiled = match compile_path(dataset, segments, &self.config) {
            Ok(compiled) => compiled,
            Err(err) if error_sink => return Ok(memory(error_envelope("", Some(&err)))),
            Err(err) => return Err(err),
        };
        if error_sink {
            let outcome = self
                .executor
                .execute_bytes(&compiled.apl, compiled.format, opts);
            return Ok(memory(error_envelope(&compiled.apl, outcome.err().as_ref())));
        }
        self.executor.execute(&compiled.apl, compiled.format, opts)
    }
}
