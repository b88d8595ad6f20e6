//! `/_queries/<slot>/` — raw-APL slots and their derived files.

use serde_json::json;

use crate::compiler::Format;
use crate::error::{Error, Result};
use crate::query::{error_envelope, validate_apl, ExecOptions, ResultPayload};
use crate::store::is_valid_slot_name;

use super::{memory, DirEntry, Node, Vfs};

pub(crate) fn lookup(slot: &str, name: &str) -> Result<Node> {
    if !is_valid_slot_name(slot) {
        return Err(Error::NotFound);
    }
    let slot = slot.to_string();
    match name {
        "apl" => Ok(Node::SlotApl { slot }),
        "result.ndjson" => Ok(Node::SlotResult {
            slot,
            format: Format::Ndjson,
        }),
        "result.csv" => Ok(Node::SlotResult {
            slot,
            format: Format::Csv,
        }),
        "result.json" => Ok(Node::SlotResult {
            slot,
            format: Format::Json,
        }),
        "result.error" => Ok(Node::SlotError { slot }),
        "schema.csv" => Ok(Node::SlotSchema { slot }),
        "stats.json" => Ok(Node::SlotStats { slot }),
        _ => Err(Error::NotFound),
    }
}

pub(crate) fn entries(slot: &str) -> Vec<DirEntry> {
    let slot = slot.to_string();
    vec![
        DirEntry::new("apl", Node::SlotApl { slot: slot.clone() }),
        DirEntry::new(
            "result.ndjson",
            Node::SlotResult {
                slot: slot.clone(),
                format: Format::Ndjson,
            },
        ),
        DirEntry::new(
            "result.csv",
            Node::SlotResult {
                slot: slot.clone(),
                format: Format::Csv,
            },
        ),
        DirEntry::new(
            "result.json",
            Node::SlotResult {
                slot: slot.clone(),
                format: Format::Json,
            },
        ),
        DirEntry::new("result.error", Node::SlotError { slot: slot.clone() }),
        DirEntry::new("schema.csv", Node::SlotSchema { slot: slot.clone() }),
        DirEntry::new("stats.json", Node::SlotStats { slot }),
    ]
}

impl Vfs {
    /// Execution policy for user-authored queries: verbatim by default, with
    /// an opt-in for the standard safety defaults.
    fn slot_opts(&self, use_cache: bool) -> ExecOptions {
        ExecOptions {
            use_cache,
            ensure_time_range: self.config.raw_query_defaults,
            ensure_row_cap: self.config.raw_query_defaults,
        }
    }

    pub(crate) fn open_slot_result(&self, slot: &str, format: Format) -> Result<ResultPayload> {
        let apl = String::from_utf8(self.store.get(slot))
            .map_err(|_| Error::Invalid("slot is not utf-8".to_string()))?;
        validate_apl(&apl)?;
        self.executor.execute(&apl, format, self.slot_opts(true))
    }

    pub(crate) fn open_slot_error(&self, slot: &str) -> Result<ResultPayload> {
        let apl = String::from_utf8_lossy(&self.store.get(slot)).into_owned();
        if let Err(err) = validate_apl(&apl) {
            return Ok(memory(error_envelope(&apl, Some(&err))));
        }
        let outcome = self
            .executor
            .execute_bytes(&apl, Format::Ndjson, self.slot_opts(false));
        Ok(memory(error_envelope(&apl, outcome.err().as_ref())))
    }

    pub(crate) fn open_slot_schema(&self, slot: &str) -> Result<ResultPayload> {
        let apl = String::from_utf8(self.store.get(slot))
            .map_err(|_| Error::Invalid("slot is not utf-8".to_string()))?;
        validate_apl(&apl)?;
        let result = self.executor.query(&apl, self.slot_opts(false))?;
        let Some(table) = result.tables.first() else {
            return Ok(memory(Vec::new()));
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["name", "type", "aggregation"])
            .map_err(Error::from)?;
        for field in &table.fields {
            let aggregation = field
                .aggregation
                .as_ref()
                .map(|agg| agg.render())
                .unwrap_or_default();
            writer
                .write_record([field.name.as_str(), field.ty.as_str(), aggregation.as_str()])
                .map_err(Error::from)?;
        }
        let data = writer
            .into_inner()
            .map_err(|err| Error::Io(err.to_string()))?;
        Ok(memory(data))
    }

    pub(crate) fn open_slot_stats(&self, slot: &str) -> Result<ResultPayload> {
        let apl = String::from_utf8(self.store.get(slot))
            .map_err(|_| Error::Invalid("slot is not utf-8".to_string()))?;
        validate_apl(&apl)?;
        let result = self.executor.query(&apl, self.slot_opts(false))?;
        let payload = json!({
            "apl": apl,
            "status": result.status,
        });
        let mut data = serde_json::to_vec_pretty(&payload)?;
        data.push(b'\n');
        Ok(memory(data))
    }
}
