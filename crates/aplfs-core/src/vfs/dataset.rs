//! Dataset directory: schema files, sampling, and per-field stat files.

use std::sync::Arc;

use tracing::warn;

use crate::client::Field;
use crate::compiler::Format;
use crate::error::{Error, Result};
use crate::query::{ExecOptions, ResultPayload};

use super::{memory, DirEntry, FieldStat, Node, SchemaFormat, Vfs};

impl Vfs {
    pub(crate) fn lookup_in_dataset(&self, dataset: &str, name: &str) -> Result<Node> {
        let dataset = dataset.to_string();
        match name {
            "schema.json" => Ok(Node::SchemaFile {
                dataset,
                format: SchemaFormat::Json,
            }),
            "schema.csv" => Ok(Node::SchemaFile {
                dataset,
                format: SchemaFormat::Csv,
            }),
            "sample.ndjson" => Ok(Node::SampleFile { dataset }),
            "fields" => Ok(Node::FieldsDir { dataset }),
            "presets" => Ok(Node::DatasetPresetsDir { dataset }),
            "q" => Ok(Node::QueryPathDir {
                dataset,
                segments: Vec::new(),
            }),
            _ => Err(Error::NotFound),
        }
    }

    pub(crate) fn readdir_dataset(&self, dataset: &str) -> Vec<DirEntry> {
        self.prefetch_fields(dataset);
        let dataset = dataset.to_string();
        vec![
            DirEntry::new(
                "schema.json",
                Node::SchemaFile {
                    dataset: dataset.clone(),
                    format: SchemaFormat::Json,
                },
            ),
            DirEntry::new(
                "schema.csv",
                Node::SchemaFile {
                    dataset: dataset.clone(),
                    format: SchemaFormat::Csv,
                },
            ),
            DirEntry::new(
                "sample.ndjson",
                Node::SampleFile {
                    dataset: dataset.clone(),
                },
            ),
            DirEntry::new(
                "fields",
                Node::FieldsDir {
                    dataset: dataset.clone(),
                },
            ),
            DirEntry::new(
                "presets",
                Node::DatasetPresetsDir {
                    dataset: dataset.clone(),
                },
            ),
            DirEntry::new("q", Node::QueryPathDir {
                dataset,
                segments: Vec::new(),
            }),
        ]
    }

    /// Best-effort warm of the field catalog so `fields/` opens fast.
    fn prefetch_fields(&self, dataset: &str) {
        let fields = Arc::clone(&self.fields);
        let client = Arc::clone(&self.client);
        let dataset = dataset.to_string();
        std::thread::spawn(move || {
            if let Err(err) = fields.list(client.as_ref(), &dataset) {
                warn!(dataset, %err, "field prefetch failed");
            }
        });
    }

    pub(crate) fn readdir_fields(&self, dataset: &str) -> Result<Vec<DirEntry>> {
        let fields = self.fields.list(self.client.as_ref(), dataset)?;
        let mut entries: Vec<DirEntry> = fields
            .into_iter()
            .filter(|field| !field.hidden)
            .map(|field| {
                DirEntry::new(
                    field.name.clone(),
                    Node::FieldDir {
                        dataset: dataset.to_string(),
                        field: field.name,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub(crate) fn lookup_field(&self, dataset: &str, name: &str) -> Result<Node> {
        match self.fields.find(self.client.as_ref(), dataset, name) {
            Ok(Some(field)) => Ok(Node::FieldDir {
                dataset: dataset.to_string(),
                field: field.name,
            }),
            Ok(None) => Err(Error::NotFound),
            // When the catalog cannot load, let the path resolve anyway; the
            // stat files surface the underlying error on open.
            Err(_) => Ok(Node::FieldDir {
                dataset: dataset.to_string(),
                field: name.to_string(),
            }),
        }
    }

    pub(crate) fn open_schema(&self, dataset: &str, format: SchemaFormat) -> Result<ResultPayload> {
        let fields = self.fields.list(self.client.as_ref(), dataset)?;
        let data = match format {
            SchemaFormat::Json => {
                let mut data = serde_json::to_vec_pretty(&fields)?;
                data.push(b'\n');
                data
            }
            SchemaFormat::Csv => fields_csv(&fields)?,
        };
        Ok(memory(data))
    }

    pub(crate) fn open_sample(&self, dataset: &str) -> Result<ResultPayload> {
        let apl = format!("['{dataset}']\n| take {}", self.config.sample_limit);
        self.executor.execute(
            &apl,
            Format::Ndjson,
            ExecOptions {
                use_cache: true,
                ensure_time_range: true,
                ensure_row_cap: false,
            },
        )
    }

    pub(crate) fn open_field_stat(
        &self,
        dataset: &str,
        field: &str,
        stat: FieldStat,
    ) -> Result<ResultPayload> {
        let step = match stat {
            FieldStat::Top => format!("summarize topk({field}, 10)"),
            FieldStat::Histogram => format!("summarize histogram({field}, 100)"),
        };
        let apl = format!("['{dataset}']\n| {step}");
        let result = self.executor.execute(
            &apl,
            Format::Csv,
            ExecOptions {
                use_cache: true,
                ensure_time_range: true,
                ensure_row_cap: false,
            },
        );
        match result {
            Ok(payload) => Ok(payload),
            // Surface the failure as file content so the tree stays
            // explorable when a field does not aggregate.
            Err(err) => Ok(memory(format!("error: {err}\n").into_bytes())),
        }
    }
}

fn fields_csv(fields: &[Field]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["name", "type", "description", "unit"])?;
    for field in fields {
        if field.hidden {
            continue;
        }
        writer.write_record([
            field.name.as_str(),
            field.ty.as_str(),
            field.description.as_str(),
            field.unit.as_str(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| Error::Io(err.to_string()))
}
