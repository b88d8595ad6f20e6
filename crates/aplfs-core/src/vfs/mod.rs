//! Virtual filesystem node graph.
//!
//! Nodes are small value types; all long-lived state (catalogs, executor,
//! store, config) lives in [`Vfs`], which interprets a node for each
//! operation. Directories answer `lookup`/`readdir`, files answer `open` by
//! producing a payload, and the single writable node (`/_queries/<slot>/apl`)
//! accepts offset writes and truncation.
//!
//! The query-path tree under `<dataset>/q/` is opaque: `lookup` accepts any
//! segment and `readdir` returns nothing, because only the compiler can say
//! whether a path is meaningful, and it only runs when a `result.*` file is
//! opened.

mod dataset;
mod preset;
mod querypath;
mod slots;

use std::sync::Arc;
use std::time::SystemTime;

use crate::client::QueryService;
use crate::compiler::Format;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::{DatasetCatalog, FieldCatalog};
use crate::query::{Executor, ResultPayload};
use crate::store::{is_valid_slot_name, QueryStore};

/// Placeholder size reported for computed files before first
/// materialization. Remote clients treat size 0 as EOF and never issue a
/// read, so the placeholder must be comfortably larger than real results.
pub const PLACEHOLDER_SIZE: u64 = 64 << 20;

const README_TEXT: &str = "aplfs\n\nMost useful:\n  /<dataset>/presets/*.csv\n\nAdvanced:\n  /<dataset>/q/<...>/result.ndjson\n\nRaw APL:\n  /_queries/<name>/apl\n";

const QUICKSTART_TEXT: &str = "Example query:\n/mnt/aplfs/logs/q/range/ago/1h/where/status>=500/summarize/count()/by/service/order/count_:desc/limit/50/result.csv\n";

/// Root entries that shadow any dataset of the same name.
const RESERVED_ROOT: [&str; 5] = ["datasets", "README.txt", "examples", "_presets", "_queries"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStat {
    Top,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Root,
    Readme,
    ExamplesDir,
    Quickstart,
    DatasetsDir,
    DatasetDir { dataset: String },
    SchemaFile { dataset: String, format: SchemaFormat },
    SampleFile { dataset: String },
    FieldsDir { dataset: String },
    FieldDir { dataset: String, field: String },
    FieldStatFile { dataset: String, field: String, stat: FieldStat },
    PresetsDir,
    PresetMetaFile { name: String },
    DatasetPresetsDir { dataset: String },
    PresetResultFile { dataset: String, name: String },
    QueryPathDir { dataset: String, segments: Vec<String> },
    QueryPathFile { dataset: String, segments: Vec<String>, error: bool },
    QueriesDir,
    SlotDir { slot: String },
    SlotApl { slot: String },
    SlotResult { slot: String, format: Format },
    SlotError { slot: String },
    SlotSchema { slot: String },
    SlotStats { slot: String },
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(
            self,
            Node::Root
                | Node::ExamplesDir
                | Node::DatasetsDir
                | Node::DatasetDir { .. }
                | Node::FieldsDir { .. }
                | Node::FieldDir { .. }
                | Node::PresetsDir
                | Node::DatasetPresetsDir { .. }
                | Node::QueryPathDir { .. }
                | Node::QueriesDir
                | Node::SlotDir { .. }
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Node::SlotApl { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub size: u64,
    pub is_dir: bool,
    pub writable: bool,
    pub mtime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node: Node,
}

impl DirEntry {
    fn new(name: impl Into<String>, node: Node) -> Self {
        Self {
            name: name.into(),
            node,
        }
    }
}

pub struct Vfs {
    pub(crate) config: Config,
    pub(crate) client: Arc<dyn QueryService>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) store: QueryStore,
    pub(crate) datasets: DatasetCatalog,
    pub(crate) fields: Arc<FieldCatalog>,
    /// Stable mtime for virtual nodes; a moving mtime makes remote clients
    /// revalidate on every getattr.
    started_at: SystemTime,
}

impl Vfs {
    pub fn new(config: Config, client: Arc<dyn QueryService>, executor: Arc<Executor>) -> Self {
        let store = QueryStore::new(config.query_dir.clone());
        let datasets = DatasetCatalog::new(config.metadata_ttl, config.cache_dir.clone());
        let fields = Arc::new(FieldCatalog::new(
            config.metadata_ttl,
            config.cache_dir.clone(),
        ));
        Self {
            config,
            client,
            executor,
            store,
            datasets,
            fields,
            started_at: SystemTime::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Warms the dataset catalog; called once at startup.
    pub fn warm_datasets(&self) -> Result<()> {
        self.datasets.list(self.client.as_ref()).map(|_| ())
    }

    pub fn stat(&self, node: &Node) -> FileAttr {
        let dir = FileAttr {
            size: 0,
            is_dir: true,
            writable: false,
            mtime: self.started_at,
        };
        let fixed = |size: u64| FileAttr {
            size,
            is_dir: false,
            writable: false,
            mtime: self.started_at,
        };
        match node {
            // Clients must see the slot tree as writable to attempt creates.
            Node::QueriesDir | Node::SlotDir { .. } => FileAttr {
                writable: true,
                ..dir
            },
            node if node.is_dir() => dir,
            Node::Readme => fixed(README_TEXT.len() as u64),
            Node::Quickstart => fixed(QUICKSTART_TEXT.len() as u64),
            Node::PresetMetaFile { name } => fixed(
                crate::presets::all_presets()
                    .iter()
                    .find(|preset| preset.name == name)
                    .map(|preset| crate::presets::metadata_json(preset).len() as u64)
                    .unwrap_or(0),
            ),
            Node::SlotApl { slot } => FileAttr {
                size: self.store.get(slot).len() as u64,
                is_dir: false,
                writable: true,
                mtime: SystemTime::now(),
            },
            _ => fixed(PLACEHOLDER_SIZE),
        }
    }

    pub fn lookup(&self, node: &Node, name: &str) -> Result<Node> {
        if !node.is_dir() {
            return Err(Error::Invalid("not a directory".to_string()));
        }
        match node {
            Node::Root => self.lookup_root(name),
            Node::ExamplesDir => match name {
                "quickstart.txt" => Ok(Node::Quickstart),
                _ => Err(Error::NotFound),
            },
            Node::DatasetsDir => self.lookup_dataset(name),
            Node::DatasetDir { dataset } => self.lookup_in_dataset(dataset, name),
            Node::FieldsDir { dataset } => self.lookup_field(dataset, name),
            Node::FieldDir { dataset, field } => match name {
                "top.csv" => Ok(Node::FieldStatFile {
                    dataset: dataset.clone(),
                    field: field.clone(),
                    stat: FieldStat::Top,
                }),
                "histogram.csv" => Ok(Node::FieldStatFile {
                    dataset: dataset.clone(),
                    field: field.clone(),
                    stat: FieldStat::Histogram,
                }),
                _ => Err(Error::NotFound),
            },
            Node::PresetsDir => self.lookup_preset_meta(name),
            Node::DatasetPresetsDir { dataset } => self.lookup_dataset_preset(dataset, name),
            Node::QueryPathDir { dataset, segments } => {
                Ok(querypath::lookup(dataset, segments, name))
            }
            Node::QueriesDir => {
                if is_valid_slot_name(name) {
                    Ok(Node::SlotDir {
                        slot: name.to_string(),
                    })
                } else {
                    Err(Error::NotFound)
                }
            }
            Node::SlotDir { slot } => slots::lookup(slot, name),
            _ => Err(Error::Invalid("not a directory".to_string())),
        }
    }

    pub fn readdir(&self, node: &Node) -> Result<Vec<DirEntry>> {
        match node {
            Node::Root => self.readdir_root(),
            Node::ExamplesDir => Ok(vec![DirEntry::new("quickstart.txt", Node::Quickstart)]),
            Node::DatasetsDir => self.readdir_datasets(),
            Node::DatasetDir { dataset } => Ok(self.readdir_dataset(dataset)),
            Node::FieldsDir { dataset } => self.readdir_fields(dataset),
            Node::FieldDir { dataset, field } => Ok(vec![
                DirEntry::new(
                    "top.csv",
                    Node::FieldStatFile {
                        dataset: dataset.clone(),
                        field: field.clone(),
                        stat: FieldStat::Top,
                    },
                ),
                DirEntry::new(
                    "histogram.csv",
                    Node::FieldStatFile {
                        dataset: dataset.clone(),
                        field: field.clone(),
                        stat: FieldStat::Histogram,
                    },
                ),
            ]),
            Node::PresetsDir => Ok(self.readdir_preset_meta()),
            Node::DatasetPresetsDir { dataset } => self.readdir_dataset_presets(dataset),
            // The query-path tree is infinite; enumeration is meaningless.
            Node::QueryPathDir { .. } => Ok(Vec::new()),
            Node::QueriesDir => Ok(self
                .store
                .names()
                .into_iter()
                .map(|slot| {
                    DirEntry::new(
                        slot.clone(),
                        Node::SlotDir { slot },
                    )
                })
                .collect()),
            Node::SlotDir { slot } => Ok(slots::entries(slot)),
            _ => Err(Error::Invalid("not a directory".to_string())),
        }
    }

    /// Materializes a file node's content.
    pub fn open(&self, node: &Node) -> Result<ResultPayload> {
        match node {
            Node::Readme => Ok(memory(README_TEXT.as_bytes().to_vec())),
            Node::Quickstart => Ok(memory(QUICKSTART_TEXT.as_bytes().to_vec())),
            Node::SchemaFile { dataset, format } => self.open_schema(dataset, *format),
            Node::SampleFile { dataset } => self.open_sample(dataset),
            Node::FieldStatFile {
                dataset,
                field,
                stat,
            } => self.open_field_stat(dataset, field, *stat),
            Node::PresetMetaFile { name } => self.open_preset_meta(name),
            Node::PresetResultFile { dataset, name } => self.open_preset_result(dataset, name),
            Node::QueryPathFile {
                dataset,
                segments,
                error,
            } => self.open_query_path(dataset, segments, *error),
            Node::SlotApl { slot } => Ok(memory(self.store.get(slot))),
            Node::SlotResult { slot, format } => self.open_slot_result(slot, *format),
            Node::SlotError { slot } => self.open_slot_error(slot),
            Node::SlotSchema { slot } => self.open_slot_schema(slot),
            Node::SlotStats { slot } => self.open_slot_stats(slot),
            _ => Err(Error::Invalid("is a directory".to_string())),
        }
    }

    /// Offset write into a slot's APL. Returns the new length.
    pub fn write_slot(&self, slot: &str, offset: u64, data: &[u8]) -> Result<u64> {
        if !is_valid_slot_name(slot) {
            return Err(Error::NotFound);
        }
        let mut current = self.store.get(slot);
        let offset = usize::try_from(offset)
            .map_err(|_| Error::Invalid("write offset out of range".to_string()))?;
        if current.len() < offset + data.len() {
            current.resize(offset + data.len(), 0);
        }
        current[offset..offset + data.len()].copy_from_slice(data);
        self.store.set(slot, &current);
        Ok(current.len() as u64)
    }

    /// Size-attribute write on a slot: truncates or zero-extends.
    pub fn resize_slot(&self, slot: &str, size: u64) -> Result<u64> {
        if !is_valid_slot_name(slot) {
            return Err(Error::NotFound);
        }
        if size == 0 {
            self.store.truncate(slot);
            return Ok(0);
        }
        let size = usize::try_from(size)
            .map_err(|_| Error::Invalid("size out of range".to_string()))?;
        let mut current = self.store.get(slot);
        current.resize(size, 0);
        self.store.set(slot, &current);
        Ok(size as u64)
    }

    fn lookup_root(&self, name: &str) -> Result<Node> {
        match name {
            "README.txt" => Ok(Node::Readme),
            "examples" => Ok(Node::ExamplesDir),
            "datasets" => Ok(Node::DatasetsDir),
            "_presets" => Ok(Node::PresetsDir),
            "_queries" => Ok(Node::QueriesDir),
            _ => self.lookup_dataset(name),
        }
    }

    fn lookup_dataset(&self, name: &str) -> Result<Node> {
        match self.datasets.find(self.client.as_ref(), name)? {
            Some(dataset) => Ok(Node::DatasetDir {
                dataset: dataset.name,
            }),
            None => Err(Error::NotFound),
        }
    }

    fn readdir_root(&self) -> Result<Vec<DirEntry>> {
        let mut entries = vec![
            DirEntry::new("datasets", Node::DatasetsDir),
            DirEntry::new("README.txt", Node::Readme),
            DirEntry::new("examples", Node::ExamplesDir),
            DirEntry::new("_presets", Node::PresetsDir),
            DirEntry::new("_queries", Node::QueriesDir),
        ];
        for dataset in self.datasets.list(self.client.as_ref())? {
            if dataset.name.is_empty() || RESERVED_ROOT.contains(&dataset.name.as_str()) {
                continue;
            }
            entries.push(DirEntry::new(
                dataset.name.clone(),
                Node::DatasetDir {
                    dataset: dataset.name,
                },
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn readdir_datasets(&self) -> Result<Vec<DirEntry>> {
        let mut entries: Vec<DirEntry> = self
            .datasets
            .list(self.client.as_ref())?
            .into_iter()
            .filter(|dataset| !dataset.name.is_empty())
            .map(|dataset| {
                DirEntry::new(
                    dataset.name.clone(),
                    Node::DatasetDir {
                        dataset: dataset.name,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

pub(crate) fn memory(bytes: Vec<u8>) -> ResultPayload {
    ResultPayload::Memory(Arc::new(bytes))
}
