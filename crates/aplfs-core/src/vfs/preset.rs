//! Preset catalog nodes: root-level metadata and per-dataset result files.

use crate::error::{Error, Result};
use crate::presets;
use crate::query::{ExecOptions, ResultPayload};

use super::{memory, DirEntry, Node, Vfs};

impl Vfs {
    pub(crate) fn readdir_preset_meta(&self) -> Vec<DirEntry> {
        let mut entries: Vec<DirEntry> = presets::all_presets()
            .into_iter()
            .map(|preset| {
                DirEntry::new(
                    format!("{}.json", preset.name),
                    Node::PresetMetaFile {
                        name: preset.name.to_string(),
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        entries
    }

    pub(crate) fn lookup_preset_meta(&self, name: &str) -> Result<Node> {
        let base = name.strip_suffix(".json").unwrap_or(name);
        presets::all_presets()
            .iter()
            .find(|preset| preset.name == base)
            .map(|preset| Node::PresetMetaFile {
                name: preset.name.to_string(),
            })
            .ok_or(Error::NotFound)
    }

    pub(crate) fn open_preset_meta(&self, name: &str) -> Result<ResultPayload> {
        presets::all_presets()
            .iter()
            .find(|preset| preset.name == name)
            .map(|preset| memory(presets::metadata_json(preset)))
            .ok_or(Error::NotFound)
    }

    pub(crate) fn readdir_dataset_presets(&self, dataset: &str) -> Result<Vec<DirEntry>> {
        let info = self
            .datasets
            .find(self.client.as_ref(), dataset)?
            .ok_or(Error::NotFound)?;
        let mut entries: Vec<DirEntry> = presets::presets_for_dataset(&info)
            .into_iter()
            .map(|preset| {
                DirEntry::new(
                    preset.filename(),
                    Node::PresetResultFile {
                        dataset: dataset.to_string(),
                        name: preset.name.to_string(),
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub(crate) fn lookup_dataset_preset(&self, dataset: &str, name: &str) -> Result<Node> {
        let info = self
            .datasets
            .find(self.client.as_ref(), dataset)?
            .ok_or(Error::NotFound)?;
        presets::presets_for_dataset(&info)
            .iter()
            .find(|preset| preset.filename() == name)
            .map(|preset| Node::PresetResultFile {
                dataset: dataset.to_string(),
                name: preset.name.to_string(),
            })
            .ok_or(Error::NotFound)
    }

    pub(crate) fn open_preset_result(&self, dataset: &str, name: &str) -> Result<ResultPayload> {
        let info = self
            .datasets
            .find(self.client.as_ref(), dataset)?
            .ok_or(Error::NotFound)?;
        let preset = presets::presets_for_dataset(&info)
            .into_iter()
            .find(|preset| preset.name == name)
            .ok_or(Error::NotFound)?;
        let apl = presets::render(&preset, dataset, &self.config.default_range);
        self.executor.execute(
            &apl,
            preset.format,
            ExecOptions {
                use_cache: true,
                ensure_time_range: true,
                ensure_row_cap: true,
            },
        )
    }
}
