//! TTL caches for dataset and field listings.
//!
//! Both catalogs share the same design: a reader-writer lock over the cached
//! state, a single-flight group so at most one upstream refill is in flight
//! per key, and an optional JSON snapshot on disk that seeds a cold start
//! while its mtime is within the TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use tracing::warn;

use crate::client::{Dataset, Field, QueryService};
use crate::error::Result;
use crate::singleflight::Group;

pub struct DatasetCatalog {
    state: RwLock<DatasetState>,
    ttl: Duration,
    dir: Option<PathBuf>,
    flight: Group<Result<Vec<Dataset>>>,
}

#[derive(Default)]
struct DatasetState {
    fetched: Option<Instant>,
    datasets: Vec<Dataset>,
}

impl DatasetCatalog {
    pub fn new(ttl: Duration, dir: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(DatasetState::default()),
            ttl,
            dir,
            flight: Group::new(),
        }
    }

    pub fn list(&self, client: &dyn QueryService) -> Result<Vec<Dataset>> {
        {
            let state = self.state.read();
            if let Some(fetched) = state.fetched {
                if fetched.elapsed() < self.ttl && !state.datasets.is_empty() {
                    return Ok(state.datasets.clone());
                }
            }
        }

        if let Some(datasets) = self.load_disk() {
            let mut state = self.state.write();
            state.datasets = datasets.clone();
            state.fetched = Some(Instant::now());
            return Ok(datasets);
        }

        self.flight.run("datasets", || {
            let datasets = client.list_datasets()?;
            {
                let mut state = self.state.write();
                state.datasets = datasets.clone();
                state.fetched = Some(Instant::now());
            }
            self.save_disk(&datasets);
            Ok(datasets)
        })
    }

    pub fn find(&self, client: &dyn QueryService, name: &str) -> Result<Option<Dataset>> {
        let datasets = self.list(client)?;
        Ok(datasets.into_iter().find(|dataset| dataset.name == name))
    }

    fn disk_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join("datasets.json"))
    }

    fn load_disk(&self) -> Option<Vec<Dataset>> {
        let path = self.disk_path()?;
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        if snapshot_stale(modified, self.ttl) {
            return None;
        }
        let data = std::fs::read(&path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn save_disk(&self, datasets: &[Dataset]) {
        let Some(path) = self.disk_path() else { return };
        let result = serde_json::to_vec(datasets)
            .map_err(std::io::Error::other)
            .and_then(|data| std::fs::write(&path, data));
        if let Err(err) = result {
            warn!(%err, "failed to snapshot dataset catalog");
        }
    }
}

pub struct FieldCatalog {
    state: RwLock<HashMap<String, FieldEntry>>,
    ttl: Duration,
    dir: Option<PathBuf>,
    flight: Group<Result<Vec<Field>>>,
}

struct FieldEntry {
    fetched: Instant,
    fields: Vec<Field>,
}

impl FieldCatalog {
    pub fn new(ttl: Duration, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &dir {
            if let Err(err) = std::fs::create_dir_all(dir.join("fields")) {
                warn!(%err, "failed to create field snapshot dir");
            }
        }
        Self {
            state: RwLock::new(HashMap::new()),
            ttl,
            dir,
            flight: Group::new(),
        }
    }

    pub fn list(&self, client: &dyn QueryService, dataset: &str) -> Result<Vec<Field>> {
        {
            let state = self.state.read();
            if let Some(entry) = state.get(dataset) {
                if entry.fetched.elapsed() < self.ttl {
                    return Ok(entry.fields.clone());
                }
            }
        }

        if let Some(fields) = self.load_disk(dataset) {
            self.state.write().insert(
                dataset.to_string(),
                FieldEntry {
                    fetched: Instant::now(),
                    fields: fields.clone(),
                },
            );
            return Ok(fields);
        }

        self.flight.run(&format!("fields:{dataset}"), || {
            let fields = client.list_fields(dataset)?;
            self.state.write().insert(
                dataset.to_string(),
                FieldEntry {
                    fetched: Instant::now(),
                    fields: fields.clone(),
                },
            );
            self.save_disk(dataset, &fields);
            Ok(fields)
        })
    }

    pub fn find(
        &self,
        client: &dyn QueryService,
        dataset: &str,
        name: &str,
    ) -> Result<Option<Field>> {
        let fields = self.list(client, dataset)?;
        Ok(fields.into_iter().find(|field| field.name == name))
    }

    fn disk_path(&self, dataset: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join("fields").join(format!("{dataset}.json")))
    }

    fn load_disk(&self, dataset: &str) -> Option<Vec<Field>> {
        let path = self.disk_path(dataset)?;
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        if snapshot_stale(modified, self.ttl) {
            return None;
        }
        let data = std::fs::read(&path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn save_disk(&self, dataset: &str, fields: &[Field]) {
        let Some(path) = self.disk_path(dataset) else { return };
        let result = serde_json::to_vec(fields)
            .map_err(std::io::Error::other)
            .and_then(|data| std::fs::write(&path, data));
        if let Err(err) = result {
            warn!(dataset, %err, "failed to snapshot field catalog");
        }
    }
}

fn snapshot_stale(modified: SystemTime, ttl: Duration) -> bool {
    match modified.elapsed() {
        Ok(age) => age > ttl,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::client::{QueryResult, User};
    use crate::error::Error;

    struct CountingService {
        dataset_calls: AtomicUsize,
        field_calls: AtomicUsize,
    }

    impl CountingService {
        fn new() -> Self {
            Self {
                dataset_calls: AtomicUsize::new(0),
                field_calls: AtomicUsize::new(0),
            }
        }
    }

    impl QueryService for CountingService {
        fn current_user(&self) -> Result<User> {
            Ok(User::default())
        }

        fn list_datasets(&self) -> Result<Vec<Dataset>> {
            self.dataset_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Dataset {
                name: "logs".to_string(),
                ..Dataset::default()
            }])
        }

        fn list_fields(&self, _dataset: &str) -> Result<Vec<Field>> {
            self.field_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Field {
                name: "status".to_string(),
                ty: "integer".to_string(),
                ..Field::default()
            }])
        }

        fn query_apl(&self, _apl: &str) -> Result<QueryResult> {
            Err(Error::Upstream("not used".to_string()))
        }
    }

    #[test]
    fn dataset_list_is_cached_within_ttl() {
        let service = CountingService::new();
        let catalog = DatasetCatalog::new(Duration::from_secs(60), None);
        catalog.list(&service).unwrap();
        catalog.list(&service).unwrap();
        assert_eq!(service.dataset_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dataset_snapshot_seeds_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let service = CountingService::new();

        let catalog = DatasetCatalog::new(Duration::from_secs(60), Some(dir.path().to_path_buf()));
        catalog.list(&service).unwrap();
        assert_eq!(service.dataset_calls.load(Ordering::SeqCst), 1);

        let cold = DatasetCatalog::new(Duration::from_secs(60), Some(dir.path().to_path_buf()));
        let datasets = cold.list(&service).unwrap();
        assert_eq!(datasets[0].name, "logs");
        // Seeded from disk, no new upstream call.
        assert_eq!(service.dataset_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn field_lists_are_cached_per_dataset() {
        let service = CountingService::new();
        let catalog = FieldCatalog::new(Duration::from_secs(60), None);
        catalog.list(&service, "logs").unwrap();
        catalog.list(&service, "logs").unwrap();
        catalog.list(&service, "events").unwrap();
        assert_eq!(service.field_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn field_find_matches_exact_name() {
        let service = CountingService::new();
        let catalog = FieldCatalog::new(Duration::from_secs(60), None);
        assert!(catalog.find(&service, "logs", "status").unwrap().is_some());
        assert!(catalog.find(&service, "logs", "missing").unwrap().is_none());
    }

    #[test]
    fn concurrent_refills_deduplicate() {
        let service = Arc::new(CountingService::new());
        let catalog = Arc::new(DatasetCatalog::new(Duration::from_secs(60), None));
        let barrier = Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                let catalog = Arc::clone(&catalog);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    catalog.list(service.as_ref()).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(service.dataset_calls.load(Ordering::SeqCst) <= 2);
    }
}
