//! Shared test double for the upstream query service.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use aplfs_core::client::{Dataset, Field, QueryResult, QueryService, Table, TableField, User};
use aplfs_core::error::{Error, Result};

pub struct MockService {
    pub datasets: Vec<Dataset>,
    pub fields: Vec<Field>,
    pub query_calls: AtomicUsize,
    pub seen_apl: Mutex<Vec<String>>,
    /// Simulated upstream latency for dedup tests.
    pub delay: Duration,
    pub fail_with: Mutex<Option<Error>>,
}

pub fn dataset(name: &str, kind: &str) -> Dataset {
    Dataset {
        name: name.to_string(),
        kind: kind.to_string(),
        ..Dataset::default()
    }
}

pub fn field(name: &str, ty: &str, hidden: bool) -> Field {
    Field {
        name: name.to_string(),
        ty: ty.to_string(),
        hidden,
        ..Field::default()
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self {
            datasets: vec![dataset("logs", ""), dataset("stripe-events", "")],
            fields: vec![
                field("status", "integer", false),
                field("service", "string", false),
                field("_sysTime", "datetime", true),
            ],
            query_calls: AtomicUsize::new(0),
            seen_apl: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail_with: Mutex::new(None),
        }
    }
}

impl MockService {
    pub fn calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn last_apl(&self) -> String {
        self.seen_apl.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn fail_next_with(&self, err: Error) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn sample_result() -> QueryResult {
        QueryResult {
            tables: vec![Table {
                name: "0".to_string(),
                fields: vec![
                    TableField {
                        name: "service".to_string(),
                        ty: "string".to_string(),
                        ..TableField::default()
                    },
                    TableField {
                        name: "count".to_string(),
                        ty: "integer".to_string(),
                        ..TableField::default()
                    },
                ],
                columns: vec![
                    vec!["api".into(), "web".into()],
                    vec![12.into(), 7.into()],
                ],
            }],
            ..QueryResult::default()
        }
    }
}

impl QueryService for MockService {
    fn current_user(&self) -> Result<User> {
        Ok(User {
            id: "u1".to_string(),
            name: "tester".to_string(),
            email: "tester@example.com".to_string(),
        })
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.datasets.clone())
    }

    fn list_fields(&self, _dataset: &str) -> Result<Vec<Field>> {
        Ok(self.fields.clone())
    }

    fn query_apl(&self, apl: &str) -> Result<QueryResult> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_apl.lock().unwrap().push(apl.to_string());
        if self.delay > Duration::ZERO {
            std::thread::sleep(self.delay);
        }
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        Ok(Self::sample_result())
    }
}
