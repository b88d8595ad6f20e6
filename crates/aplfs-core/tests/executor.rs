mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use aplfs_core::cache::ByteCache;
use aplfs_core::compiler::Format;
use aplfs_core::error::Error;
use aplfs_core::query::{ExecOptions, Executor, ResultPayload};

use common::MockService;

fn executor_with(service: Arc<MockService>, max_in_memory: usize) -> Executor {
    let cache = Arc::new(ByteCache::new(Duration::from_secs(60), 0, 0, None));
    Executor::new(
        service,
        cache,
        "1h".to_string(),
        10_000,
        0,
        max_in_memory,
        None,
    )
}

const CACHED: ExecOptions = ExecOptions {
    use_cache: true,
    ensure_time_range: false,
    ensure_row_cap: false,
};

#[test]
fn concurrent_identical_requests_hit_upstream_once() {
    let service = Arc::new(MockService {
        delay: Duration::from_millis(50),
        ..MockService::default()
    });
    let executor = Arc::new(executor_with(Arc::clone(&service), 1 << 20));
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let executor = Arc::clone(&executor);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                executor
                    .execute("['logs']\n| take 5", Format::Csv, CACHED)
                    .unwrap()
                    .to_bytes()
                    .unwrap()
            })
        })
        .collect();

    let payloads: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(service.calls(), 1);
    assert!(payloads.windows(2).all(|pair| pair[0] == pair[1]));

    // A later reader is served from cache without a new upstream call.
    let again = executor
        .execute("['logs']\n| take 5", Format::Csv, CACHED)
        .unwrap()
        .to_bytes()
        .unwrap();
    assert_eq!(service.calls(), 1);
    assert_eq!(again, payloads[0]);
}

#[test]
fn cache_bypass_reaches_upstream_every_time() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 1 << 20);
    let opts = ExecOptions::default();
    executor.execute("['logs']", Format::Ndjson, opts).unwrap();
    executor.execute("['logs']", Format::Ndjson, opts).unwrap();
    assert_eq!(service.calls(), 2);
}

#[test]
fn distinct_formats_have_distinct_fingerprints() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 1 << 20);
    executor.execute("['logs']", Format::Csv, CACHED).unwrap();
    executor.execute("['logs']", Format::Json, CACHED).unwrap();
    assert_eq!(service.calls(), 2);
}

#[test]
fn waiters_observe_the_leaders_error() {
    let service = Arc::new(MockService {
        delay: Duration::from_millis(50),
        ..MockService::default()
    });
    service.fail_next_with(Error::Upstream("boom".to_string()));
    let executor = Arc::new(executor_with(Arc::clone(&service), 1 << 20));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let executor = Arc::clone(&executor);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                executor.execute("['logs']", Format::Csv, CACHED)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(service.calls(), 1);
    for result in results {
        match result {
            Err(Error::Upstream(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected upstream error, got {:?}", other.map(|p| p.len())),
        }
    }
}

#[test]
fn errors_are_not_cached() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 1 << 20);
    service.fail_next_with(Error::Upstream("transient".to_string()));
    assert!(executor.execute("['logs']", Format::Csv, CACHED).is_err());
    // Next call succeeds and reaches upstream.
    executor.execute("['logs']", Format::Csv, CACHED).unwrap();
    assert_eq!(service.calls(), 2);
}

#[test]
fn oversize_results_spill_to_disk() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 8);

    let payload = executor.execute("['logs']", Format::Csv, CACHED).unwrap();
    assert!(matches!(payload, ResultPayload::Spilled(_)));

    let expected = b"service,count\napi,12\nweb,7\n";
    assert_eq!(payload.len(), expected.len() as u64);
    assert_eq!(payload.to_bytes().unwrap().as_slice(), expected);

    // Partial read from the file-backed payload.
    let mut buf = [0u8; 5];
    let n = payload.read_at(&mut buf, 8).unwrap();
    assert_eq!(&buf[..n], b"count");
}

#[test]
fn spilled_results_are_not_cached() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 8);
    executor.execute("['logs']", Format::Csv, CACHED).unwrap();
    executor.execute("['logs']", Format::Csv, CACHED).unwrap();
    assert_eq!(service.calls(), 2);
}

#[test]
fn default_injection_applies_before_fingerprint() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 1 << 20);
    let opts = ExecOptions {
        use_cache: true,
        ensure_time_range: true,
        ensure_row_cap: true,
    };
    executor.execute("['logs']", Format::Ndjson, opts).unwrap();
    let sent = service.last_apl();
    assert!(sent.contains("where _time between (ago(1h) .. now())"));
    assert!(sent.ends_with("| take 10000"));

    // Same raw input again: the injected form is the cache key, so this hits.
    executor.execute("['logs']", Format::Ndjson, opts).unwrap();
    assert_eq!(service.calls(), 1);
}

#[test]
fn existing_bounds_suppress_injection() {
    let service = Arc::new(MockService::default());
    let executor = executor_with(Arc::clone(&service), 1 << 20);
    let opts = ExecOptions {
        use_cache: false,
        ensure_time_range: true,
        ensure_row_cap: true,
    };
    let apl = "['logs']\n| where _time between (ago(6h) .. now())\n| take 3";
    executor.execute(apl, Format::Ndjson, opts).unwrap();
    assert_eq!(service.last_apl(), apl);
}
