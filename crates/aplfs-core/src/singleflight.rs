//! At-most-one concurrent computation per key.
//!
//! The first caller for a key becomes the leader and runs the closure; all
//! callers that arrive while it is in flight block and receive a clone of the
//! leader's value. Once the leader publishes, the key is retired so a later
//! caller starts a fresh computation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub struct Group<T: Clone> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

struct Call<T> {
    slot: Mutex<Option<T>>,
    done: Condvar,
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn run<F>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(call) => (Arc::clone(call), false),
                None => {
                    let call = Arc::new(Call {
                        slot: Mutex::new(None),
                        done: Condvar::new(),
                    });
                    calls.insert(key.to_string(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if leader {
            let value = f();
            *call.slot.lock() = Some(value.clone());
            // Retire the key before waking waiters; anyone arriving now
            // starts a new flight instead of reading a stale slot.
            self.calls.lock().remove(key);
            call.done.notify_all();
            value
        } else {
            let mut slot = call.slot.lock();
            loop {
                if let Some(value) = slot.as_ref() {
                    return value.clone();
                }
                call.done.wait(&mut slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn leader_runs_once() {
        let group = Arc::new(Group::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    group.run("key", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        42u32
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keys_are_independent() {
        let group = Group::new();
        assert_eq!(group.run("a", || 1), 1);
        assert_eq!(group.run("b", || 2), 2);
    }

    #[test]
    fn retired_key_runs_again() {
        let group = Group::new();
        assert_eq!(group.run("k", || 1), 1);
        assert_eq!(group.run("k", || 2), 2);
    }
}
