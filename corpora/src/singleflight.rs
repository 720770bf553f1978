//! Keyed in-flight call deduplication.
//!
//! At most one computation runs per key: the first caller computes,
//! concurrent callers for the same key block and receive the same
//! result. The result is broadcast to all waiters exactly once; once
//! every waiter has been served the key is forgotten, so a later call
//! computes afresh.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

struct Call<V> {
    result: Mutex<Option<V>>,
    done: Condvar,
}

/// A group of calls deduplicated by key.
pub struct Group<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Group<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key`, unless a call for the same key is already in
    /// flight, in which case wait for and return its result.
    pub fn run<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        let call = {
            let mut calls = self.calls.lock().unwrap();

            if let Some(call) = calls.get(&key) {
                let call = call.clone();
                drop(calls);

                let mut result = call.result.lock().unwrap();
                while result.is_none() {
                    result = call.done.wait(result).unwrap();
                }
                return result.clone().expect("singleflight: result is set");
            }
            let call = Arc::new(Call {
                result: Mutex::new(None),
                done: Condvar::new(),
            });
            calls.insert(key.clone(), call.clone());

            call
        };
        let value = f();

        *call.result.lock().unwrap() = Some(value.clone());
        call.done.notify_all();
        self.calls.lock().unwrap().remove(&key);

        value
    }
}
