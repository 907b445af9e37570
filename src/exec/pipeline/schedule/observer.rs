// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Observable primitives for scheduling events.
//!
//! Responsibilities:
//! - Provides callback registration and deferred notification helpers for readiness changes.
//! - Used by sinks (send completion) and fragment contexts (cancellation) to wake parked drivers.
//!
//! Key exported interfaces:
//! - Types: `Observer`, `Observable`, `DeferNotify`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::novasink_logging::debug;

static NOTIFY_COUNT: AtomicU64 = AtomicU64::new(0);

const NOTIFY_LOG_EVERY: u64 = 1024;

/// Callback type invoked when observable scheduling events are triggered.
pub type Observer = Arc<dyn Fn() + Send + Sync + 'static>;

/// Observable helper that stores and notifies subscribed callbacks.
pub struct Observable {
    observers: Mutex<Vec<Observer>>,
}

impl Default for Observable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("observers", &self.num_observers())
            .finish()
    }
}

impl Observable {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Observer) {
        let mut guard = self.observers.lock().expect("observable lock");
        guard.push(observer);
    }

    // Create a deferred notifier that triggers on drop if armed.
    pub fn defer_notify(self: &Arc<Self>) -> DeferNotify {
        DeferNotify::new(Arc::clone(self))
    }

    pub fn notify_observers(&self) {
        // Callbacks run outside the lock so they may register further observers.
        let observers = {
            let guard = self.observers.lock().expect("observable lock");
            guard.clone()
        };
        let notify_count = NOTIFY_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if notify_count % NOTIFY_LOG_EVERY == 0 {
            debug!(
                "Observable notify: count={} observers={}",
                notify_count,
                observers.len()
            );
        }
        for observer in observers {
            observer();
        }
    }

    pub fn num_observers(&self) -> usize {
        let guard = self.observers.lock().expect("observable lock");
        guard.len()
    }
}

/// RAII helper that defers observable notification until scope exit.
///
/// Call `arm()` after the state change is committed; the notification fires on drop,
/// after any locks taken in the same scope were released.
#[must_use]
pub struct DeferNotify {
    observable: Arc<Observable>,
    armed: AtomicBool,
}

impl DeferNotify {
    pub fn new(observable: Arc<Observable>) -> Self {
        Self {
            observable,
            armed: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

impl Drop for DeferNotify {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            self.observable.notify_observers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_observable() -> (Arc<Observable>, Arc<AtomicUsize>) {
        let observable = Arc::new(Observable::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        observable.add_observer(Arc::new(move || {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        }));
        (observable, hits)
    }

    #[test]
    fn notify_reaches_every_observer() {
        let (observable, hits) = counting_observable();
        let second = Arc::clone(&hits);
        observable.add_observer(Arc::new(move || {
            second.fetch_add(10, Ordering::SeqCst);
        }));
        observable.notify_observers();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(observable.num_observers(), 2);
    }

    #[test]
    fn defer_notify_fires_only_when_armed() {
        let (observable, hits) = counting_observable();
        {
            let _unarmed = observable.defer_notify();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        {
            let notify = observable.defer_notify();
            notify.arm();
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
