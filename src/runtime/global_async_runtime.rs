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

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

use crate::common::config::{data_runtime_max_blocking_threads, data_runtime_worker_threads};
use crate::common::status::{ExecError, ExecResult};
use crate::novasink_logging::info;

const DATA_RUNTIME_THREAD_NAME: &str = "novasink-data-runtime";
static DATA_RUNTIME: OnceLock<Result<Arc<Runtime>, String>> = OnceLock::new();

/// Process-wide runtime for sink I/O. Driver threads only spawn onto it, never block on it.
pub fn data_runtime() -> ExecResult<&'static Arc<Runtime>> {
    match DATA_RUNTIME.get_or_init(|| {
        let worker_threads = data_runtime_worker_threads().max(1);
        let max_blocking_threads = data_runtime_max_blocking_threads().max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(worker_threads)
            .max_blocking_threads(max_blocking_threads)
            .thread_name(DATA_RUNTIME_THREAD_NAME)
            .build()
            .map_err(|e| format!("init data tokio runtime failed: {e}"))?;
        info!(
            worker_threads,
            max_blocking_threads,
            thread_name = DATA_RUNTIME_THREAD_NAME,
            "global data runtime initialized"
        );
        Ok(Arc::new(runtime))
    }) {
        Ok(runtime) => Ok(runtime),
        Err(err) => Err(ExecError::Initialization(err.clone())),
    }
}

pub fn data_runtime_handle() -> ExecResult<Handle> {
    let runtime = data_runtime()?;
    Ok(runtime.handle().clone())
}

pub fn spawn_on_data_runtime<F>(future: F) -> ExecResult<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let runtime = data_runtime()?;
    Ok(runtime.spawn(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn data_runtime_is_singleton_across_threads() {
        let expected_ptr = Arc::as_ptr(data_runtime().expect("get data runtime")) as usize;
        let handles = (0..8)
            .map(|_| {
                thread::spawn(move || {
                    for _ in 0..32 {
                        let ptr = Arc::as_ptr(data_runtime().expect("get data runtime")) as usize;
                        assert_eq!(ptr, expected_ptr);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join runtime singleton checker");
        }
    }

    #[test]
    fn spawned_task_runs_without_blocking_caller() {
        let (tx, rx) = mpsc::channel();
        spawn_on_data_runtime(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx.send(42_u32).expect("send result");
        })
        .expect("spawn on data runtime");
        let value = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task completes");
        assert_eq!(value, 42);
    }
}
