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

use std::time::Duration;

use crate::novasink_config::config as novasink_app_config;

pub(crate) fn driver_time_slice() -> Duration {
    let ms = novasink_app_config()
        .ok()
        .map(|c| c.runtime.driver_time_slice_ms)
        .unwrap_or(100);
    Duration::from_millis(ms.max(1))
}

pub(crate) fn blocked_driver_wait() -> Duration {
    let ms = novasink_app_config()
        .ok()
        .map(|c| c.runtime.blocked_driver_wait_ms)
        .unwrap_or(10);
    Duration::from_millis(ms.max(1))
}

pub(crate) fn data_runtime_worker_threads() -> usize {
    novasink_app_config()
        .ok()
        .map(|c| c.runtime.actual_data_runtime_worker_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn data_runtime_max_blocking_threads() -> usize {
    novasink_app_config()
        .ok()
        .map(|c| c.runtime.data_runtime_max_blocking_threads)
        .unwrap_or(64)
}

pub(crate) fn memory_sink_send_latency() -> Option<Duration> {
    novasink_app_config()
        .ok()
        .map(|c| c.sink.memory_sink_send_latency_ms)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
