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

//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tempfile::TempDir;

use novasink::common::types::UniqueId;
use novasink::exec::chunk::Chunk;
use novasink::exec::pipeline::driver::{ChunkSource, VecChunkSource};
use novasink::runtime::runtime_state::RuntimeState;
use novasink::{FragmentContext, novasink_config};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novasink.toml");

        let config_content = r#"
log_level = "warn"

[runtime]
driver_time_slice_ms = 20
blocked_driver_wait_ms = 5
data_runtime_worker_threads = 2

[sink]
memory_sink_send_latency_ms = 1
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Installs this file as the process config (first caller wins).
    pub fn install(&self) -> anyhow::Result<&'static novasink_config::NovaSinkConfig> {
        novasink_config::init_from_path(&self.config_path)
    }
}

pub fn test_fragment_instance_id(lo: i64) -> UniqueId {
    UniqueId::new(0x6e6f_7661, lo)
}

pub fn new_fragment_ctx(lo: i64) -> Arc<FragmentContext> {
    let state = RuntimeState::new(test_fragment_instance_id(lo));
    Arc::new(FragmentContext::new(Arc::new(state)))
}

pub fn row_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

/// One chunk with ids `start..start + rows`.
pub fn row_chunk(start: i32, rows: i32) -> Chunk {
    let ids = (start..start + rows).collect::<Vec<_>>();
    let names = ids.iter().map(|id| format!("row-{id}")).collect::<Vec<_>>();
    let batch = RecordBatch::try_new(
        row_schema(),
        vec![
            Arc::new(Int32Array::from(ids)),
            Arc::new(StringArray::from(names)),
        ],
    )
    .expect("record batch");
    Chunk::new(batch)
}

/// `dop` sources, each replaying `chunks_each` chunks of `rows` rows with disjoint ids.
pub fn row_sources(dop: usize, chunks_each: usize, rows: i32) -> Vec<Box<dyn ChunkSource>> {
    (0..dop)
        .map(|d| {
            let chunks = (0..chunks_each)
                .map(|c| row_chunk(((d * chunks_each + c) as i32) * rows, rows))
                .collect::<Vec<_>>();
            Box::new(VecChunkSource::new(chunks)) as Box<dyn ChunkSource>
        })
        .collect()
}
