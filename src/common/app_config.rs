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

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaSinkConfig> = OnceLock::new();

const CONFIG_ENV: &str = "NOVASINK_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "novasink.toml";

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaSinkConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = NovaSinkConfig::load_from_file(path.as_ref())?;
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn init_from_env_or_default() -> Result<&'static NovaSinkConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = NovaSinkConfig::load_from_file(&path)?;
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn config() -> Result<&'static NovaSinkConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(CONFIG_ENV)
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p.trim()));
    }

    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    if fallback.exists() {
        return Ok(fallback);
    }

    Err(anyhow!(
        "missing config file: set ${CONFIG_ENV} or create ./{DEFAULT_CONFIG_FILE}"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaSinkConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novasink=debug,tokio=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

impl NovaSinkConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: NovaSinkConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(self.log_level.as_str())
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.driver_time_slice_ms == 0 {
            return Err(anyhow!("runtime.driver_time_slice_ms must be positive"));
        }
        Ok(())
    }
}

impl Default for NovaSinkConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound of one driver poll quantum.
    #[serde(default = "default_driver_time_slice_ms")]
    pub driver_time_slice_ms: u64,
    /// How long a blocked driver thread parks before re-polling without a wake-up.
    #[serde(default = "default_blocked_driver_wait_ms")]
    pub blocked_driver_wait_ms: u64,
    /// 0 means "use available parallelism".
    #[serde(default)]
    pub data_runtime_worker_threads: usize,
    #[serde(default = "default_data_runtime_max_blocking_threads")]
    pub data_runtime_max_blocking_threads: usize,
}

fn default_driver_time_slice_ms() -> u64 {
    100
}
fn default_blocked_driver_wait_ms() -> u64 {
    10
}
fn default_data_runtime_max_blocking_threads() -> usize {
    64
}

impl RuntimeConfig {
    pub fn actual_data_runtime_worker_threads(&self) -> usize {
        if self.data_runtime_worker_threads > 0 {
            return self.data_runtime_worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            driver_time_slice_ms: default_driver_time_slice_ms(),
            blocked_driver_wait_ms: default_blocked_driver_wait_ms(),
            data_runtime_worker_threads: 0,
            data_runtime_max_blocking_threads: default_data_runtime_max_blocking_threads(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SinkConfig {
    /// Simulated replication latency of the in-memory sink; 0 completes sends inline.
    #[serde(default)]
    pub memory_sink_send_latency_ms: u64,
}
