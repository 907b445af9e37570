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

//! Table sink contract shared by every parallel sink operator instance.
//!
//! Responsibilities:
//! - Defines the writer lifecycle: `init` once, `open` once, per-sender non-blocking
//!   `send` with pollable completion and one `finish_sender`, then exactly one `commit`
//!   or `abort`.
//! - Defines writer-level errors; operators map them into `ExecError` at the call site.
//!
//! Key exported interfaces:
//! - Types: `TableSink`, `SendState`, `SinkError`, `MemoryTableSink`.
//!
//! A sink is held as `Arc<dyn TableSink>` by one factory and called from many driver
//! threads concurrently, one sender id per operator instance. Only one send per sender
//! may be in flight at a time.

pub mod memory;

use std::sync::Arc;

use thiserror::Error;

use crate::exec::chunk::Chunk;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::runtime_state::RuntimeState;

pub use memory::{MemorySinkStats, MemoryTableSink, MemoryTableSinkBuilder, SendCompletion};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink is not open")]
    NotOpen,
    #[error("chunk schema does not match destination: {0}")]
    SchemaMismatch(String),
    #[error("chunk rejected: {0}")]
    Rejected(String),
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    #[error("sink already committed or aborted")]
    Finalized,
    #[error("sender {0} already has a send in flight")]
    SendInFlight(i32),
    #[error("sender {0} already finished")]
    SenderFinished(i32),
}

/// Completion state of the latest send issued by one sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendState {
    /// Nothing outstanding; the previous send (if any) landed or was cancelled.
    Idle,
    InFlight,
    /// The previous send failed asynchronously. Sticky until the sink is finalized.
    Failed(SinkError),
}

impl SendState {
    pub fn is_send_complete(&self) -> bool {
        !matches!(self, SendState::InFlight)
    }
}

/// Writer abstraction for one destination table.
///
/// `abort` must be safe while sends are still in flight; sends landing after finalize
/// are discarded.
pub trait TableSink: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves destination schema and partitions. Called once before any instance runs.
    fn init(&self, state: &RuntimeState) -> Result<(), SinkError>;

    fn open(&self, state: &RuntimeState) -> Result<(), SinkError>;

    /// Starts forwarding `chunk` for `sender` and returns without waiting for it to land.
    fn send(&self, sender: i32, chunk: Chunk) -> Result<(), SinkError>;

    /// Tells the sink that `sender` will issue no further sends. Does not wait for the
    /// sender's outstanding send.
    fn finish_sender(&self, sender: i32) -> Result<(), SinkError>;

    fn poll_send(&self, sender: i32) -> SendState;

    /// Abandons the sender's outstanding send without blocking; completion shows up
    /// through `poll_send`.
    fn cancel_send(&self, sender: i32);

    fn commit(&self, state: &RuntimeState) -> Result<(), SinkError>;

    fn abort(&self, state: &RuntimeState) -> Result<(), SinkError>;

    /// Notified whenever a send completes, fails, or is cancelled.
    fn observable(&self) -> Option<Arc<Observable>> {
        None
    }
}
