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

//! Execution status shared by operators, factories and drivers.
//!
//! Responsibilities:
//! - Classifies every failure the pipeline core can surface to its driver.
//! - Keeps cancellation distinguishable from real failures so it is never reported as one.
//!
//! Key exported interfaces:
//! - Types: `ExecError`, `ExecResult`.

use thiserror::Error;

/// Failure kinds surfaced by the operator and factory contracts.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Sink or resource setup failed (`prepare`, lazy open).
    #[error("initialization failed: {0}")]
    Initialization(String),
    /// A pushed chunk was rejected or an asynchronous send reported failure.
    #[error("forwarding failed: {0}")]
    Forwarding(String),
    /// Work was abandoned because the fragment was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Commit failed after every instance reported success.
    #[error("finalization failed: {0}")]
    Finalization(String),
    /// The operator contract was violated by the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ExecError::Initialization(msg)
            | ExecError::Forwarding(msg)
            | ExecError::Cancelled(msg)
            | ExecError::Finalization(msg)
            | ExecError::Internal(msg) => msg,
        }
    }
}
