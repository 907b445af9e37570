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

//! Operator factory trait definitions.
//!
//! Responsibilities:
//! - Defines factory contracts used to instantiate one operator per driver.
//! - Separates plan-time operator configuration and shared resources from runtime instances.
//!
//! Key exported interfaces:
//! - Types: `OperatorFactory`.

use super::operator::Operator;
use crate::common::status::ExecResult;
use crate::runtime::runtime_state::RuntimeState;

/// Factory contract for constructing runtime operators from plan-time configuration.
///
/// Call order: `prepare` once, `create` for every driver sequence, then `close` once after
/// all drivers have closed their instances.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn plan_node_id(&self) -> i32;

    /// Factory-wide setup; happens-before any instance `prepare`.
    fn prepare(&self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    fn create(&self, dop: i32, driver_sequence: i32) -> ExecResult<Box<dyn Operator>>;

    /// Factory-wide teardown. Idempotent.
    fn close(&self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }
}
