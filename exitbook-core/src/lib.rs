// Copyright 2026 ExitBook contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
// SPDX-License-Identifier: Apache-2.0

//! Process wiring and the five external interfaces (spec §6) a CLI/TUI
//! collaborator calls to drive ingestion. Every other crate in this
//! workspace is a leaf component (rate limiter, circuit breaker, provider
//! manager, import service, processor, pricing pipeline); this crate is
//! the only one that knows how they compose into a running process —
//! settings, the process-wide provider registry, and the concrete source
//! adapters that plug into `exitbook-import`/`exitbook-processor`.

pub mod adapters;
pub mod interfaces;
pub mod pricing;
pub mod settings;
pub mod wiring;

pub use interfaces::{Interfaces, ProcessAllReport};
pub use settings::{CfSettings, CoreCommandLineOptions, CoreSettings};
pub use wiring::RuntimeContext;
