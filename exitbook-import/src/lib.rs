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

//! Import orchestrator and import service (spec §4.7).
//!
//! The orchestrator resolves which accounts an import touches (creating
//! them on first sight, fanning an xpub out to its derived children); the
//! service runs the at-least-once-with-idempotent-dedup protocol for one
//! account and one operation. `exitbook-core` composes the two for each
//! external interface in spec §6.

pub mod orchestrator;
pub mod service;

pub use orchestrator::{AddressActivityProbe, Orchestrator, XpubDeriver};
pub use service::{ImportOutcome, ImportService, RawTransactionMapper};
