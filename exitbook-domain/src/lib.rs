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

//! Canonical data model shared by every ingestion-core crate.
//!
//! Nothing in here talks to the network or to a database. Persistence and
//! transport crates depend on this crate, never the other way around.

pub mod account;
pub mod cursor;
pub mod error;
pub mod events;
pub mod link;
pub mod overrides;
pub mod price;
pub mod raw_transaction;
pub mod session;
pub mod transaction;

pub use account::{Account, AccountType};
pub use cursor::{format_since_date, parse_since_date, CursorState, CursorType, CursorValue};
pub use error::{ErrorDetails, IngestError};
pub use link::{LinkStatus, TransactionLink};
pub use overrides::OverrideEvent;
pub use price::{PriceAtTxTime, PriceGranularity, PriceSource};
pub use raw_transaction::{ProcessingStatus, RawTransaction};
pub use session::{ImportSession, SessionStatus};
pub use transaction::{Fee, FeeScope, FeeSettlement, Movement, Operation, Transaction};
