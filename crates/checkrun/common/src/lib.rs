// Checkrun
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Shared data model for the checkrun analysis orchestrator.
//!
//! Everything here is plain data: quotas, build actions, findings, rule
//! tasks, configuration and progress records. The execution machinery
//! lives in `checkrun-core`.

pub mod build;
pub mod checker;
pub mod config;
pub mod finding;
pub mod progress;
pub mod quota;
pub mod rule;

pub use build::*;
pub use checker::*;
pub use config::*;
pub use finding::*;
pub use progress::*;
pub use quota::*;
pub use rule::*;
