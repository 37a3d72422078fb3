// SPDX-License-Identifier: Apache-2.0

//! Persistence of committed offsets.
//!
//! Offsets live in a small line-oriented text file rewritten atomically on
//! every save (write to `<path>.tmp`, fsync, rename).

mod offset_file;
mod schema;
mod store;

pub use offset_file::{OffsetFile, is_valid_stream_name, parse_offsets, render_offsets};
pub use schema::{OffsetRecord, PersistedSource};
#[cfg(test)]
pub use store::MockPersister;
pub use store::{OffsetFilePersister, Persister};
