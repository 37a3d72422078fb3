// SPDX-License-Identifier: Apache-2.0

pub mod source_id;

pub use source_id::{SourceId, get_path_from_file};
