// SPDX-License-Identifier: Apache-2.0

//! Line-oriented offsets file.
//!
//! ```text
//! - file: <inode> <path>
//!   <stream>: <offset>
//!   <stream>: <offset>
//! - file: <inode> <path>
//!   <stream>: <offset>
//! ```
//!
//! Every source has at least one stream line. Anything else is corruption and
//! loading fails with an invariant violation.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::receivers::file::config::tmp_path_for;
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::input::SourceId;
use crate::receivers::file::persistence::{OffsetRecord, PersistedSource};

const HEADER_PREFIX: &str = "- file: ";
const STREAM_PREFIX: &str = "  ";

/// Loads and saves an [`OffsetRecord`] at a fixed path.
#[derive(Debug, Clone)]
pub struct OffsetFile {
    path: PathBuf,
}

impl OffsetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file loads as an empty record.
    pub fn load(&self) -> Result<OffsetRecord> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No offsets file, starting empty");
                return Ok(OffsetRecord::default());
            }
            Err(e) => return Err(Error::file_io(&self.path, e)),
        };

        let text = std::str::from_utf8(&bytes).map_err(|e| {
            Error::invariant(format!(
                "offsets file {:?} is not valid UTF-8: {}",
                self.path, e
            ))
        })?;
        parse_offsets(text).map_err(|e| match e {
            Error::InvariantViolation(msg) => {
                Error::invariant(format!("offsets file {:?}: {}", self.path, msg))
            }
            other => other,
        })
    }

    /// Atomically replace the offsets file with `record`.
    pub fn save(&self, record: &OffsetRecord) -> Result<()> {
        atomic_write(&self.path, render_offsets(record).as_bytes())
    }
}

/// Parse offsets file content. The error names the first malformed line.
pub fn parse_offsets(text: &str) -> Result<OffsetRecord> {
    let mut record = OffsetRecord::default();
    let mut current: Option<(SourceId, PersistedSource)> = None;

    for (idx, line) in text.split_terminator('\n').enumerate() {
        let lineno = idx + 1;
        if line.contains('\r') {
            return Err(malformed(lineno, "carriage return in line"));
        }

        if let Some(rest) = line.strip_prefix(HEADER_PREFIX) {
            if let Some((id, source)) = current.take() {
                finish_source(&mut record, id, source, lineno - 1)?;
            }
            let (id, path) = rest
                .split_once(' ')
                .ok_or_else(|| malformed(lineno, "expected '<inode> <path>' after '- file: '"))?;
            let id = id
                .parse::<SourceId>()
                .map_err(|e| malformed(lineno, &format!("bad inode {:?}: {}", id, e)))?;
            if path.is_empty() {
                return Err(malformed(lineno, "empty path"));
            }
            current = Some((
                id,
                PersistedSource {
                    path: PathBuf::from(path),
                    ..Default::default()
                },
            ));
            continue;
        }

        let Some(rest) = line.strip_prefix(STREAM_PREFIX) else {
            return Err(malformed(lineno, "expected '- file: ' or a stream line"));
        };
        let Some((_, source)) = current.as_mut() else {
            return Err(malformed(lineno, "stream line before any '- file: ' header"));
        };
        let (stream, offset) = rest
            .rsplit_once(": ")
            .ok_or_else(|| malformed(lineno, "expected '<stream>: <offset>'"))?;
        if !is_valid_stream_name(stream) {
            return Err(malformed(lineno, "stream lines must be indented by exactly two spaces"));
        }
        let offset = offset
            .parse::<i64>()
            .map_err(|e| malformed(lineno, &format!("bad offset {:?}: {}", offset, e)))?;
        if source.streams.insert(stream.to_string(), offset).is_some() {
            return Err(malformed(lineno, &format!("duplicate stream {:?}", stream)));
        }
    }

    if let Some((id, source)) = current.take() {
        finish_source(&mut record, id, source, text.split_terminator('\n').count())?;
    }
    Ok(record)
}

fn finish_source(
    record: &mut OffsetRecord,
    id: SourceId,
    source: PersistedSource,
    lineno: usize,
) -> Result<()> {
    if source.streams.is_empty() {
        return Err(malformed(lineno, &format!("source {} has no stream lines", id)));
    }
    if record.sources.contains_key(&id) {
        return Err(malformed(lineno, &format!("duplicate source {}", id)));
    }
    record.insert(id, source);
    Ok(())
}

/// Whether `name` survives a render/parse round trip as a stream name.
pub fn is_valid_stream_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with(' ') && !name.contains(['\n', '\r'])
}

fn malformed(lineno: usize, what: &str) -> Error {
    Error::invariant(format!("malformed line {}: {}", lineno, what))
}

/// Render a record. Sources without streams have nothing to resume from and
/// are left out, as are paths and stream names the line format cannot carry.
pub fn render_offsets(record: &OffsetRecord) -> String {
    let mut out = String::new();
    for (id, source) in &record.sources {
        let streams: Vec<(&String, &i64)> = source
            .streams
            .iter()
            .filter(|(stream, _)| {
                let ok = is_valid_stream_name(stream);
                if !ok {
                    warn!(source_id = %id, stream = ?stream, "Skipping unrepresentable stream in offsets file");
                }
                ok
            })
            .collect();
        if streams.is_empty() {
            continue;
        }
        let Some(path) = source.path.to_str() else {
            warn!(source_id = %id, path = ?source.path, "Skipping non UTF-8 path in offsets file");
            continue;
        };
        if path.is_empty() || path.contains('\n') || path.contains('\r') {
            warn!(source_id = %id, path = ?source.path, "Skipping unrepresentable path in offsets file");
            continue;
        }

        out.push_str(HEADER_PREFIX);
        out.push_str(&id.to_string());
        out.push(' ');
        out.push_str(path);
        out.push('\n');
        for (stream, offset) in streams {
            out.push_str(STREAM_PREFIX);
            out.push_str(stream);
            out.push_str(": ");
            out.push_str(&offset.to_string());
            out.push('\n');
        }
    }
    out
}

/// Write to `<path>.tmp`, fsync, rename over `path`, then fsync the directory
/// so the rename itself survives a crash.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
        }
    }

    let tmp_path = tmp_path_for(path);
    let file = File::create(&tmp_path).map_err(|e| Error::file_io(&tmp_path, e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(contents)
        .map_err(|e| Error::file_io(&tmp_path, e))?;
    writer.flush().map_err(|e| Error::file_io(&tmp_path, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::file_io(&tmp_path, e.into_error()))?;
    file.sync_all().map_err(|e| Error::file_io(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| Error::file_io(path, e))?;

    #[cfg(unix)]
    {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(dir = ?dir, error = %e, "Could not fsync offsets directory");
        }
    }

    Ok(())
}
