// SPDX-License-Identifier: Apache-2.0

use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;

use crate::receivers::get_meter;

/// Counters shared by the registry and the worker lanes.
pub struct ReceiverMetrics {
    files_discovered: Counter<u64>,
    records_read: Counter<u64>,
    bytes_read: Counter<u64>,
    jobs_removed: Counter<u64>,
    tags: [KeyValue; 1],
}

impl ReceiverMetrics {
    pub fn new() -> Self {
        let meter = get_meter();
        Self {
            files_discovered: meter
                .u64_counter("logtrail_files_discovered")
                .with_description("Number of files that started being tailed.")
                .with_unit("files")
                .build(),
            records_read: meter
                .u64_counter("logtrail_records_read")
                .with_description("Number of records handed to the sink.")
                .with_unit("records")
                .build(),
            bytes_read: meter
                .u64_counter("logtrail_bytes_read")
                .with_description("Number of bytes consumed from tailed files.")
                .with_unit("bytes")
                .build(),
            jobs_removed: meter
                .u64_counter("logtrail_jobs_removed")
                .with_description("Number of jobs dropped after their file disappeared.")
                .with_unit("files")
                .build(),
            tags: [KeyValue::new("receiver", "file")],
        }
    }

    pub fn file_discovered(&self) {
        self.files_discovered.add(1, &self.tags);
    }

    pub fn record_read(&self, bytes: u64) {
        self.records_read.add(1, &self.tags);
        self.bytes_read.add(bytes, &self.tags);
    }

    pub fn job_removed(&self) {
        self.jobs_removed.add(1, &self.tags);
    }
}

impl Default for ReceiverMetrics {
    fn default() -> Self {
        Self::new()
    }
}
