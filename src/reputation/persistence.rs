//! Reputation snapshot file format.
//!
//! ```text
//! repeat: [0x01] [Endpoint(26)] [LastFail(4, BE)] [LastSuccess(4, BE)] [LastNetwork(4, BE)] [LastAttempt(4, BE)]
//! end:    [0x00]
//! ```
//! Endpoints use the untimestamped wire encoding. Records are written best
//! first and truncated to the configured maximum. Files are written to a
//! sibling temporary file and renamed into place.

use crate::core::endpoint::{AddrContext, Endpoint, ENDPOINT_LEN};
use crate::error::{ProtocolError, Result};
use crate::reputation::record::ReputationRecord;
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const RECORD_MARKER: u8 = 0x01;
pub const END_MARKER: u8 = 0x00;

/// Encoded size of one record including its marker
pub const RECORD_LEN: usize = 1 + ENDPOINT_LEN + 16;

/// Sort best first and keep at most `max_records`
pub fn rank(records: &mut Vec<ReputationRecord>, max_records: usize, fail_timeout: u32) {
    records.sort_unstable_by(|a, b| a.priority_cmp(b, fail_timeout));
    records.truncate(max_records);
}

/// Encode already-ranked records
pub fn encode(records: &[ReputationRecord]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(records.len() * RECORD_LEN + 1);
    for record in records {
        buf.put_u8(RECORD_MARKER);
        record.endpoint.encode(0, AddrContext::Network, &mut buf);
        buf.put_u32(record.last_fail);
        buf.put_u32(record.last_success);
        buf.put_u32(record.last_network);
        buf.put_u32(record.last_attempt);
    }
    buf.put_u8(END_MARKER);
    buf
}

/// Decode a snapshot.
///
/// Stops at the end marker. A trailing partial record is dropped with a
/// warning; any other marker byte is an error.
pub fn decode(mut src: &[u8]) -> Result<Vec<ReputationRecord>> {
    let mut records = Vec::new();
    while src.has_remaining() {
        match src.get_u8() {
            END_MARKER => return Ok(records),
            RECORD_MARKER => {}
            other => {
                return Err(ProtocolError::Persistence(format!(
                    "Unexpected record marker {other:#04x} after {} records",
                    records.len()
                )))
            }
        }
        if src.remaining() < RECORD_LEN - 1 {
            warn!(
                records = records.len(),
                "Snapshot ends with a partial record, ignoring it"
            );
            return Ok(records);
        }
        let endpoint = Endpoint::decode(&mut src, 0, AddrContext::Network)?;
        let last_fail = src.get_u32();
        let last_success = src.get_u32();
        let last_network = src.get_u32();
        let last_attempt = src.get_u32();
        records.push(ReputationRecord {
            endpoint,
            last_success,
            last_attempt,
            last_fail,
            last_network,
        });
    }
    warn!(records = records.len(), "Snapshot has no end marker");
    Ok(records)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write ranked records to `path` atomically
pub fn write(path: &Path, records: &[ReputationRecord]) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = temp_path(path);
    let bytes = encode(records);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), records = records.len(), "Wrote reputation snapshot");
    Ok(())
}

/// Read records from `path`; a missing file yields no records
pub fn read(path: &Path) -> Result<Vec<ReputationRecord>> {
    match fs::read(path) {
        Ok(bytes) => decode(&bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}
