//! Shared-string table and per-worker dynamic string arenas.
//!
//! The shared-string table is append-only while its loader runs, usually on
//! a background thread against a second archive handle. Readers are gated
//! by an atomic progress counter instead of locking against the loader:
//! [`SharedStrings::get`] polls until the counter passes the wanted index
//! or goes terminal.

use crate::archive::ZipArchive;
use crate::error::{Result, SheetError};
use crate::xml::{unescape_in_place, AttrKind, ElementScanner};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Largest allowed string, the worksheet cell limit
const STRING_CAPACITY: usize = 32 * 1024;

/// Number of high bits of an encoded dynamic index holding the worker id
const WORKER_BITS: u32 = 8;
const LOCAL_MASK: u64 = (1 << (64 - WORKER_BITS)) - 1;

/// Encode a per-worker arena index into a single cell payload
pub fn encode_dynamic(worker: u8, local: u64) -> u64 {
    (u64::from(worker) << (64 - WORKER_BITS)) | (local & LOCAL_MASK)
}

/// Split an encoded payload back into `(worker, local)`
pub fn decode_dynamic(encoded: u64) -> (u8, u64) {
    ((encoded >> (64 - WORKER_BITS)) as u8, encoded & LOCAL_MASK)
}

/// The workbook shared-string table with a load-progress counter.
///
/// The counter holds the number of fully loaded strings, or −1 once the
/// loader finished (successfully or not).
pub struct SharedStrings {
    strings: RwLock<Vec<String>>,
    progress: AtomicI64,
}

impl SharedStrings {
    pub(crate) fn new() -> Self {
        SharedStrings {
            strings: RwLock::new(Vec::new()),
            progress: AtomicI64::new(0),
        }
    }

    /// Number of strings loaded so far, −1 when terminal
    pub fn progress(&self) -> i64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Number of strings currently in the table
    pub fn len(&self) -> usize {
        self.strings.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch string `index`, waiting for the loader to pass it.
    ///
    /// Polls the progress counter in 1 ms steps until it exceeds `index` or
    /// goes terminal; a terminal counter with the index still out of bounds
    /// reports the table as inconsistent. `cancel` aborts the wait.
    pub fn get(&self, index: u64, cancel: Option<&AtomicBool>) -> Result<String> {
        loop {
            let progress = self.progress.load(Ordering::Acquire);
            if progress < 0 || (index as i64) < progress {
                break;
            }
            if let Some(flag) = cancel {
                if flag.load(Ordering::Acquire) {
                    return Err(SheetError::Canceled);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let strings = self
            .strings
            .read()
            .map_err(|_| SheetError::ProtocolViolation("string table lock poisoned".into()))?;
        strings.get(index as usize).cloned().ok_or_else(|| {
            SheetError::InconsistentSharedStrings {
                wanted: index + 1,
                have: strings.len() as u64,
            }
        })
    }

    fn push(&self, value: String) -> Result<()> {
        let mut strings = self
            .strings
            .write()
            .map_err(|_| SheetError::ProtocolViolation("string table lock poisoned".into()))?;
        strings.push(value);
        self.progress.store(strings.len() as i64, Ordering::Release);
        Ok(())
    }

    fn reserve(&self, additional: usize) {
        if let Ok(mut strings) = self.strings.write() {
            strings.reserve(additional);
        }
    }

    /// Drive the counter terminal; pending getters resolve against the
    /// final table
    pub(crate) fn finish(&self) {
        self.progress.store(-1, Ordering::Release);
    }
}

/// Parse the shared-string part into `table`.
///
/// `sst/si/t` only; multiple `<t>` runs under one `<si>` (rich text)
/// concatenate. Declared `uniqueCount` is enforced in both directions.
pub(crate) fn load_shared_strings(
    archive: &mut ZipArchive,
    path: &str,
    table: &SharedStrings,
) -> Result<()> {
    let result = run_loader(archive, path, table);
    // terminal in success and error alike, so getters never spin forever
    table.finish();
    result
}

fn run_loader(archive: &mut ZipArchive, path: &str, table: &SharedStrings) -> Result<()> {
    let entry = archive.require(path)?;

    let mut sst = ElementScanner::new("sst", &[("uniqueCount", AttrKind::Index)]);
    let mut si = ElementScanner::new("si", &[]);
    let mut t = ElementScanner::new("t", &[]);

    let mut unique_count: u64 = 0;
    let mut loaded: u64 = 0;
    let mut scratch: Vec<u8> = Vec::with_capacity(1024);

    let mut reader = archive.part_reader(&entry)?;
    let mut chunk = vec![0u8; 32 * 1024];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        for &b in &chunk[..read] {
            sst.feed(b);
            if !sst.inside() {
                continue;
            }
            if sst.completed_start() && sst.has_value(0) {
                unique_count = sst.index_value(0);
                table.reserve(unique_count as usize);
                debug!("shared strings declare uniqueCount={}", unique_count);
            }
            let in_si = si.inside();
            si.feed(b);
            if !in_si {
                continue;
            }
            let in_t = t.inside();
            t.feed(b);
            if !in_t && t.inside() {
                continue;
            }

            if t.completed() {
                let trim = t.close_length().saturating_sub(1);
                scratch.truncate(scratch.len().saturating_sub(trim));
            }
            if si.completed() {
                if unique_count > 0 && loaded >= unique_count {
                    return Err(SheetError::ProtocolViolation(format!(
                        "more shared strings than the declared uniqueCount {}",
                        unique_count
                    )));
                }
                unescape_in_place(&mut scratch);
                table.push(String::from_utf8_lossy(&scratch).into_owned())?;
                loaded += 1;
                scratch.clear();
                continue;
            }
            if t.inside() {
                if scratch.len() >= STRING_CAPACITY {
                    return Err(SheetError::ValueOverflow {
                        limit: STRING_CAPACITY,
                    });
                }
                scratch.push(b);
            }
        }
    }
    if !reader.crc_matches() {
        return Err(SheetError::BadArchive(format!(
            "CRC-32 mismatch in {}",
            path
        )));
    }

    if unique_count > 0 && loaded != unique_count {
        return Err(SheetError::InconsistentSharedStrings {
            wanted: unique_count,
            have: loaded,
        });
    }
    debug!("loaded {} shared strings", loaded);
    Ok(())
}

/// Per-worker append-only string arenas collected after a parse.
///
/// Worker `k` interns strings into its own arena while parsing and encodes
/// the arena index together with its id, so a single `u64` cell payload
/// resolves here without any cross-worker coordination.
#[derive(Debug, Default)]
pub struct DynamicStrings {
    arenas: Vec<Vec<String>>,
}

impl DynamicStrings {
    pub(crate) fn from_arenas(arenas: Vec<Vec<String>>) -> Self {
        DynamicStrings { arenas }
    }

    /// Resolve by worker id and local index
    pub fn get(&self, worker: u8, local: u64) -> Result<&str> {
        self.arenas
            .get(worker as usize)
            .and_then(|a| a.get(local as usize))
            .map(String::as_str)
            .ok_or_else(|| {
                SheetError::ProtocolViolation(format!(
                    "dynamic string {}:{} does not exist",
                    worker, local
                ))
            })
    }

    /// Resolve an encoded payload as stored in a cell
    pub fn get_encoded(&self, encoded: u64) -> Result<&str> {
        let (worker, local) = decode_dynamic(encoded);
        self.get(worker, local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let encoded = encode_dynamic(3, 12345);
        assert_eq!(decode_dynamic(encoded), (3, 12345));
        assert_eq!(decode_dynamic(encode_dynamic(0, 0)), (0, 0));
        assert_eq!(
            decode_dynamic(encode_dynamic(255, LOCAL_MASK)),
            (255, LOCAL_MASK)
        );
    }

    #[test]
    fn test_worker_id_in_high_bits() {
        assert_eq!(encode_dynamic(1, 0), 1u64 << 56);
        assert_eq!(encode_dynamic(0, 7), 7);
    }

    #[test]
    fn test_get_after_finish() {
        let table = SharedStrings::new();
        table.push("hi".to_string()).unwrap();
        table.push("bye".to_string()).unwrap();
        table.finish();
        assert_eq!(table.get(0, None).unwrap(), "hi");
        assert_eq!(table.get(1, None).unwrap(), "bye");
        assert!(matches!(
            table.get(2, None),
            Err(SheetError::InconsistentSharedStrings { .. })
        ));
    }

    #[test]
    fn test_get_waits_for_progress() {
        use std::sync::Arc;
        let table = Arc::new(SharedStrings::new());
        let writer = Arc::clone(&table);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.push("late".to_string()).unwrap();
            writer.finish();
        });
        // blocks until the loader thread catches up
        assert_eq!(table.get(0, None).unwrap(), "late");
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_breaks_wait() {
        let table = SharedStrings::new();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            table.get(5, Some(&cancel)),
            Err(SheetError::Canceled)
        ));
    }

    #[test]
    fn test_dynamic_strings_resolution() {
        let dynamic = DynamicStrings::from_arenas(vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ]);
        assert_eq!(dynamic.get(0, 0).unwrap(), "a");
        assert_eq!(dynamic.get(1, 1).unwrap(), "c");
        assert_eq!(dynamic.get_encoded(encode_dynamic(1, 0)).unwrap(), "b");
        assert!(dynamic.get(2, 0).is_err());
    }
}
