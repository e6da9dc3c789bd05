//! Worksheet handle: parse configuration, pipeline orchestration and the
//! merged row stream.

use crate::archive::PartEntry;
use crate::error::{Result, SheetError};
use crate::pipeline::merge::{derive_row_count, RowMerger};
use crate::pipeline::ring::{BufferRing, CHUNK_SIZE, NUM_BUFFERS};
use crate::pipeline::worker::{
    run_worker, CoercionState, ParseContext, SharedDims, WorkerOutput,
};
use crate::strings::DynamicStrings;
use crate::types::{CellType, Dimension, Row};
use crate::workbook::Workbook;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle for canceling a running [`Sheet::parse`] from another thread.
///
/// The reader imposes no timeouts of its own; callers with a wall-clock
/// budget hold one of these and trip it when the budget runs out.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Ask producer and workers to stop at their next poll
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One worksheet of an opened [`Workbook`].
///
/// Configure with [`set_headers`](Self::set_headers),
/// [`set_coercions`](Self::set_coercions) and [`skip`](Self::skip), run
/// [`parse`](Self::parse) once, then drain rows with
/// [`next_row`](Self::next_row) or [`rows`](Self::rows).
pub struct Sheet<'a> {
    workbook: &'a Workbook,
    entry: PartEntry,
    name: String,

    headers: bool,
    skip_rows: u64,
    skip_columns: u64,
    by_index: HashMap<u64, CellType>,
    by_name: HashMap<String, CellType>,

    chunk_size: usize,
    num_buffers: usize,
    cancel: Arc<AtomicBool>,

    dimension: Dimension,
    dynamic: DynamicStrings,
    merger: Option<RowMerger>,
}

enum RunOutcome {
    Finished {
        producer: Result<()>,
        outputs: Vec<WorkerOutput>,
    },
    SpawnFailed,
}

impl<'a> Sheet<'a> {
    pub(crate) fn new(workbook: &'a Workbook, entry: PartEntry, name: String) -> Self {
        Sheet {
            workbook,
            entry,
            name,
            headers: false,
            skip_rows: 0,
            skip_columns: 0,
            by_index: HashMap::new(),
            by_name: HashMap::new(),
            chunk_size: CHUNK_SIZE,
            num_buffers: NUM_BUFFERS,
            cancel: Arc::new(AtomicBool::new(false)),
            dimension: Dimension::default(),
            dynamic: DynamicStrings::default(),
            merger: None,
        }
    }

    /// User-visible sheet name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Treat the first non-skipped row as a header row.
    /// By-name coercions match against it.
    pub fn set_headers(&mut self, headers: bool) {
        self.headers = headers;
    }

    /// Configure cell-type coercions per 0-based output column and per
    /// header-cell text. [`CellType::Skip`] drops the column.
    pub fn set_coercions(
        &mut self,
        by_index: HashMap<u64, CellType>,
        by_name: HashMap<String, CellType>,
    ) {
        self.by_index = by_index;
        self.by_name = by_name;
    }

    /// Drop the first `rows` rows and the first `columns` columns
    pub fn skip(&mut self, rows: u64, columns: u64) {
        self.skip_rows = rows;
        self.skip_columns = columns;
    }

    /// Token for canceling a parse from another thread
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Worksheet extent; meaningful after [`parse`](Self::parse)
    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Parse the worksheet with `num_threads` total threads (0 = detect).
    ///
    /// Returns `Ok(false)` when recoverable problems were encountered (a
    /// CRC mismatch, a failed worker); the merged stream then holds the
    /// rows that could still be recovered. Hard failures and cancellation
    /// return an error.
    pub fn parse(&mut self, num_threads: usize) -> Result<bool> {
        let budget = if num_threads == 0 {
            auto_thread_budget()
        } else {
            num_threads
        };
        let workers = worker_count(budget, self.workbook.parallel_strings());
        debug!(
            "parsing sheet '{}' with {} workers (budget {})",
            self.name, workers, budget
        );
        self.parse_with(workers)
    }

    fn parse_with(&mut self, workers: usize) -> Result<bool> {
        self.merger = None;
        let archive = self.workbook.archive().reopen()?;
        let ring = BufferRing::new(
            workers,
            self.num_buffers,
            self.chunk_size,
            Arc::clone(&self.cancel),
        );
        let dims = SharedDims::default();
        let coercions = CoercionState::new(
            self.by_index.clone(),
            self.by_name.clone(),
            self.skip_rows + 1,
            workers,
        );
        let ctx = ParseContext {
            ring: &ring,
            skip_rows: self.skip_rows,
            skip_columns: self.skip_columns,
            date_styles: self.workbook.date_styles(),
            date1904: self.workbook.date1904(),
            shared: self.workbook.shared_table(),
            coercions: &coercions,
            dims: &dims,
        };

        let user_canceled_before = self.cancel.load(Ordering::Acquire);
        let entry = self.entry.clone();
        let outcome = std::thread::scope(|scope| {
            let ring_ref = &ring;
            let mut archive = archive;
            let producer = std::thread::Builder::new()
                .name("sheetpipe-producer".to_string())
                .spawn_scoped(scope, move || -> Result<()> {
                    let result = archive
                        .part_reader(&entry)
                        .and_then(|mut reader| ring_ref.produce(&mut reader));
                    if result.is_err() {
                        ring_ref.request_terminate();
                    }
                    result
                });
            let producer = match producer {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("failed to spawn producer thread: {}", e);
                    return RunOutcome::SpawnFailed;
                }
            };

            let ctx_ref = &ctx;
            let mut handles = Vec::with_capacity(workers - 1);
            let mut spawn_failed = false;
            for k in 0..workers - 1 {
                let builder =
                    std::thread::Builder::new().name(format!("sheetpipe-worker-{}", k));
                match builder.spawn_scoped(scope, move || run_worker(k, ctx_ref)) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        warn!("failed to spawn worker thread: {}", e);
                        spawn_failed = true;
                        break;
                    }
                }
            }
            if spawn_failed {
                ring.request_terminate();
                let _ = producer.join();
                for handle in handles {
                    let _ = handle.join();
                }
                return RunOutcome::SpawnFailed;
            }

            // the last worker runs on the calling thread
            let inline_output = run_worker(workers - 1, ctx_ref);
            let producer_result = match producer.join() {
                Ok(r) => r,
                Err(_) => Err(SheetError::ProtocolViolation(
                    "producer thread panicked".to_string(),
                )),
            };
            let mut outputs = Vec::with_capacity(workers);
            for handle in handles {
                match handle.join() {
                    Ok(output) => outputs.push(output),
                    Err(_) => {
                        return RunOutcome::Finished {
                            producer: Err(SheetError::ProtocolViolation(
                                "worker thread panicked".to_string(),
                            )),
                            outputs: Vec::new(),
                        }
                    }
                }
            }
            outputs.push(inline_output);
            RunOutcome::Finished {
                producer: producer_result,
                outputs,
            }
        });

        let (producer_result, outputs) = match outcome {
            RunOutcome::Finished { producer, outputs } => (producer, outputs),
            RunOutcome::SpawnFailed => {
                // degrade rather than fail; the ring was terminated above,
                // so restore the caller's cancellation state first
                self.cancel.store(user_canceled_before, Ordering::Release);
                if workers > 1 {
                    warn!("degrading to a single-threaded parse");
                    return self.parse_with(1);
                }
                return Err(SheetError::ProtocolViolation(
                    "unable to spawn any parsing thread".to_string(),
                ));
            }
        };

        if ring.failed() {
            return Err(producer_result.err().unwrap_or_else(|| {
                SheetError::Decompression("worksheet decompression failed".to_string())
            }));
        }

        let worker_errors: Vec<&SheetError> = outputs
            .iter()
            .filter_map(|o| o.error.as_ref())
            .filter(|e| !matches!(e, SheetError::Canceled))
            .collect();
        let had_worker_errors = !worker_errors.is_empty();
        if !had_worker_errors && self.cancel.load(Ordering::Acquire) {
            return Err(SheetError::Canceled);
        }
        if let Err(e) = &producer_result {
            if !matches!(e, SheetError::Canceled) {
                return Err(SheetError::Decompression(e.to_string()));
            }
        }

        let mut max_column = 0;
        let mut arenas = Vec::with_capacity(outputs.len());
        let mut fragment_lists = Vec::with_capacity(outputs.len());
        for output in outputs {
            max_column = max_column.max(output.max_column);
            arenas.push(output.arena);
            fragment_lists.push(output.fragments);
        }
        let (columns, rows) = match dims.captured() {
            Some((columns, rows)) => (columns, rows),
            None => (max_column, derive_row_count(&fragment_lists)),
        };
        self.dimension = Dimension { columns, rows };
        self.dynamic = DynamicStrings::from_arenas(arenas);
        self.merger = Some(RowMerger::new(
            fragment_lists,
            columns,
            self.skip_rows,
            self.skip_columns,
        ));

        Ok(!had_worker_errors && !ring.crc_mismatch())
    }

    /// Next merged row, `None` when the stream is exhausted or
    /// [`parse`](Self::parse) has not run
    pub fn next_row(&mut self) -> Option<Row> {
        self.merger.as_mut()?.next_row()
    }

    /// Iterator over the remaining rows
    pub fn rows(&mut self) -> Rows<'_, 'a> {
        Rows { sheet: self }
    }

    /// Resolve an encoded dynamic-string payload produced by this sheet's
    /// parse (see [`crate::CellValue::String`])
    pub fn dynamic_string(&self, encoded: u64) -> Result<&str> {
        self.dynamic.get_encoded(encoded)
    }

    /// Resolve a dynamic string by worker id and arena index
    pub fn dynamic_string_at(&self, worker: u8, index: u64) -> Result<&str> {
        self.dynamic.get(worker, index)
    }
}

/// Iterator over [`Sheet::next_row`]
pub struct Rows<'s, 'w> {
    sheet: &'s mut Sheet<'w>,
}

impl Iterator for Rows<'_, '_> {
    type Item = Row;

    fn next(&mut self) -> Option<Self::Item> {
        self.sheet.next_row()
    }
}

/// Total thread budget when the caller does not specify one
fn auto_thread_budget() -> usize {
    let hw = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    // limit impact on the machine; returns diminish quickly anyway
    if hw > 10 {
        10
    } else if hw > 6 {
        6
    } else {
        hw
    }
}

/// Worker count from the total budget: the producer takes one thread and
/// parallel string loading reserves two more
fn worker_count(budget: usize, parallel_strings: bool) -> usize {
    let reserved = if parallel_strings { 2 } else { 0 } + usize::from(budget > 1);
    budget.saturating_sub(reserved).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_reserves_support_threads() {
        assert_eq!(worker_count(1, false), 1);
        assert_eq!(worker_count(1, true), 1);
        assert_eq!(worker_count(2, false), 1);
        assert_eq!(worker_count(6, true), 3);
        assert_eq!(worker_count(10, true), 7);
        assert_eq!(worker_count(10, false), 9);
    }

    #[test]
    fn test_cancel_token_roundtrip() {
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancelToken {
            flag: Arc::clone(&flag),
        };
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
        assert!(flag.load(Ordering::Acquire));
    }
}
