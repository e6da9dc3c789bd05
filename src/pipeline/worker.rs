//! Streaming cell extraction worker.
//!
//! Each worker owns a small set of element scanners and walks the buffer
//! ring in strides of the worker count ("leapfrog"), producing one
//! [`Fragment`] per plain stride. When a cell element or the opening tag
//! of a row crosses a buffer boundary, the worker extends into the next
//! buffer one slot at a time instead, finishes the dangling element and
//! then realigns onto its own stride. Content past a finished extension
//! belongs to the buffer's owner, which synchronizes at the next `<` and
//! skips the partial element at its head.
//!
//! Workers never re-order anything: fragments carry cells in worksheet
//! byte order plus the [`LocationInfo`] records the merger needs to
//! reconstruct the global row/column positions afterwards.

use crate::error::{Result, SheetError};
use crate::metadata::{to_unix_timestamp, DateStyleSet};
use crate::pipeline::ring::{BufferRing, SlotWait, CHUNK_SIZE, POLL};
use crate::strings::{encode_dynamic, SharedStrings};
use crate::types::{CellType, CellValue};
use crate::xml::{unescape_in_place, AttrKind, ElementScanner};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Cell value scratch limit; worksheet cells cap at 32 767 characters
const VALUE_CAPACITY: usize = CHUNK_SIZE;

/// Upper bound on 1 ms polls while waiting for the header drain
const HEADER_BARRIER_POLLS: u32 = 30_000;

/// Cursor correction record for the merger: "starting at cell
/// `cell_offset` of this fragment, the cursor is (`column`, `row`)".
/// A `row` of `None` means "the next row", emitted for `<row>` starts
/// that carry no row number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocationInfo {
    pub cell_offset: usize,
    pub column: u64,
    pub row: Option<u64>,
}

/// Cells and cursor records produced by one worker over one plain stride
#[derive(Debug)]
pub(crate) struct Fragment {
    pub start_buffer: usize,
    pub cells: Vec<CellValue>,
    pub locs: Vec<LocationInfo>,
}

/// Worksheet extent captured from `<dimension>`, shared across workers
#[derive(Debug, Default)]
pub(crate) struct SharedDims {
    settled: AtomicBool,
    seen: AtomicBool,
    columns: AtomicU64,
    rows: AtomicU64,
}

impl SharedDims {
    pub(crate) fn settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn record(&self, columns: u64, rows: u64) {
        self.columns.store(columns, Ordering::Release);
        self.rows.store(rows, Ordering::Release);
        self.seen.store(true, Ordering::Release);
        self.settled.store(true, Ordering::Release);
    }

    fn settle_without_dimension(&self) {
        self.settled.store(true, Ordering::Release);
    }

    /// `Some((columns, rows))` if a `<dimension>` element was captured
    pub(crate) fn captured(&self) -> Option<(u64, u64)> {
        if self.seen.load(Ordering::Acquire) {
            Some((
                self.columns.load(Ordering::Acquire),
                self.rows.load(Ordering::Acquire),
            ))
        } else {
            None
        }
    }
}

/// Type-coercion configuration and the header synchronization barrier.
///
/// When by-name coercions are requested, every worker decrements the
/// barrier exactly once: after passing its share of the header row, or on
/// stream exhaustion. The worker that brings the counter to zero has seen
/// the complete header cell set and drains the by-name map into the
/// by-index map under the mutex; the rest wait for `done` before emitting
/// anything past the header row.
pub(crate) struct CoercionState {
    active: bool,
    header_row: u64,
    by_name: Mutex<HashMap<String, CellType>>,
    by_index: Mutex<HashMap<u64, CellType>>,
    header_cells: Mutex<Vec<(u64, String)>>,
    barrier: AtomicUsize,
    done: AtomicBool,
}

impl CoercionState {
    pub(crate) fn new(
        by_index: HashMap<u64, CellType>,
        by_name: HashMap<String, CellType>,
        header_row: u64,
        workers: usize,
    ) -> Self {
        let active = !by_name.is_empty();
        CoercionState {
            active,
            header_row,
            by_name: Mutex::new(by_name),
            by_index: Mutex::new(by_index),
            header_cells: Mutex::new(Vec::new()),
            barrier: AtomicUsize::new(workers),
            done: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Result<HashMap<u64, CellType>> {
        self.by_index
            .lock()
            .map(|m| m.clone())
            .map_err(|_| SheetError::ProtocolViolation("coercion lock poisoned".into()))
    }

    fn drain(&self, skip_columns: u64) -> Result<()> {
        let names = self
            .by_name
            .lock()
            .map_err(|_| SheetError::ProtocolViolation("coercion lock poisoned".into()))?;
        let cells = self
            .header_cells
            .lock()
            .map_err(|_| SheetError::ProtocolViolation("coercion lock poisoned".into()))?;
        let mut by_index = self
            .by_index
            .lock()
            .map_err(|_| SheetError::ProtocolViolation("coercion lock poisoned".into()))?;
        for (name, ty) in names.iter() {
            for (column, header) in cells.iter() {
                if header == name && *column > skip_columns {
                    by_index.insert(*column - 1 - skip_columns, *ty);
                }
            }
        }
        drop(by_index);
        self.done.store(true, Ordering::Release);
        Ok(())
    }
}

/// Read-only view every worker gets of the parse
pub(crate) struct ParseContext<'a> {
    pub ring: &'a BufferRing,
    pub skip_rows: u64,
    pub skip_columns: u64,
    pub date_styles: &'a DateStyleSet,
    pub date1904: bool,
    pub shared: &'a SharedStrings,
    pub coercions: &'a CoercionState,
    pub dims: &'a SharedDims,
}

/// Everything a worker hands back to the orchestrator
pub(crate) struct WorkerOutput {
    pub fragments: Vec<Fragment>,
    pub arena: Vec<String>,
    pub max_column: u64,
    pub error: Option<SheetError>,
}

/// Strict decimal-to-double parse over the whole value, tolerating only
/// trailing whitespace
pub(crate) fn parse_number(bytes: &[u8]) -> Option<f64> {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&bytes[..end]).ok()?.parse::<f64>().ok()
}

/// Accumulate leading decimal digits; callers supply pre-trimmed input
pub(crate) fn extract_unsigned(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add(u64::from(b - b'0'));
    }
    value
}

fn intern_into(arena: &mut Vec<String>, worker: u8, bytes: &[u8]) -> u64 {
    let local = arena.len() as u64;
    arena.push(String::from_utf8_lossy(bytes).into_owned());
    encode_dynamic(worker, local)
}

/// Run one worker to completion and collect its output.
/// Errors terminate the peers; the fragments produced so far are kept so
/// the merger can still yield partial rows.
pub(crate) fn run_worker(id: usize, ctx: &ParseContext<'_>) -> WorkerOutput {
    let mut worker = Worker::new(id, ctx);
    let error = worker.run().err();
    if let Some(e) = &error {
        if !matches!(e, SheetError::Canceled) {
            log::warn!("worker {} failed: {}", id, e);
        }
        ctx.ring.request_terminate();
    }
    worker.contribute_to_barrier();
    worker.flush_fragment();
    WorkerOutput {
        fragments: worker.fragments,
        arena: worker.arena,
        max_column: worker.max_column,
        error,
    }
}

struct Worker<'a, 'c> {
    id: usize,
    ctx: &'a ParseContext<'c>,

    dimension: ElementScanner,
    sheet_data: ElementScanner,
    row: ElementScanner,
    c: ElementScanner,
    v: ElementScanner,
    t: ElementScanner,

    value: Vec<u8>,
    metadata_done: bool,

    // XML position cursor: where the next cell sits in the sheet
    pos_col: u64,
    pos_row: u64,
    // mirror of the merger's replay cursor; a divergence on emit means a
    // LocationInfo record must be written
    merger_col: u64,
    merger_row: u64,

    fragments: Vec<Fragment>,
    frag_start: usize,
    cells: Vec<CellValue>,
    locs: Vec<LocationInfo>,

    arena: Vec<String>,
    max_column: u64,

    local_coercions: HashMap<u64, CellType>,
    passed_header: bool,
    contributed: bool,

    continue_cell: bool,
    continue_row: bool,
    load_next: bool,
}

impl<'a, 'c> Worker<'a, 'c> {
    fn new(id: usize, ctx: &'a ParseContext<'c>) -> Self {
        let local_coercions = ctx.coercions.snapshot().unwrap_or_default();
        Worker {
            id,
            ctx,
            dimension: ElementScanner::new("dimension", &[("ref", AttrKind::Range)]),
            sheet_data: ElementScanner::new("sheetData", &[]),
            row: ElementScanner::new("row", &[("r", AttrKind::Index)]),
            c: ElementScanner::new(
                "c",
                &[
                    ("r", AttrKind::Location),
                    ("t", AttrKind::Type),
                    ("s", AttrKind::Index),
                ],
            ),
            v: ElementScanner::new("v", &[]),
            t: ElementScanner::new("t", &[]),
            value: Vec::with_capacity(256),
            metadata_done: false,
            pos_col: 0,
            pos_row: 0,
            merger_col: 0,
            merger_row: 0,
            fragments: Vec::new(),
            frag_start: id,
            cells: Vec::new(),
            locs: Vec::new(),
            arena: Vec::new(),
            max_column: 0,
            local_coercions,
            passed_header: false,
            contributed: false,
            continue_cell: false,
            continue_row: false,
            load_next: false,
        }
    }

    fn run(&mut self) -> Result<()> {
        let workers = self.ctx.ring.workers();
        let chunk = self.ctx.ring.chunk_size();
        let ring = self.ctx.ring;

        let mut current = self.id;
        let mut offset = 0usize;
        let mut buf: &[u8] = &[];
        let mut valid = false;

        loop {
            if !valid || offset >= chunk || buf[offset] == 0 || self.load_next {
                self.load_next = false;
                let target = if valid && !self.c.outside() {
                    // mid-cell, extend into the next buffer
                    self.continue_cell = true;
                    current + 1
                } else if valid && self.row.at_start() {
                    // mid way through an opening row tag
                    self.continue_row = true;
                    current + 1
                } else {
                    let was_extension = self.continue_cell || self.continue_row;
                    self.continue_cell = false;
                    self.continue_row = false;
                    // distance from the current buffer back onto this
                    // worker's stride; extensions may have walked off it
                    let phase = (self.id + workers - current % workers) % workers;
                    if phase != 0 {
                        current + phase
                    } else if was_extension && valid {
                        // extension ended inside this worker's own slot:
                        // the remainder is plain territory, resume here
                        current
                    } else {
                        current + workers
                    }
                };

                if target != current {
                    ring.claim(self.id, target);
                    match ring.wait_readable(target) {
                        SlotWait::Ready => {}
                        SlotWait::Exhausted => break,
                        SlotWait::Terminated => return Err(SheetError::Canceled),
                    }
                    current = target;
                    // Safety: claimed above and observed readable, so the
                    // producer has published this slot and moved off it.
                    buf = unsafe { ring.slot(current) };
                    offset = 0;
                    valid = true;
                }
                if !self.continue_cell && !self.continue_row {
                    self.begin_fragment(current);
                }
                continue;
            }

            let b = buf[offset];
            offset += 1;
            self.feed(b)?;
        }
        Ok(())
    }

    /// Start a new fragment at `start`, dropping cross-buffer state
    fn begin_fragment(&mut self, start: usize) {
        self.flush_fragment();
        self.frag_start = start;
        self.c.reset();
        self.v.reset();
        self.t.reset();
        self.row.reset();
        self.value.clear();
        self.pos_col = 0;
        self.pos_row = 0;
        self.merger_col = 0;
        self.merger_row = 0;
    }

    fn flush_fragment(&mut self) {
        if !self.cells.is_empty() || !self.locs.is_empty() {
            self.fragments.push(Fragment {
                start_buffer: self.frag_start,
                cells: std::mem::take(&mut self.cells),
                locs: std::mem::take(&mut self.locs),
            });
        }
    }

    fn feed(&mut self, b: u8) -> Result<()> {
        self.feed_byte(b)?;
        // a row extension is over once both the row scanner and any cell
        // it ran into have settled
        if self.continue_row && self.c.outside() && !self.row.at_start() {
            self.load_next = true;
        }
        Ok(())
    }

    fn feed_byte(&mut self, b: u8) -> Result<()> {
        if !self.metadata_done {
            if self.ctx.dims.settled() {
                self.metadata_done = true;
            } else {
                self.sheet_data.feed(b);
                self.dimension.feed(b);
                if self.dimension.completed() && self.dimension.has_value(0) {
                    let (_, (columns, rows)) = self.dimension.range_value(0);
                    self.ctx.dims.record(columns, rows);
                    self.metadata_done = true;
                } else if self.sheet_data.inside() {
                    // no dimension before the data; the merger derives the
                    // extent from the parsed cells instead
                    self.ctx.dims.settle_without_dimension();
                    self.metadata_done = true;
                }
            }
        }

        self.row.feed(b);
        if self.row.completed_start() {
            let row = self.row.has_value(0).then(|| self.row.index_value(0));
            self.locs.push(LocationInfo {
                cell_offset: self.cells.len(),
                column: 1,
                row,
            });
            match row {
                Some(r) => {
                    self.pos_row = r;
                    self.merger_row = r;
                }
                None => {
                    if self.pos_row > 0 {
                        self.pos_row += 1;
                    }
                    if self.merger_row > 0 {
                        self.merger_row += 1;
                    }
                }
            }
            self.pos_col = 1;
            self.merger_col = 1;
            // only the opening tag matters; an armed row scanner would
            // otherwise fight the cell extension logic at buffer ends
            self.row.reset();
        }

        let in_c = self.c.inside();
        self.c.feed(b);
        if !in_c && !(self.continue_cell && self.c.outside()) {
            return Ok(());
        }
        let in_v = self.v.inside();
        self.v.feed(b);
        if !in_v && self.v.inside() {
            return Ok(());
        }
        let in_t = self.t.inside();
        self.t.feed(b);
        if !in_t && self.t.inside() {
            return Ok(());
        }
        if self.t.completed() {
            // excise the captured bytes of `</t` between text runs
            let trim = self.t.close_length().saturating_sub(1);
            self.value.truncate(self.value.len().saturating_sub(trim));
        }

        if self.c.completed() {
            self.finish_cell()?;
            if self.continue_cell {
                self.load_next = true;
            }
            return Ok(());
        } else if self.continue_cell && self.c.outside() {
            if self.row.at_start() {
                // the dangling tag was a row start, not a cell; keep
                // parsing in place until its opening tag completes
                self.continue_cell = false;
                self.continue_row = true;
            } else {
                // extension was not an open cell after all
                self.load_next = true;
            }
            return Ok(());
        }

        if self.v.inside() || self.t.inside() {
            if self.value.len() >= VALUE_CAPACITY {
                return Err(SheetError::ValueOverflow {
                    limit: VALUE_CAPACITY,
                });
            }
            self.value.push(b);
        }
        Ok(())
    }

    fn finish_cell(&mut self) -> Result<()> {
        let raw_type = if self.c.has_value(1) {
            self.c.type_value(1)
        } else {
            CellType::Numeric
        };

        // isolate the value bytes; for `<v>` captures the tail still holds
        // the closing-tag bytes consumed mid-stream
        let value_len = if raw_type == CellType::StringInline {
            self.value.len()
        } else {
            let close = self.v.close_length();
            let len = self.value.len();
            if len == 0 || len < close {
                0
            } else {
                len - close + 1
            }
        };

        let (attr_col, attr_row) = if self.c.has_value(0) {
            self.c.location_value(0)
        } else {
            (0, 0)
        };
        let (column, row) = if attr_col > 0 && attr_row > 0 {
            (attr_col, attr_row)
        } else {
            (self.pos_col, self.pos_row)
        };
        let located = column > 0 && row > 0;
        if located {
            self.pos_col = column + 1;
            self.pos_row = row;
            if column > self.max_column {
                self.max_column = column;
            }
        }

        if value_len == 0 {
            // cells without a value (style-only, empty inline) leave a gap
            self.value.clear();
            return Ok(());
        }
        if raw_type == CellType::None {
            return Err(SheetError::ProtocolViolation(
                "unrecognized cell type code".to_string(),
            ));
        }
        let date_style = self.c.has_value(2) && self.ctx.date_styles.is_date(self.c.index_value(2));

        let result = if located {
            self.place_cell(raw_type, value_len, column, row, date_style)
        } else {
            self.place_unlocated_cell(raw_type, value_len, date_style)
        };
        self.value.clear();
        result
    }

    /// Cells without an `r` attribute in a sheet that never anchored the
    /// position cursor: the merger places them at its replay cursor, so
    /// they can be emitted without location records as long as nothing
    /// position-dependent is configured
    fn place_unlocated_cell(
        &mut self,
        natural: CellType,
        value_len: usize,
        date_style: bool,
    ) -> Result<()> {
        if self.ctx.skip_rows > 0
            || self.ctx.skip_columns > 0
            || self.ctx.coercions.active
            || !self.local_coercions.is_empty()
        {
            return Err(SheetError::ProtocolViolation(
                "cell without a location cannot be skipped or coerced".to_string(),
            ));
        }
        let cell = self.make_value(natural, value_len, date_style, None)?;
        self.cells.push(cell);
        // force a location record at the next located cell
        self.merger_col = 0;
        self.merger_row = 0;
        Ok(())
    }

    /// Apply skip rules, header synchronization and coercions, then append
    /// the finished cell to the current fragment
    fn place_cell(
        &mut self,
        natural: CellType,
        value_len: usize,
        column: u64,
        row: u64,
        date_style: bool,
    ) -> Result<()> {
        let coercions_active = self.ctx.coercions.active;
        let header_row = self.ctx.coercions.header_row;

        if coercions_active && row > header_row && !self.passed_header {
            self.pass_header()?;
        }
        if coercions_active && row == header_row && column > self.ctx.skip_columns {
            self.collect_header_cell(natural, value_len, column)?;
        }

        let dropped = row <= self.ctx.skip_rows || column <= self.ctx.skip_columns;
        let target = if !dropped {
            self.local_coercions
                .get(&(column - 1 - self.ctx.skip_columns))
                .copied()
        } else {
            None
        };
        if dropped || target == Some(CellType::Skip) {
            return Ok(());
        }

        let cell = self.make_value(natural, value_len, date_style, target)?;

        if (column, row) != (self.merger_col, self.merger_row) {
            self.locs.push(LocationInfo {
                cell_offset: self.cells.len(),
                column,
                row: Some(row),
            });
        }
        self.cells.push(cell);
        self.merger_col = column + 1;
        self.merger_row = row;
        Ok(())
    }

    /// Produce the final tagged value for one cell, honoring the coercion
    /// target when one is configured for its column
    fn make_value(
        &mut self,
        natural: CellType,
        value_len: usize,
        date_style: bool,
        target: Option<CellType>,
    ) -> Result<CellValue> {
        let worker_id = self.id as u8;
        let date1904 = self.ctx.date1904;
        let cell = match natural {
            CellType::Numeric | CellType::Date => {
                let number = match parse_number(&self.value[..value_len]) {
                    Some(v) => v,
                    None if target == Some(CellType::String) => {
                        return Ok(CellValue::String(intern_into(
                            &mut self.arena,
                            worker_id,
                            &self.value[..value_len],
                        )));
                    }
                    None if natural == CellType::Numeric => {
                        return Err(SheetError::NumberParse(
                            String::from_utf8_lossy(&self.value[..value_len]).into_owned(),
                        ));
                    }
                    None => return Ok(CellValue::None),
                };
                match target {
                    Some(CellType::Numeric) => CellValue::Numeric(number),
                    Some(CellType::Date) => CellValue::Date(to_unix_timestamp(number, date1904)),
                    Some(CellType::Boolean) => CellValue::Boolean(number != 0.0),
                    Some(CellType::String) => CellValue::String(intern_into(
                        &mut self.arena,
                        worker_id,
                        &self.value[..value_len],
                    )),
                    _ => {
                        if natural == CellType::Date || date_style {
                            CellValue::Date(to_unix_timestamp(number, date1904))
                        } else {
                            CellValue::Numeric(number)
                        }
                    }
                }
            }
            CellType::Boolean => {
                let truthy = extract_unsigned(&self.value[..value_len]) != 0;
                match target {
                    Some(CellType::Numeric) => CellValue::Numeric(truthy as u8 as f64),
                    Some(CellType::Date) => {
                        CellValue::Date(to_unix_timestamp(truthy as u8 as f64, date1904))
                    }
                    Some(CellType::String) => CellValue::String(intern_into(
                        &mut self.arena,
                        worker_id,
                        &self.value[..value_len],
                    )),
                    _ => CellValue::Boolean(truthy),
                }
            }
            CellType::Error => match target {
                Some(CellType::Numeric) | Some(CellType::Date) | Some(CellType::Boolean) => {
                    CellValue::None
                }
                Some(CellType::String) => CellValue::String(intern_into(
                    &mut self.arena,
                    worker_id,
                    &self.value[..value_len],
                )),
                _ => CellValue::Error(extract_unsigned(&self.value[..value_len])),
            },
            CellType::StringRef => {
                let index = extract_unsigned(&self.value[..value_len]);
                match target {
                    Some(CellType::Numeric) => match parse_number(self.resolve_shared(index)?.as_bytes())
                    {
                        Some(v) => CellValue::Numeric(v),
                        None => CellValue::None,
                    },
                    Some(CellType::Date) => match parse_number(self.resolve_shared(index)?.as_bytes())
                    {
                        Some(v) => CellValue::Date(to_unix_timestamp(v, date1904)),
                        None => CellValue::None,
                    },
                    Some(CellType::Boolean) => {
                        CellValue::Boolean(self.resolve_shared(index)? == "TRUE")
                    }
                    _ => CellValue::StringRef(index),
                }
            }
            CellType::String | CellType::StringInline => match target {
                Some(CellType::Numeric) => match parse_number(&self.value[..value_len]) {
                    Some(v) => CellValue::Numeric(v),
                    None => CellValue::None,
                },
                Some(CellType::Date) => match parse_number(&self.value[..value_len]) {
                    Some(v) => CellValue::Date(to_unix_timestamp(v, date1904)),
                    None => CellValue::None,
                },
                Some(CellType::Boolean) => {
                    let mut text = self.value[..value_len].to_vec();
                    unescape_in_place(&mut text);
                    CellValue::Boolean(text == b"TRUE")
                }
                _ => {
                    let mut text = self.value[..value_len].to_vec();
                    unescape_in_place(&mut text);
                    let index = intern_into(&mut self.arena, worker_id, &text);
                    if natural == CellType::StringInline {
                        CellValue::InlineString(index)
                    } else {
                        CellValue::String(index)
                    }
                }
            },
            CellType::None | CellType::Skip => CellValue::None,
        };
        Ok(cell)
    }

    fn resolve_shared(&self, index: u64) -> Result<String> {
        self.ctx
            .shared
            .get(index, Some(self.ctx.ring.terminate_handle()))
    }

    /// Remember a header cell's text for the by-name drain
    fn collect_header_cell(
        &mut self,
        natural: CellType,
        value_len: usize,
        column: u64,
    ) -> Result<()> {
        let text = match natural {
            CellType::String | CellType::StringInline => {
                let mut bytes = self.value[..value_len].to_vec();
                unescape_in_place(&mut bytes);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            CellType::StringRef => {
                let index = extract_unsigned(&self.value[..value_len]);
                self.resolve_shared(index)?
            }
            _ => return Ok(()),
        };
        self.ctx
            .coercions
            .header_cells
            .lock()
            .map_err(|_| SheetError::ProtocolViolation("coercion lock poisoned".into()))?
            .push((column, text));
        Ok(())
    }

    /// Cross the header barrier: contribute this worker's decrement, drain
    /// if it is the last one, otherwise wait for the drainer
    fn pass_header(&mut self) -> Result<()> {
        let co = self.ctx.coercions;
        self.contributed = true;
        if co.barrier.fetch_sub(1, Ordering::AcqRel) == 1 {
            co.drain(self.ctx.skip_columns)?;
        } else {
            let mut polls = 0u32;
            while !co.done.load(Ordering::Acquire) {
                if self.ctx.ring.terminated() {
                    return Err(SheetError::Canceled);
                }
                polls += 1;
                if polls > HEADER_BARRIER_POLLS {
                    return Err(SheetError::ProtocolViolation(
                        "header coercion barrier timed out".to_string(),
                    ));
                }
                std::thread::sleep(POLL);
            }
        }
        self.local_coercions = co.snapshot()?;
        self.passed_header = true;
        Ok(())
    }

    /// Ensure this worker's barrier decrement happens even when its stream
    /// ended before the header row, so peers cannot wait forever
    fn contribute_to_barrier(&mut self) {
        let co = self.ctx.coercions;
        if !co.active || self.contributed {
            return;
        }
        self.contributed = true;
        if co.barrier.fetch_sub(1, Ordering::AcqRel) == 1 && !co.done.load(Ordering::Acquire) {
            let _ = co.drain(self.ctx.skip_columns);
        }
    }
}
