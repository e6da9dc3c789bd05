//! Reassembles the per-worker fragment lists into a globally ordered row
//! stream.
//!
//! Fragments are keyed by the buffer index their plain stride started at;
//! replaying buffers in ascending order therefore reproduces worksheet
//! byte order. Within a fragment the merger walks cells behind a
//! (column, row) cursor that the workers' [`LocationInfo`] records
//! correct whenever the linear replay would diverge from the true sheet
//! position.

use crate::pipeline::worker::{Fragment, LocationInfo};
use crate::types::{CellValue, Row};
use std::collections::VecDeque;

pub(crate) struct RowMerger {
    queues: Vec<VecDeque<Fragment>>,
    width: usize,
    skip_rows: u64,
    skip_columns: u64,

    buffer: usize,
    max_buffer: usize,
    worker_cursor: usize,
    active: Option<Fragment>,
    cell_offset: usize,
    loc_cursor: usize,

    row_cursor: u64,
    col_cursor: u64,
    pending: Vec<CellValue>,
    finished: bool,
}

impl RowMerger {
    pub(crate) fn new(
        fragment_lists: Vec<Vec<Fragment>>,
        columns: u64,
        skip_rows: u64,
        skip_columns: u64,
    ) -> Self {
        let width = columns.saturating_sub(skip_columns) as usize;
        let max_buffer = fragment_lists
            .iter()
            .flatten()
            .map(|f| f.start_buffer)
            .max();
        let empty = max_buffer.is_none();
        RowMerger {
            queues: fragment_lists
                .into_iter()
                .map(VecDeque::from)
                .collect(),
            width,
            skip_rows,
            skip_columns,
            buffer: 0,
            max_buffer: max_buffer.unwrap_or(0),
            worker_cursor: 0,
            active: None,
            cell_offset: 0,
            loc_cursor: 0,
            row_cursor: 0,
            col_cursor: 0,
            pending: vec![CellValue::None; width],
            finished: empty,
        }
    }

    /// Next reassembled row, `None` once every fragment is drained
    pub(crate) fn next_row(&mut self) -> Option<Row> {
        if self.finished {
            return None;
        }
        loop {
            if self.active.is_none() && !self.select_fragment() {
                self.finished = true;
                return self.take_pending();
            }
            if let Some(row) = self.drain_active() {
                return Some(row);
            }
        }
    }

    /// Pop the next fragment in (buffer, worker) order; false when none
    /// remain
    fn select_fragment(&mut self) -> bool {
        while self.buffer <= self.max_buffer {
            while self.worker_cursor < self.queues.len() {
                let w = self.worker_cursor;
                let matches = self.queues[w]
                    .front()
                    .is_some_and(|f| f.start_buffer == self.buffer);
                if matches {
                    self.active = self.queues[w].pop_front();
                    self.cell_offset = 0;
                    self.loc_cursor = 0;
                    return true;
                }
                self.worker_cursor += 1;
            }
            self.buffer += 1;
            self.worker_cursor = 0;
        }
        false
    }

    /// Walk the active fragment until a row is produced or it is spent.
    /// Offsets run to the cell count inclusive so trailing location
    /// records are honored.
    fn drain_active(&mut self) -> Option<Row> {
        loop {
            let (li, cells_len) = {
                let frag = self.active.as_ref()?;
                (frag.locs.get(self.loc_cursor).copied(), frag.cells.len())
            };
            if let Some(li) = li.filter(|li| li.cell_offset == self.cell_offset) {
                if let Some(row) = self.consume_location(li) {
                    return Some(row);
                }
                continue;
            }
            if self.cell_offset >= cells_len {
                self.active = None;
                return None;
            }
            let cell = self
                .active
                .as_ref()
                .map(|f| f.cells[self.cell_offset])
                .unwrap_or_default();
            self.place(cell);
            self.cell_offset += 1;
        }
    }

    /// Apply one location record to the cursor, yielding the accumulated
    /// row when the cursor leaves it.
    ///
    /// An explicit row more than one ahead advances the cursor a single
    /// step without consuming the record, so the rows in between are
    /// yielded empty rather than silently swallowed.
    fn consume_location(&mut self, li: LocationInfo) -> Option<Row> {
        match li.row {
            None => {
                let out = self.advance_row(self.row_cursor + 1);
                self.col_cursor = li.column;
                self.loc_cursor += 1;
                out
            }
            Some(row) => {
                if row > self.row_cursor + 1 {
                    let out = self.advance_row(self.row_cursor + 1);
                    self.col_cursor = 1;
                    out
                } else if row != self.row_cursor {
                    let out = self.advance_row(row);
                    self.col_cursor = li.column;
                    self.loc_cursor += 1;
                    out
                } else {
                    // reposition within the current row
                    self.col_cursor = li.column;
                    self.loc_cursor += 1;
                    None
                }
            }
        }
    }

    fn advance_row(&mut self, new_row: u64) -> Option<Row> {
        let out = self.take_pending();
        self.row_cursor = new_row;
        out
    }

    /// Yield the accumulated row unless it belongs to the skipped range
    fn take_pending(&mut self) -> Option<Row> {
        if self.row_cursor == 0 || self.row_cursor <= self.skip_rows {
            return None;
        }
        let cells = std::mem::replace(&mut self.pending, vec![CellValue::None; self.width]);
        Some(Row::new(self.row_cursor - self.skip_rows - 1, cells))
    }

    fn place(&mut self, cell: CellValue) {
        let col = self.col_cursor;
        self.col_cursor += 1;
        if self.row_cursor == 0
            || self.row_cursor <= self.skip_rows
            || col == 0
            || col <= self.skip_columns
        {
            return;
        }
        let index = (col - 1 - self.skip_columns) as usize;
        if index >= self.pending.len() {
            // the declared dimension understated the sheet, widen
            self.pending.resize(index + 1, CellValue::None);
            self.width = self.width.max(index + 1);
        }
        self.pending[index] = cell;
    }
}

/// Derive the row count from trailing location records when the worksheet
/// declared no `<dimension>`: next-row sentinels after the last explicit
/// row each stand for one more row.
pub(crate) fn derive_row_count(fragment_lists: &[Vec<Fragment>]) -> u64 {
    let mut total = 0u64;
    for fragments in fragment_lists {
        let mut sentinels = 0u64;
        let mut rows = 0u64;
        'worker: for fragment in fragments.iter().rev() {
            for li in fragment.locs.iter().rev() {
                match li.row {
                    None => sentinels += 1,
                    Some(r) => {
                        rows = r + sentinels;
                        break 'worker;
                    }
                }
            }
        }
        if rows == 0 && sentinels > 0 {
            rows = sentinels;
        }
        total = total.max(rows);
    }
    total
}
