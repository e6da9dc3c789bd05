//! Cell and row types produced by the worksheet pipeline

use std::fmt;

/// Letter-coded cell type from the worksheet `t` attribute, plus the
/// pseudo-type `Skip` usable as a coercion target to drop a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CellType {
    /// No value
    #[default]
    None,
    /// Plain number (the default when no `t` attribute is present)
    Numeric,
    /// Reference into the shared-string table (`t="s"`)
    StringRef,
    /// Inline string stored in `<v>` (`t="str"`, formula results)
    String,
    /// Inline string stored in `<is><t>` (`t="inlineStr"`)
    StringInline,
    /// Boolean (`t="b"`)
    Boolean,
    /// Error value (`t="e"`)
    Error,
    /// Date (`t="d"`, or a numeric cell with a date style)
    Date,
    /// Coercion target only: drop the cell
    Skip,
}

/// A typed cell value.
///
/// Every variant carries a fixed 8-byte payload so that dense row vectors
/// stay compact. String variants hold indices, never string data:
/// [`StringRef`](CellValue::StringRef) indexes the workbook shared-string
/// table, [`String`](CellValue::String) and
/// [`InlineString`](CellValue::InlineString) hold an encoded per-worker
/// arena index (see [`crate::strings::encode_dynamic`]).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CellValue {
    /// Empty cell
    #[default]
    None,
    /// Numeric value
    Numeric(f64),
    /// Index into the shared-string table
    StringRef(u64),
    /// Encoded dynamic-string index (formula string result)
    String(u64),
    /// Encoded dynamic-string index (inline string)
    InlineString(u64),
    /// Boolean value
    Boolean(bool),
    /// Error value; the payload carries no meaning beyond the raw bytes
    Error(u64),
    /// Date as seconds since the Unix epoch
    Date(f64),
}

impl CellValue {
    /// The [`CellType`] tag of this value
    pub fn cell_type(&self) -> CellType {
        match self {
            CellValue::None => CellType::None,
            CellValue::Numeric(_) => CellType::Numeric,
            CellValue::StringRef(_) => CellType::StringRef,
            CellValue::String(_) => CellType::String,
            CellValue::InlineString(_) => CellType::StringInline,
            CellValue::Boolean(_) => CellType::Boolean,
            CellValue::Error(_) => CellType::Error,
            CellValue::Date(_) => CellType::Date,
        }
    }

    /// Check if cell is empty
    pub fn is_none(&self) -> bool {
        matches!(self, CellValue::None)
    }

    /// Numeric payload of numeric and date cells
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Numeric(v) | CellValue::Date(v) => Some(*v),
            CellValue::Boolean(b) => Some(*b as u8 as f64),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Boolean(b) => Some(*b),
            CellValue::Numeric(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    /// String-table or arena index of string cells
    pub fn string_index(&self) -> Option<u64> {
        match self {
            CellValue::StringRef(i) | CellValue::String(i) | CellValue::InlineString(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::None => Ok(()),
            CellValue::Numeric(v) | CellValue::Date(v) => write!(f, "{}", v),
            CellValue::StringRef(i) => write!(f, "s:{}", i),
            CellValue::String(i) | CellValue::InlineString(i) => write!(f, "d:{}", i),
            CellValue::Boolean(b) => write!(f, "{}", b),
            CellValue::Error(_) => write!(f, "#ERROR"),
        }
    }
}

/// A dense row of cells as yielded by [`crate::Sheet::next_row`]
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Row number, 0-based after skipped rows
    pub index: u64,
    /// Cells in this row; positions with no cell hold [`CellValue::None`]
    pub cells: Vec<CellValue>,
}

impl Row {
    pub(crate) fn new(index: u64, cells: Vec<CellValue>) -> Self {
        Row { index, cells }
    }

    /// Get cell at column index
    pub fn get(&self, col: usize) -> Option<&CellValue> {
        self.cells.get(col)
    }

    /// Get number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the row contains no non-empty cell
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|c| c.is_none())
    }
}

/// Worksheet extent in columns and rows.
///
/// Taken from the `<dimension>` element when present, otherwise derived
/// from the parsed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimension {
    pub columns: u64,
    pub rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_none() {
        assert_eq!(CellValue::default(), CellValue::None);
        assert!(CellValue::default().is_none());
    }

    #[test]
    fn test_payload_accessors() {
        assert_eq!(CellValue::Numeric(42.0).as_f64(), Some(42.0));
        assert_eq!(CellValue::Date(1640995200.0).as_f64(), Some(1640995200.0));
        assert_eq!(CellValue::Boolean(true).as_bool(), Some(true));
        assert_eq!(CellValue::StringRef(3).string_index(), Some(3));
        assert_eq!(CellValue::None.as_f64(), None);
    }

    #[test]
    fn test_row_emptiness() {
        let row = Row::new(0, vec![CellValue::None, CellValue::None]);
        assert!(row.is_empty());
        let row = Row::new(0, vec![CellValue::None, CellValue::Numeric(1.0)]);
        assert!(!row.is_empty());
    }
}
