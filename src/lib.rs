//! # sheetpipe
//!
//! A high-throughput streaming reader for XLSX workbooks.
//!
//! ## Features
//!
//! - **Pipelined parsing**: one producer decompresses the worksheet into a
//!   bounded ring of buffers while a pool of workers extracts cells
//!   concurrently
//! - **Typed cells**: numbers, shared and inline strings, booleans,
//!   errors and dates with 1900/1904 handling, each a compact 8-byte
//!   payload
//! - **Row streaming**: rows are merged back into worksheet order and
//!   yielded one at a time, dense and column-aligned
//! - **Background shared strings**: the string table loads on its own
//!   thread with its own archive handle, gated by a progress counter
//! - **Type coercions**: per-column or per-header-name overrides, with
//!   skip support
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sheetpipe::{CellValue, Workbook};
//!
//! # fn main() -> sheetpipe::Result<()> {
//! let mut workbook = Workbook::open("data.xlsx")?;
//! workbook.parse_shared_strings()?;
//!
//! let mut sheet = workbook.sheet("Sheet1")?;
//! sheet.parse(0)?; // 0 = pick a thread count automatically
//!
//! while let Some(row) = sheet.next_row() {
//!     for cell in &row.cells {
//!         match cell {
//!             CellValue::Numeric(v) => print!("{} ", v),
//!             CellValue::StringRef(i) => print!("{} ", workbook.shared_string(*i)?),
//!             CellValue::String(i) | CellValue::InlineString(i) => {
//!                 print!("{} ", sheet.dynamic_string(*i)?)
//!             }
//!             _ => print!("? "),
//!         }
//!     }
//!     println!();
//! }
//! workbook.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod error;
pub mod metadata;
pub mod sheet;
pub mod strings;
pub mod types;
pub mod workbook;
pub mod xml;

mod pipeline;

pub use error::{Result, SheetError};
pub use sheet::{CancelToken, Rows, Sheet};
pub use strings::{decode_dynamic, encode_dynamic, DynamicStrings, SharedStrings};
pub use types::{CellType, CellValue, Dimension, Row};
pub use workbook::Workbook;
