//! Error types for the sheetpipe library

use thiserror::Error;

/// Result type alias for sheetpipe operations
pub type Result<T> = std::result::Result<T, SheetError>;

/// Main error type for all workbook operations
#[derive(Error, Debug)]
pub enum SheetError {
    /// The ZIP container is corrupt or not a ZIP file at all
    #[error("Corrupt archive: {0}")]
    BadArchive(String),

    /// A required archive part is missing
    #[error("Missing archive part: {0}")]
    MissingPart(String),

    /// Workbook metadata (relationships, workbook, styles) could not be parsed
    #[error("Malformed workbook metadata: {0}")]
    MalformedMetadata(String),

    /// The DEFLATE stream of a part could not be decompressed
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// The shared-string table does not match its declared size, or a string
    /// index is out of bounds
    #[error("Shared string table inconsistent: wanted {wanted}, have {have}")]
    InconsistentSharedStrings { wanted: u64, have: u64 },

    /// A cell or attribute value exceeded its scratch buffer
    #[error("Value exceeded scratch buffer of {limit} bytes")]
    ValueOverflow { limit: usize },

    /// A cell typed numeric in the source did not parse as a number
    #[error("Failed to parse number: {0}")]
    NumberParse(String),

    /// The worksheet or string table violated a structural expectation
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Requested sheet does not exist in the workbook
    #[error("Sheet '{sheet}' not found. Available sheets: {available}")]
    SheetNotFound { sheet: String, available: String },

    /// Parsing was canceled through the cancel token
    #[error("Parse canceled")]
    Canceled,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
