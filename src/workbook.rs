//! Workbook handle: archive access, metadata, shared strings and sheet
//! lookup.

use crate::archive::ZipArchive;
use crate::error::{Result, SheetError};
use crate::metadata::{self, DateStyleSet, SheetEntry, WorkbookMeta};
use crate::sheet::Sheet;
use crate::strings::{load_shared_strings, SharedStrings};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

/// An opened XLSX workbook.
///
/// Opening parses all metadata up front (relationships, sheet index,
/// styles). The shared-string table is loaded separately through
/// [`parse_shared_strings`](Self::parse_shared_strings), on a background
/// thread with its own archive handle unless parallelism is disabled.
pub struct Workbook {
    archive: ZipArchive,
    meta: WorkbookMeta,
    shared: Arc<SharedStrings>,
    parallel_strings: bool,
    strings_started: bool,
    strings_thread: Option<JoinHandle<Result<()>>>,
}

impl Workbook {
    /// Open an archive and parse its metadata
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut archive = ZipArchive::open(path)?;
        let meta = metadata::load(&mut archive)?;
        info!(
            "opened workbook '{}' with {} sheets",
            meta.workbook_path,
            meta.sheets.len()
        );
        Ok(Workbook {
            archive,
            meta,
            shared: Arc::new(SharedStrings::new()),
            parallel_strings: true,
            strings_started: false,
            strings_thread: None,
        })
    }

    /// Choose whether the shared-string table loads on a background
    /// thread. Must be set before
    /// [`parse_shared_strings`](Self::parse_shared_strings).
    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel_strings = parallel;
    }

    pub(crate) fn parallel_strings(&self) -> bool {
        self.parallel_strings
    }

    /// Kick off the shared-string loader. A workbook without a
    /// shared-string part completes immediately.
    ///
    /// In parallel mode the loader runs against a second handle on the
    /// archive so the worksheet producer never shares a decompressor with
    /// it; failures to set that up degrade to in-thread loading with a
    /// warning.
    pub fn parse_shared_strings(&mut self) -> Result<()> {
        if self.strings_started {
            return Ok(());
        }
        self.strings_started = true;
        let Some(path) = self.meta.shared_strings_path.clone() else {
            self.shared.finish();
            return Ok(());
        };

        if self.parallel_strings {
            match self.archive.reopen() {
                Ok(mut second) => {
                    let table = Arc::clone(&self.shared);
                    let spawned = std::thread::Builder::new()
                        .name("sheetpipe-strings".to_string())
                        .spawn(move || load_shared_strings(&mut second, &path, &table));
                    match spawned {
                        Ok(handle) => {
                            self.strings_thread = Some(handle);
                            return Ok(());
                        }
                        Err(e) => warn!("failed to spawn shared-string loader: {}", e),
                    }
                }
                Err(e) => warn!("failed to reopen archive for shared strings: {}", e),
            }
            // degrade to loading on this thread
        }
        let path = self
            .meta
            .shared_strings_path
            .clone()
            .unwrap_or_default();
        load_shared_strings(&mut self.archive, &path, &self.shared)
    }

    /// Join the background string loader and surface its error, if any
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(handle) = self.strings_thread.take() {
            handle.join().map_err(|_| {
                SheetError::ProtocolViolation("shared-string loader panicked".to_string())
            })??;
        }
        Ok(())
    }

    /// User-visible sheet names in workbook order
    pub fn sheet_names(&self) -> Vec<String> {
        self.meta.sheets.iter().map(|s| s.name.clone()).collect()
    }

    /// Sheet entries as listed in the workbook part
    pub fn sheets(&self) -> &[SheetEntry] {
        &self.meta.sheets
    }

    /// Look up a sheet by its user-visible name
    pub fn sheet(&self, name: &str) -> Result<Sheet<'_>> {
        match self.meta.sheets.iter().find(|s| s.name == name) {
            Some(entry) => self.sheet_from_entry(entry),
            None => Err(SheetError::SheetNotFound {
                sheet: name.to_string(),
                available: self.sheet_names().join(", "),
            }),
        }
    }

    /// Look up a sheet by its `sheetId`
    pub fn sheet_by_id(&self, id: u64) -> Result<Sheet<'_>> {
        match self.meta.sheets.iter().find(|s| s.sheet_id == id) {
            Some(entry) => self.sheet_from_entry(entry),
            None => Err(SheetError::SheetNotFound {
                sheet: format!("sheetId {}", id),
                available: self.sheet_names().join(", "),
            }),
        }
    }

    /// First sheet in workbook order
    pub fn first_sheet(&self) -> Result<Sheet<'_>> {
        match self.meta.sheets.first() {
            Some(entry) => self.sheet_from_entry(entry),
            None => Err(SheetError::MalformedMetadata(
                "workbook lists no sheets".to_string(),
            )),
        }
    }

    fn sheet_from_entry(&self, entry: &SheetEntry) -> Result<Sheet<'_>> {
        if entry.path.is_empty() {
            return Err(SheetError::MalformedMetadata(format!(
                "sheet '{}' has no worksheet relationship",
                entry.name
            )));
        }
        let part = self.archive.require(&entry.path)?;
        Ok(Sheet::new(self, part, entry.name.clone()))
    }

    /// Fetch a shared string, blocking until the loader has passed it
    pub fn shared_string(&self, index: u64) -> Result<String> {
        self.shared.get(index, None)
    }

    /// Number of shared strings loaded so far (−1 once loading finished)
    pub fn shared_string_progress(&self) -> i64 {
        self.shared.progress()
    }

    /// Whether dates count from the 1904 epoch
    pub fn date1904(&self) -> bool {
        self.meta.date1904
    }

    pub(crate) fn archive(&self) -> &ZipArchive {
        &self.archive
    }

    pub(crate) fn date_styles(&self) -> &DateStyleSet {
        &self.meta.date_styles
    }

    pub(crate) fn shared_table(&self) -> &SharedStrings {
        &self.shared
    }
}
