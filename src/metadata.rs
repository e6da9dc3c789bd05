//! Workbook metadata: relationships, sheet index, styles and date formats.
//!
//! All parts here are small, so they are read whole (CRC-checked) and fed
//! byte-wise through [`ElementScanner`]s, except the styles part which is
//! streamed in chunks.

use crate::archive::ZipArchive;
use crate::error::{Result, SheetError};
use crate::xml::{unescape_in_place, AttrKind, ElementScanner};
use log::warn;
use std::collections::{HashMap, HashSet};

/// One worksheet as listed in the workbook part
#[derive(Debug, Clone)]
pub struct SheetEntry {
    /// `sheetId` attribute, unique per workbook
    pub sheet_id: u64,
    /// User-visible name, entity-decoded
    pub name: String,
    /// Relationship id joining the workbook to its relationship part
    pub rel_id: String,
    /// Archive path of the worksheet part, resolved from the relationships
    pub path: String,
}

/// Parsed workbook metadata
#[derive(Debug, Clone, Default)]
pub struct WorkbookMeta {
    pub workbook_path: String,
    pub shared_strings_path: Option<String>,
    pub styles_path: Option<String>,
    pub sheets: Vec<SheetEntry>,
    pub date1904: bool,
    pub date_styles: DateStyleSet,
}

/// Set of cell-format indices whose number format denotes a date or time
#[derive(Debug, Clone, Default)]
pub struct DateStyleSet {
    styles: HashSet<u64>,
}

impl DateStyleSet {
    pub fn is_date(&self, style: u64) -> bool {
        self.styles.contains(&style)
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}

/// Days between the Unix epoch and the 1900 Excel epoch
const EPOCH_OFFSET_1900: f64 = 25569.0;
/// Days between the Unix epoch and the 1904 Excel epoch
const EPOCH_OFFSET_1904: f64 = 24107.0;

/// Convert an Excel serial date to seconds since the Unix epoch.
///
/// Serials below 61 in 1900 mode are shifted up by one to compensate for
/// the 1900 leap-year bug Excel inherited from Lotus 1-2-3.
pub fn to_unix_timestamp(mut serial: f64, date1904: bool) -> f64 {
    let offset = if date1904 {
        EPOCH_OFFSET_1904
    } else {
        EPOCH_OFFSET_1900
    };
    if !date1904 && serial < 61.0 {
        serial += 1.0;
    }
    (serial - offset) * 86400.0
}

/// Load and resolve all workbook metadata from the archive
pub fn load(archive: &mut ZipArchive) -> Result<WorkbookMeta> {
    let mut meta = WorkbookMeta {
        workbook_path: parse_root_relationships(archive)?,
        ..Default::default()
    };
    parse_workbook(archive, &mut meta)?;
    parse_workbook_relationships(archive, &mut meta)?;
    if let Some(styles_path) = meta.styles_path.clone() {
        meta.date_styles = parse_styles(archive, &styles_path)?;
    }
    Ok(meta)
}

/// Find the workbook part through `_rels/.rels`
fn parse_root_relationships(archive: &mut ZipArchive) -> Result<String> {
    let entry = archive.require("_rels/.rels")?;
    let data = archive.read_part(&entry)?;

    let mut relationship = ElementScanner::new(
        "Relationship",
        &[("Target", AttrKind::Str), ("Type", AttrKind::Str)],
    );

    let mut workbook_path = String::new();
    let mut errors = 0;
    for &b in &data {
        relationship.feed(b);
        if relationship.completed() {
            if !relationship.has_value(0) || !relationship.has_value(1) {
                errors += 1;
                continue;
            }
            let ty = relationship.str_value(1);
            if ty.ends_with(b"officeDocument") {
                let target = String::from_utf8_lossy(relationship.str_value(0)).into_owned();
                workbook_path = target.strip_prefix('/').unwrap_or(&target).to_string();
            }
        }
    }
    if workbook_path.is_empty() {
        if errors > 0 {
            return Err(SheetError::MalformedMetadata(
                "failed to retrieve workbook path from root relationships".to_string(),
            ));
        }
        return Err(SheetError::MalformedMetadata(
            "root relationships name no office document".to_string(),
        ));
    }
    Ok(workbook_path)
}

/// Read the sheet index and the date mode from the workbook part
fn parse_workbook(archive: &mut ZipArchive, meta: &mut WorkbookMeta) -> Result<()> {
    let entry = archive.require(&meta.workbook_path)?;
    let data = archive.read_part(&entry)?;

    let mut sheets = ElementScanner::new("sheets", &[]);
    let mut sheet = ElementScanner::new(
        "sheet",
        &[
            ("name", AttrKind::Str),
            ("sheetId", AttrKind::Index),
            ("id", AttrKind::Str),
        ],
    );
    let mut workbook_pr = ElementScanner::new("workbookPr", &[("date1904", AttrKind::Str)]);

    for &b in &data {
        sheets.feed(b);
        if sheets.inside() {
            sheet.feed(b);
            if sheet.completed() {
                if !sheet.has_value(0) || !sheet.has_value(1) || !sheet.has_value(2) {
                    warn!("workbook sheet entry with missing attributes, skipping");
                    continue;
                }
                let mut name = sheet.str_value(0).to_vec();
                unescape_in_place(&mut name);
                meta.sheets.push(SheetEntry {
                    sheet_id: sheet.index_value(1),
                    name: String::from_utf8_lossy(&name).into_owned(),
                    rel_id: String::from_utf8_lossy(sheet.str_value(2)).into_owned(),
                    path: String::new(),
                });
            }
        }
        workbook_pr.feed(b);
        if workbook_pr.completed() && workbook_pr.has_value(0) {
            let val = workbook_pr.str_value(0);
            if val != b"false" && val != b"0" {
                meta.date1904 = true;
            }
        }
    }

    if meta.sheets.is_empty() {
        return Err(SheetError::MalformedMetadata(
            "workbook lists no sheets".to_string(),
        ));
    }
    Ok(())
}

/// Resolve worksheet, shared-string and style paths from the workbook
/// relationship part
fn parse_workbook_relationships(archive: &mut ZipArchive, meta: &mut WorkbookMeta) -> Result<()> {
    // the workbook is rarely at the top level, but account for it
    let workbook_dir = match meta.workbook_path.rfind('/') {
        Some(pos) => &meta.workbook_path[..pos + 1],
        None => "",
    };
    let rels_path = format!("{}_rels/workbook.xml.rels", workbook_dir);
    let entry = archive.require(&rels_path)?;
    let data = archive.read_part(&entry)?;

    let mut relationship = ElementScanner::new(
        "Relationship",
        &[
            ("Target", AttrKind::Str),
            ("Type", AttrKind::Str),
            ("Id", AttrKind::Str),
        ],
    );

    let resolve = |target: &[u8]| -> String {
        let target = String::from_utf8_lossy(target);
        match target.strip_prefix('/') {
            Some(absolute) => absolute.to_string(),
            None => format!("{}{}", workbook_dir, target),
        }
    };

    let mut errors = 0;
    for &b in &data {
        relationship.feed(b);
        if relationship.completed() {
            if !relationship.has_value(0) || !relationship.has_value(1) || !relationship.has_value(2)
            {
                errors += 1;
                continue;
            }
            let ty = relationship.str_value(1);
            if ty.ends_with(b"/worksheet") {
                let id = relationship.str_value(2);
                for sheet in &mut meta.sheets {
                    if sheet.rel_id.as_bytes() == id {
                        sheet.path = resolve(relationship.str_value(0));
                    }
                }
            } else if ty.ends_with(b"/sharedStrings") {
                meta.shared_strings_path = Some(resolve(relationship.str_value(0)));
            } else if ty.ends_with(b"/styles") {
                meta.styles_path = Some(resolve(relationship.str_value(0)));
            }
        }
    }

    if errors > 0 {
        warn!(
            "{} workbook relationship entries had missing attributes",
            errors
        );
        let sheet_paths_ok = meta.sheets.iter().all(|s| !s.path.is_empty());
        if meta.shared_strings_path.is_none() || meta.styles_path.is_none() || !sheet_paths_ok {
            return Err(SheetError::MalformedMetadata(
                "errors while reading workbook relationships".to_string(),
            ));
        }
    }
    Ok(())
}

/// Built-in number format ids that denote dates or times
fn builtin_is_date(fmt: u64) -> bool {
    matches!(fmt, 14..=22 | 27..=36 | 45..=47 | 50..=58 | 71..=81)
}

/// Custom format codes denote dates when they contain any of these letters
fn code_is_date(code: &[u8]) -> bool {
    code.iter()
        .any(|c| matches!(c, b'd' | b'D' | b'm' | b'M' | b'y' | b'Y' | b'h' | b'H' | b's' | b'S'))
}

/// Stream the styles part and classify cell formats as dates
fn parse_styles(archive: &mut ZipArchive, path: &str) -> Result<DateStyleSet> {
    let entry = archive.require(path)?;

    let mut cell_xfs = ElementScanner::new("cellXfs", &[]);
    let mut xf = ElementScanner::new("xf", &[("numFmtId", AttrKind::Index)]);
    let mut num_fmts = ElementScanner::new("numFmts", &[]);
    let mut num_fmt = ElementScanner::new(
        "numFmt",
        &[("numFmtId", AttrKind::Index), ("formatCode", AttrKind::Str)],
    );

    let mut xf_mapping: HashMap<u64, u64> = HashMap::new();
    let mut xf_count: u64 = 0;
    let mut custom_date_formats: HashSet<u64> = HashSet::new();

    let mut reader = archive.part_reader(&entry)?;
    let mut chunk = [0u8; 32 * 1024];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        for &b in &chunk[..read] {
            cell_xfs.feed(b);
            if cell_xfs.inside() {
                xf.feed(b);
                if xf.completed() {
                    if xf.has_value(0) {
                        xf_mapping.insert(xf_count, xf.index_value(0));
                    }
                    xf_count += 1;
                }
            }
            num_fmts.feed(b);
            if num_fmts.inside() {
                num_fmt.feed(b);
                if num_fmt.completed() {
                    if !num_fmt.has_value(0) || !num_fmt.has_value(1) {
                        continue;
                    }
                    if code_is_date(num_fmt.str_value(1)) {
                        custom_date_formats.insert(num_fmt.index_value(0));
                    }
                }
            }
        }
    }
    if !reader.crc_matches() {
        return Err(SheetError::BadArchive(format!(
            "CRC-32 mismatch in {}",
            path
        )));
    }

    let mut styles = HashSet::new();
    for (xf_index, fmt) in &xf_mapping {
        if builtin_is_date(*fmt) || custom_date_formats.contains(fmt) {
            styles.insert(*xf_index);
        }
    }
    Ok(DateStyleSet { styles })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_date_ranges() {
        for id in [14, 22, 27, 36, 45, 47, 50, 58, 71, 81] {
            assert!(builtin_is_date(id), "id {}", id);
        }
        for id in [0, 1, 13, 23, 26, 37, 44, 48, 49, 59, 70, 82, 164] {
            assert!(!builtin_is_date(id), "id {}", id);
        }
    }

    #[test]
    fn test_custom_code_classification() {
        assert!(code_is_date(b"yyyy-mm-dd"));
        assert!(code_is_date(b"[$-409]h:MM AM/PM"));
        assert!(!code_is_date(b"#,##0.00"));
        assert!(!code_is_date(b"0.00%"));
    }

    #[test]
    fn test_date_conversion_1900() {
        // serial 61 is 1900-03-01, past the phantom leap day
        assert_eq!(to_unix_timestamp(61.0, false), -2203891200.0);
        // serial 1 is 1900-01-01, shifted around the leap-year bug
        assert_eq!(to_unix_timestamp(1.0, false), -2208988800.0);
        // serial 44562 is 2022-01-01
        assert_eq!(to_unix_timestamp(44562.0, false), 1640995200.0);
    }

    #[test]
    fn test_date_conversion_1904() {
        // serial 0 is 1904-01-01
        assert_eq!(to_unix_timestamp(0.0, true), -2082844800.0);
    }
}
