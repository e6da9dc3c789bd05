//! The pipelined worksheet extractor: decompression producer, ring of
//! shared buffers, worker parsers and the row merger.

pub(crate) mod merge;
pub(crate) mod ring;
pub(crate) mod worker;

#[cfg(test)]
mod tests {
    use crate::metadata::DateStyleSet;
    use crate::pipeline::merge::RowMerger;
    use crate::pipeline::ring::BufferRing;
    use crate::pipeline::worker::{run_worker, CoercionState, ParseContext, SharedDims};
    use crate::strings::{DynamicStrings, SharedStrings};
    use crate::types::{CellValue, Row};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Drive the whole pipeline over raw worksheet bytes with a chosen
    /// worker count and chunk size, collecting the merged rows and the
    /// per-worker string arenas.
    fn parse_xml(
        xml: &str,
        workers: usize,
        chunk: usize,
        buffers: usize,
    ) -> (Vec<Row>, DynamicStrings) {
        let terminate = Arc::new(AtomicBool::new(false));
        let ring = BufferRing::new(workers, buffers, chunk, terminate);
        let dims = SharedDims::default();
        let shared = SharedStrings::new();
        shared.finish();
        let date_styles = DateStyleSet::default();
        let coercions = CoercionState::new(HashMap::new(), HashMap::new(), 1, workers);
        let ctx = ParseContext {
            ring: &ring,
            skip_rows: 0,
            skip_columns: 0,
            date_styles: &date_styles,
            date1904: false,
            shared: &shared,
            coercions: &coercions,
            dims: &dims,
        };

        let mut outputs = std::thread::scope(|scope| {
            let ring_ref = &ring;
            let producer = scope.spawn(move || {
                let mut source = Cursor::new(xml.as_bytes().to_vec());
                ring_ref.produce(&mut source)
            });
            let ctx_ref = &ctx;
            let handles: Vec<_> = (0..workers)
                .map(|k| scope.spawn(move || run_worker(k, ctx_ref)))
                .collect();
            producer.join().expect("producer panicked").expect("producer failed");
            handles
                .into_iter()
                .map(|h| h.join().expect("worker panicked"))
                .collect::<Vec<_>>()
        });

        let mut max_column = 0;
        let mut arenas = Vec::with_capacity(outputs.len());
        let mut fragments = Vec::with_capacity(outputs.len());
        for output in outputs.drain(..) {
            assert!(output.error.is_none(), "worker error: {:?}", output.error);
            max_column = max_column.max(output.max_column);
            arenas.push(output.arena);
            fragments.push(output.fragments);
        }
        let columns = dims.captured().map(|(c, _)| c).unwrap_or(max_column);
        let mut merger = RowMerger::new(fragments, columns, 0, 0);
        let mut rows = Vec::new();
        while let Some(row) = merger.next_row() {
            rows.push(row);
        }
        (rows, DynamicStrings::from_arenas(arenas))
    }

    /// Render rows with dynamic strings resolved so outputs compare by
    /// content regardless of which worker interned what
    fn render(rows: &[Row], dynamic: &DynamicStrings) -> Vec<(u64, Vec<String>)> {
        rows.iter()
            .map(|row| {
                let cells = row
                    .cells
                    .iter()
                    .map(|cell| match cell {
                        CellValue::String(i) => {
                            format!("str:{}", dynamic.get_encoded(*i).unwrap())
                        }
                        CellValue::InlineString(i) => {
                            format!("inline:{}", dynamic.get_encoded(*i).unwrap())
                        }
                        other => format!("{:?}", other),
                    })
                    .collect();
                (row.index, cells)
            })
            .collect()
    }

    fn parse_rendered(
        xml: &str,
        workers: usize,
        chunk: usize,
        buffers: usize,
    ) -> Vec<(u64, Vec<String>)> {
        let (rows, dynamic) = parse_xml(xml, workers, chunk, buffers);
        render(&rows, &dynamic)
    }

    fn sheet(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <worksheet><sheetData>{}</sheetData></worksheet>",
            body
        )
    }

    const FIXTURE: &str = "<row r=\"1\"><c r=\"A1\"><v>11</v></c>\
                           <c r=\"B1\" t=\"s\"><v>0</v></c>\
                           <c r=\"D1\" t=\"b\"><v>1</v></c></row>\
                           <row r=\"2\"><c r=\"A2\"><v>3.5</v></c>\
                           <c r=\"B2\" t=\"str\"><v>a&amp;b</v></c></row>\
                           <row r=\"4\"><c r=\"C4\"><v>-7e2</v></c></row>";

    #[test]
    fn test_single_threaded_reference() {
        let xml = sheet(FIXTURE);
        let (rows, dynamic) = parse_xml(&xml, 1, 1 << 16, 4);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].cells[0], CellValue::Numeric(11.0));
        assert_eq!(rows[0].cells[1], CellValue::StringRef(0));
        assert_eq!(rows[0].cells[2], CellValue::None);
        assert_eq!(rows[0].cells[3], CellValue::Boolean(true));
        assert_eq!(rows[1].cells[0], CellValue::Numeric(3.5));
        let CellValue::String(encoded) = rows[1].cells[1] else {
            panic!("expected dynamic string");
        };
        assert_eq!(dynamic.get_encoded(encoded).unwrap(), "a&b");
        assert!(rows[2].is_empty());
        assert_eq!(rows[3].cells[2], CellValue::Numeric(-700.0));
    }

    /// Chunk boundaries at every offset must not change the output
    /// (exercises the cell and row continuation machinery).
    #[test]
    fn test_boundary_invariance_across_chunk_sizes() {
        let xml = sheet(FIXTURE);
        let expected = parse_rendered(&xml, 1, 1 << 16, 4);
        for chunk in 1..=96 {
            let buffers = xml.len() / chunk + 8;
            for workers in [1, 2, 3] {
                let rows = parse_rendered(&xml, workers, chunk, buffers);
                assert_eq!(
                    rows, expected,
                    "diverged at chunk={} workers={}",
                    chunk, workers
                );
            }
        }
    }

    /// Same input, any thread count: identical output
    #[test]
    fn test_determinism_across_thread_counts() {
        let body: String = (1..=40)
            .map(|r| {
                format!(
                    "<row r=\"{r}\"><c r=\"A{r}\"><v>{r}</v></c>\
                     <c r=\"B{r}\" t=\"str\"><v>text{r}</v></c></row>"
                )
            })
            .collect();
        let xml = sheet(&body);
        let expected = parse_rendered(&xml, 1, 1 << 16, 64);
        assert_eq!(expected.len(), 40);
        for workers in [1, 2, 4, 8] {
            let rows = parse_rendered(&xml, workers, 64, 128);
            assert_eq!(rows, expected, "workers={}", workers);
        }
    }

    #[test]
    fn test_dimension_capture() {
        let xml = "<worksheet><dimension ref=\"A1:C9\"/>\
                   <sheetData><row r=\"1\"><c r=\"A1\"><v>5</v></c></row>\
                   </sheetData></worksheet>";
        let terminate = Arc::new(AtomicBool::new(false));
        let ring = BufferRing::new(1, 8, 1 << 16, terminate);
        let dims = SharedDims::default();
        let shared = SharedStrings::new();
        shared.finish();
        let date_styles = DateStyleSet::default();
        let coercions = CoercionState::new(HashMap::new(), HashMap::new(), 1, 1);
        let ctx = ParseContext {
            ring: &ring,
            skip_rows: 0,
            skip_columns: 0,
            date_styles: &date_styles,
            date1904: false,
            shared: &shared,
            coercions: &coercions,
            dims: &dims,
        };
        std::thread::scope(|scope| {
            let ring_ref = &ring;
            scope.spawn(move || {
                let mut source = Cursor::new(xml.as_bytes().to_vec());
                ring_ref.produce(&mut source).unwrap();
            });
            run_worker(0, &ctx);
        });
        assert_eq!(dims.captured(), Some((3, 9)));
    }

    #[test]
    fn test_inline_strings_concatenate_runs() {
        let xml = sheet(
            "<row r=\"1\"><c r=\"A1\" t=\"inlineStr\">\
             <is><r><t>foo</t></r><r><t> bar</t></r></is></c></row>",
        );
        let (rows, dynamic) = parse_xml(&xml, 1, 1 << 16, 4);
        assert_eq!(rows.len(), 1);
        let CellValue::InlineString(encoded) = rows[0].cells[0] else {
            panic!("expected inline string");
        };
        assert_eq!(dynamic.get_encoded(encoded).unwrap(), "foo bar");
    }

    #[test]
    fn test_rows_without_numbers_use_sentinels() {
        let xml = sheet(
            "<row><c><v>1</v></c><c><v>2</v></c></row>\
             <row><c><v>3</v></c></row>",
        );
        let (rows, _) = parse_xml(&xml, 1, 1 << 16, 4);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cells[0], CellValue::Numeric(1.0));
        assert_eq!(rows[0].cells[1], CellValue::Numeric(2.0));
        assert_eq!(rows[1].cells[0], CellValue::Numeric(3.0));
    }

    /// A pre-set terminate flag unwinds producer and workers promptly
    #[test]
    fn test_cancellation_unwinds_pipeline() {
        let terminate = Arc::new(AtomicBool::new(true));
        let ring = BufferRing::new(2, 8, 16, Arc::clone(&terminate));
        let dims = SharedDims::default();
        let shared = SharedStrings::new();
        shared.finish();
        let date_styles = DateStyleSet::default();
        let coercions = CoercionState::new(HashMap::new(), HashMap::new(), 1, 2);
        let ctx = ParseContext {
            ring: &ring,
            skip_rows: 0,
            skip_columns: 0,
            date_styles: &date_styles,
            date1904: false,
            shared: &shared,
            coercions: &coercions,
            dims: &dims,
        };
        let xml = sheet("<row r=\"1\"><c r=\"A1\"><v>1</v></c></row>");
        std::thread::scope(|scope| {
            let ring_ref = &ring;
            let producer = scope.spawn(move || {
                let mut source = Cursor::new(xml.as_bytes().to_vec());
                ring_ref.produce(&mut source)
            });
            let ctx_ref = &ctx;
            let workers: Vec<_> = (0..2)
                .map(|k| scope.spawn(move || run_worker(k, ctx_ref)))
                .collect();
            assert!(producer.join().unwrap().is_err());
            for handle in workers {
                let output = handle.join().unwrap();
                assert!(matches!(
                    output.error,
                    Some(crate::error::SheetError::Canceled)
                ));
            }
        });
    }
}
