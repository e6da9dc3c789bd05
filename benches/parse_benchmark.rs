use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sheetpipe::Workbook;
use std::io::Write;
use tempfile::NamedTempFile;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Build a workbook with `rows` rows of mixed numeric and string cells
fn build_fixture(rows: usize) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    let mut zip = ZipWriter::new(file.reopen().unwrap());
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("_rels/.rels", options).unwrap();
    zip.write_all(
        b"<Relationships><Relationship Id=\"rId1\" \
          Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" \
          Target=\"xl/workbook.xml\"/></Relationships>",
    )
    .unwrap();
    zip.start_file("xl/workbook.xml", options).unwrap();
    zip.write_all(
        b"<workbook xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
          <sheets><sheet name=\"Sheet1\" sheetId=\"1\" r:id=\"rId1\"/></sheets></workbook>",
    )
    .unwrap();
    zip.start_file("xl/_rels/workbook.xml.rels", options).unwrap();
    zip.write_all(
        b"<Relationships><Relationship Id=\"rId1\" \
          Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" \
          Target=\"worksheets/sheet1.xml\"/><Relationship Id=\"rId2\" \
          Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings\" \
          Target=\"sharedStrings.xml\"/></Relationships>",
    )
    .unwrap();
    zip.start_file("xl/sharedStrings.xml", options).unwrap();
    zip.write_all(
        b"<sst count=\"2\" uniqueCount=\"2\"><si><t>alpha</t></si><si><t>beta</t></si></sst>",
    )
    .unwrap();

    zip.start_file("xl/worksheets/sheet1.xml", options).unwrap();
    let mut sheet = String::with_capacity(rows * 96);
    sheet.push_str("<worksheet><sheetData>");
    for r in 1..=rows {
        sheet.push_str(&format!(
            "<row r=\"{r}\"><c r=\"A{r}\"><v>{}</v></c>\
             <c r=\"B{r}\" t=\"s\"><v>{}</v></c>\
             <c r=\"C{r}\"><v>{}.25</v></c></row>",
            r * 7,
            r % 2,
            r
        ));
    }
    sheet.push_str("</sheetData></worksheet>");
    zip.write_all(sheet.as_bytes()).unwrap();
    zip.finish().unwrap();
    file
}

fn benchmark_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.sample_size(10);

    let fixture = build_fixture(50_000);
    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let mut workbook = Workbook::open(fixture.path()).unwrap();
                    workbook.parse_shared_strings().unwrap();
                    let mut sheet = workbook.sheet("Sheet1").unwrap();
                    sheet.parse(threads).unwrap();
                    let mut count = 0usize;
                    while let Some(row) = sheet.next_row() {
                        count += row.cells.len();
                    }
                    workbook.finalize().unwrap();
                    black_box(count)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_parse);
criterion_main!(benches);
