//! Byte-driven XML element recognizer and attribute value parsers.
//!
//! This is not a general XML parser. Each [`ElementScanner`] is configured
//! with a single element local-name and a fixed set of attribute names and
//! recognizes occurrences of that element in a byte stream, one byte at a
//! time, while ignoring everything else. Namespace prefixes on element
//! names are stripped by restarting the name match after a `:`. Attribute
//! values must be quoted in `"`.
//!
//! The scanners tolerate being fed a stream that starts in the middle of
//! the document: they stay outside until the next `<` and synchronize from
//! there.

use crate::types::CellType;

/// Attribute value parser kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    /// Unsigned decimal integer
    Index,
    /// Bounded ASCII/UTF-8 string
    Str,
    /// A1 location: letters accumulate a base-26 column, digits a row
    Location,
    /// Two locations separated by `:`
    Range,
    /// Single-letter cell type code
    Type,
}

/// Inline capacity of [`StringAttr`]; longer values are truncated.
/// Attribute values here are filenames, relationship ids and format codes,
/// none of which approach this limit.
const STRING_ATTR_CAPACITY: usize = 256;

#[derive(Debug)]
struct IndexAttr {
    value: u64,
}

#[derive(Debug)]
struct StringAttr {
    buf: [u8; STRING_ATTR_CAPACITY],
    len: usize,
}

#[derive(Debug)]
struct LocationAttr {
    column: u64,
    row: u64,
}

#[derive(Debug)]
struct RangeAttr {
    start: LocationAttr,
    end: LocationAttr,
    in_end: bool,
}

#[derive(Debug)]
struct TypeAttr {
    ty: CellType,
}

impl LocationAttr {
    fn feed(&mut self, b: u8) {
        if b.is_ascii_alphabetic() {
            // 'A' is 65, so subtracting 64 maps A..Z to 1..26
            self.column = self
                .column
                .wrapping_mul(26)
                .wrapping_add(u64::from(b.wrapping_sub(64)));
        } else {
            self.row = self
                .row
                .wrapping_mul(10)
                .wrapping_add(u64::from(b.wrapping_sub(b'0')));
        }
    }

    fn reset(&mut self) {
        self.column = 0;
        self.row = 0;
    }
}

/// One attribute slot of an [`ElementScanner`]
#[derive(Debug)]
enum AttrValue {
    Index(IndexAttr),
    Str(StringAttr),
    Location(LocationAttr),
    Range(RangeAttr),
    Type(TypeAttr),
}

impl AttrValue {
    fn new(kind: AttrKind) -> Self {
        match kind {
            AttrKind::Index => AttrValue::Index(IndexAttr { value: 0 }),
            AttrKind::Str => AttrValue::Str(StringAttr {
                buf: [0; STRING_ATTR_CAPACITY],
                len: 0,
            }),
            AttrKind::Location => AttrValue::Location(LocationAttr { column: 0, row: 0 }),
            AttrKind::Range => AttrValue::Range(RangeAttr {
                start: LocationAttr { column: 0, row: 0 },
                end: LocationAttr { column: 0, row: 0 },
                in_end: false,
            }),
            AttrKind::Type => AttrValue::Type(TypeAttr { ty: CellType::None }),
        }
    }

    fn feed(&mut self, b: u8) {
        match self {
            AttrValue::Index(a) => {
                a.value = a
                    .value
                    .wrapping_mul(10)
                    .wrapping_add(u64::from(b.wrapping_sub(b'0')));
            }
            AttrValue::Str(a) => {
                if a.len < STRING_ATTR_CAPACITY {
                    a.buf[a.len] = b;
                    a.len += 1;
                }
            }
            AttrValue::Location(a) => a.feed(b),
            AttrValue::Range(a) => {
                if b == b':' {
                    a.in_end = true;
                } else if a.in_end {
                    a.end.feed(b);
                } else {
                    a.start.feed(b);
                }
            }
            AttrValue::Type(a) => {
                if a.ty == CellType::None {
                    a.ty = match b {
                        b'b' => CellType::Boolean,
                        b'd' => CellType::Date,
                        b'e' => CellType::Error,
                        b'n' => CellType::Numeric,
                        b's' => CellType::StringRef,
                        b'i' => CellType::StringInline,
                        _ => CellType::None,
                    };
                } else if a.ty == CellType::StringRef && b == b't' {
                    // "str" is an inline formula string, not a table reference
                    a.ty = CellType::String;
                }
            }
        }
    }

    fn reset(&mut self) {
        match self {
            AttrValue::Index(a) => a.value = 0,
            AttrValue::Str(a) => a.len = 0,
            AttrValue::Location(a) => a.reset(),
            AttrValue::Range(a) => {
                a.start.reset();
                a.end.reset();
                a.in_end = false;
            }
            AttrValue::Type(a) => a.ty = CellType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    Start,
    StartName,
    AttrName,
    AttrValue,
    Inside,
    End,
    EndName,
}

/// Streaming recognizer for one XML element.
///
/// Feed the document one byte at a time with [`feed`](Self::feed) and poll
/// the one-shot latches [`completed_start`](Self::completed_start) and
/// [`completed`](Self::completed) after each byte. A self-closing tag
/// raises both.
pub struct ElementScanner {
    name: &'static [u8],
    scan: i32,
    attr_names: Vec<&'static [u8]>,
    attr_values: Vec<AttrValue>,
    attr_scan: Vec<i32>,
    attr_flags: Vec<bool>,
    current_attr: Option<usize>,
    prev_close_slash: bool,
    close_length: usize,
    state: State,
    // 0 = nothing, 1 = start tag seen, 2 = full element seen
    completed: u8,
}

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\n' || b == b'\r'
}

impl ElementScanner {
    /// Create a scanner for `name` with the given attribute set.
    pub fn new(name: &'static str, attrs: &[(&'static str, AttrKind)]) -> Self {
        ElementScanner {
            name: name.as_bytes(),
            scan: -1,
            attr_names: attrs.iter().map(|(n, _)| n.as_bytes()).collect(),
            attr_values: attrs.iter().map(|(_, k)| AttrValue::new(*k)).collect(),
            attr_scan: vec![0; attrs.len()],
            attr_flags: vec![false; attrs.len()],
            current_attr: None,
            prev_close_slash: false,
            close_length: 0,
            state: State::Outside,
            completed: 0,
        }
    }

    /// Process one input byte.
    pub fn feed(&mut self, b: u8) {
        match self.state {
            State::Outside => {
                if b == b'<' {
                    self.state = State::Start;
                }
            }
            State::Start => {
                // skip whitespace before the name, not legal XML but cheap to allow
                if is_ws(b) {
                    return;
                }
                self.prev_close_slash = false;
                self.state = State::StartName;
                self.scan = 0;
                self.feed_start_name(b);
            }
            State::StartName => self.feed_start_name(b),
            State::AttrName => self.feed_attr_name(b),
            State::AttrValue => self.feed_attr_value(b),
            State::Inside => {
                if b == b'<' {
                    self.state = State::End;
                    self.close_length = 1;
                }
            }
            State::End => {
                if b == b'/' {
                    self.state = State::EndName;
                    self.scan = 0;
                    self.close_length += 1;
                } else {
                    self.state = State::Inside;
                }
            }
            State::EndName => self.feed_end_name(b),
        }
    }

    fn feed_start_name(&mut self, b: u8) {
        if b == b'>' || b == b'/' || is_ws(b) {
            if self.scan == self.name.len() as i32 {
                self.completed = 0;
                if b == b'>' {
                    if self.prev_close_slash {
                        self.completed = 2;
                        self.close_length = 0;
                        self.state = State::Outside;
                    } else {
                        self.state = State::Inside;
                    }
                } else if b == b'/' {
                    self.prev_close_slash = true;
                } else {
                    self.state = State::AttrName;
                }
                for f in &mut self.attr_flags {
                    *f = false;
                }
                for s in &mut self.attr_scan {
                    *s = 0;
                }
                for v in &mut self.attr_values {
                    v.reset();
                }
            } else {
                self.state = State::Outside;
            }
            return;
        }
        if b == b':' {
            // namespace prefix, restart the name match
            self.scan = 0;
            return;
        }
        if self.scan < 0 {
            return;
        }
        if (self.scan as usize) < self.name.len() {
            if b == self.name[self.scan as usize] {
                self.scan += 1;
            } else {
                self.scan = -1;
            }
        } else {
            self.scan = -1;
        }
    }

    fn feed_attr_name(&mut self, b: u8) {
        if b == b'>' {
            if self.prev_close_slash {
                self.completed = 2;
                self.close_length = 0;
                self.state = State::Outside;
            } else {
                self.completed = 1;
                self.state = State::Inside;
            }
        }
        self.prev_close_slash = b == b'/';
        if self.attr_names.is_empty() {
            return;
        }
        let ws = is_ws(b);
        if ws {
            let mut none = true;
            for i in 0..self.attr_names.len() {
                if self.attr_scan[i] > 0 {
                    none = false;
                }
                if !self.attr_flags[i] {
                    self.attr_scan[i] = 0;
                }
            }
            if none {
                return;
            }
        }
        if b == b':' {
            // attribute namespace prefix, restart all scans
            for s in &mut self.attr_scan {
                *s = 0;
            }
            return;
        }
        for i in 0..self.attr_names.len() {
            if self.attr_scan[i] < 0 || self.attr_flags[i] {
                continue;
            }
            if self.attr_scan[i] == self.attr_names[i].len() as i32 && (b == b'=' || ws) {
                self.current_attr = Some(i);
                for s in &mut self.attr_scan {
                    *s = 0;
                }
                self.state = State::AttrValue;
                break;
            }
            let pos = self.attr_scan[i] as usize;
            if pos < self.attr_names[i].len() && b == self.attr_names[i][pos] {
                self.attr_scan[i] += 1;
            } else {
                self.attr_scan[i] = -1;
            }
        }
    }

    fn feed_attr_value(&mut self, b: u8) {
        let Some(cur) = self.current_attr else {
            self.state = State::AttrName;
            return;
        };
        if self.attr_scan[cur] == 0 {
            if b == b'"' {
                self.attr_scan[cur] = 1;
            }
        } else if b == b'"' {
            self.attr_flags[cur] = true;
            self.attr_scan[cur] = 0;
            self.current_attr = None;
            self.state = State::AttrName;
        } else {
            self.attr_values[cur].feed(b);
        }
    }

    fn feed_end_name(&mut self, b: u8) {
        self.close_length += 1;
        if self.scan == 0 && is_ws(b) {
            return;
        }
        if b == b'>' || is_ws(b) {
            if self.scan == self.name.len() as i32 {
                self.completed = 2;
                self.state = State::Outside;
            } else {
                self.state = State::Inside;
            }
            return;
        }
        if b == b':' {
            self.scan = 0;
            return;
        }
        if self.scan < 0 {
            return;
        }
        if (self.scan as usize) < self.name.len() {
            if b == self.name[self.scan as usize] {
                self.scan += 1;
            } else {
                self.scan = -1;
            }
        } else {
            self.scan = -1;
        }
    }

    /// Not currently recognizing this element
    pub fn outside(&self) -> bool {
        self.state == State::Outside
    }

    /// Between the opening and closing tag (or inside a candidate close tag)
    pub fn inside(&self) -> bool {
        matches!(self.state, State::Inside | State::End | State::EndName)
    }

    /// Inside the opening tag, name or attributes
    pub fn at_start(&self) -> bool {
        matches!(
            self.state,
            State::Start | State::StartName | State::AttrName | State::AttrValue
        )
    }

    /// One-shot latch: the opening tag finished since the last poll.
    /// Also latches for self-closing tags.
    pub fn completed_start(&mut self) -> bool {
        let ret = self.completed > 0;
        self.completed = 0;
        ret
    }

    /// One-shot latch: the whole element finished since the last poll.
    pub fn completed(&mut self) -> bool {
        let ret = self.completed == 2;
        if ret {
            self.completed = 0;
        }
        ret
    }

    /// Whether attribute `i` was present with a quoted value
    pub fn has_value(&self, i: usize) -> bool {
        self.attr_flags[i]
    }

    /// Number of bytes consumed while recognizing the closing tag.
    /// Used by callers to trim closing-tag bytes captured into value
    /// buffers mid-stream.
    pub fn close_length(&self) -> usize {
        self.close_length
    }

    /// Value of an `Index` attribute; 0 when absent or of another kind
    pub fn index_value(&self, i: usize) -> u64 {
        match &self.attr_values[i] {
            AttrValue::Index(a) => a.value,
            _ => 0,
        }
    }

    /// Bytes of a `Str` attribute; empty when absent or of another kind
    pub fn str_value(&self, i: usize) -> &[u8] {
        match &self.attr_values[i] {
            AttrValue::Str(a) => &a.buf[..a.len],
            _ => &[],
        }
    }

    /// `(column, row)` of a `Location` attribute
    pub fn location_value(&self, i: usize) -> (u64, u64) {
        match &self.attr_values[i] {
            AttrValue::Location(a) => (a.column, a.row),
            _ => (0, 0),
        }
    }

    /// `((column, row), (column, row))` of a `Range` attribute
    pub fn range_value(&self, i: usize) -> ((u64, u64), (u64, u64)) {
        match &self.attr_values[i] {
            AttrValue::Range(a) => ((a.start.column, a.start.row), (a.end.column, a.end.row)),
            _ => ((0, 0), (0, 0)),
        }
    }

    /// Cell type of a `Type` attribute
    pub fn type_value(&self, i: usize) -> CellType {
        match &self.attr_values[i] {
            AttrValue::Type(a) => a.ty,
            _ => CellType::None,
        }
    }

    /// Return to the outside state, keeping attribute configuration
    pub fn reset(&mut self) {
        self.scan = -1;
        self.current_attr = None;
        self.prev_close_slash = false;
        self.close_length = 0;
        self.state = State::Outside;
        self.completed = 0;
    }
}

/// Decode the five named XML entities and numeric character references in
/// place, left to right. Unknown or malformed references are kept verbatim.
/// Numeric references (`&#N;` decimal, `&#xH;` hex) are rewritten as UTF-8
/// for any scalar value up to U+10FFFF.
pub fn unescape_in_place(buf: &mut Vec<u8>) {
    let mut read = 0;
    let mut write = 0;
    let len = buf.len();
    while read < len {
        if buf[read] == b'&' {
            if let Some((consumed, ch)) = decode_entity(&buf[read..len]) {
                let mut utf8 = [0u8; 4];
                let encoded = ch.encode_utf8(&mut utf8);
                // decoded form is never longer than the reference
                debug_assert!(encoded.len() <= consumed);
                for &eb in encoded.as_bytes() {
                    buf[write] = eb;
                    write += 1;
                }
                read += consumed;
                continue;
            }
        }
        buf[write] = buf[read];
        write += 1;
        read += 1;
    }
    buf.truncate(write);
}

/// Match one entity at the start of `tail`, returning
/// `(bytes consumed, decoded char)`.
fn decode_entity(tail: &[u8]) -> Option<(usize, char)> {
    const NAMED: [(&[u8], char); 5] = [
        (b"&amp;", '&'),
        (b"&apos;", '\''),
        (b"&quot;", '"'),
        (b"&gt;", '>'),
        (b"&lt;", '<'),
    ];
    for (name, ch) in NAMED {
        if tail.starts_with(name) {
            return Some((name.len(), ch));
        }
    }
    if tail.len() < 4 || tail[1] != b'#' {
        return None;
    }
    let (digits_start, radix) = if tail[2] == b'x' || tail[2] == b'X' {
        (3usize, 16u32)
    } else {
        (2usize, 10u32)
    };
    let digits = &tail[digits_start..];
    let mut value: u32 = 0;
    let mut used = 0;
    for &d in digits {
        if d == b';' {
            break;
        }
        let digit = (d as char).to_digit(radix)?;
        value = value.checked_mul(radix)?.checked_add(digit)?;
        used += 1;
        if used > 8 {
            return None;
        }
    }
    if used == 0 || digits.get(used) != Some(&b';') {
        return None;
    }
    char::from_u32(value).map(|ch| (digits_start + used + 1, ch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(scanner: &mut ElementScanner, input: &str) {
        for b in input.bytes() {
            scanner.feed(b);
        }
    }

    #[test]
    fn test_simple_element() {
        let mut c = ElementScanner::new("c", &[("r", AttrKind::Location)]);
        feed_all(&mut c, r#"<c r="B7">"#);
        assert!(c.completed_start());
        assert!(c.inside());
        feed_all(&mut c, "x</c>");
        assert!(c.completed());
        assert!(c.outside());
        assert!(c.has_value(0));
        assert_eq!(c.location_value(0), (2, 7));
    }

    #[test]
    fn test_self_closing_raises_both() {
        let mut c = ElementScanner::new("c", &[("s", AttrKind::Index)]);
        feed_all(&mut c, r#"<c s="12"/>"#);
        assert!(c.completed());
        // completed() drained the latch, completed_start is gone too
        assert!(!c.completed_start());
        assert_eq!(c.index_value(0), 12);
    }

    #[test]
    fn test_self_closing_without_attributes() {
        let mut c = ElementScanner::new("c", &[]);
        feed_all(&mut c, "<c/>");
        assert!(c.completed());
    }

    #[test]
    fn test_namespace_prefix_stripped() {
        let mut rel = ElementScanner::new("Relationship", &[("Id", AttrKind::Str)]);
        feed_all(&mut rel, r#"<pkg:Relationship Id="rId3"/>"#);
        assert!(rel.completed());
        assert_eq!(rel.str_value(0), b"rId3");
    }

    #[test]
    fn test_name_mismatch_is_ignored() {
        let mut c = ElementScanner::new("c", &[]);
        feed_all(&mut c, "<cell>text</cell>");
        assert!(!c.completed());
        assert!(c.outside());
    }

    #[test]
    fn test_close_length_counts_close_tag_bytes() {
        let mut v = ElementScanner::new("v", &[]);
        feed_all(&mut v, "<v>42</v>");
        assert!(v.completed());
        // "</v" was consumed while deciding, '>' sealed it
        assert_eq!(v.close_length(), 4);
    }

    #[test]
    fn test_nested_unrelated_elements() {
        let mut c = ElementScanner::new("c", &[]);
        feed_all(&mut c, "<c><v>1</v></c>");
        assert!(c.completed());
    }

    #[test]
    fn test_attribute_order_and_unknown_attributes() {
        let mut c = ElementScanner::new(
            "c",
            &[
                ("r", AttrKind::Location),
                ("t", AttrKind::Type),
                ("s", AttrKind::Index),
            ],
        );
        feed_all(&mut c, r#"<c s="3" cm="1" r="AA12" t="s">"#);
        assert!(c.completed_start());
        assert_eq!(c.location_value(0), (27, 12));
        assert_eq!(c.type_value(1), CellType::StringRef);
        assert_eq!(c.index_value(2), 3);
    }

    #[test]
    fn test_type_codes() {
        for (code, ty) in [
            ("b", CellType::Boolean),
            ("d", CellType::Date),
            ("e", CellType::Error),
            ("n", CellType::Numeric),
            ("s", CellType::StringRef),
            ("str", CellType::String),
            ("inlineStr", CellType::StringInline),
        ] {
            let mut c = ElementScanner::new("c", &[("t", AttrKind::Type)]);
            for b in format!(r#"<c t="{}"/>"#, code).bytes() {
                c.feed(b);
            }
            assert!(c.completed(), "type code {}", code);
            assert_eq!(c.type_value(0), ty, "type code {}", code);
        }
    }

    #[test]
    fn test_resync_after_partial_document() {
        // starting mid-element must not confuse the scanner
        let mut c = ElementScanner::new("c", &[("r", AttrKind::Location)]);
        feed_all(&mut c, r#"3</v></c><c r="D2"><v>4</v></c>"#);
        assert!(c.completed());
        assert_eq!(c.location_value(0), (4, 2));
    }

    #[test]
    fn test_completed_start_is_one_shot() {
        let mut c = ElementScanner::new("row", &[("r", AttrKind::Index)]);
        feed_all(&mut c, r#"<row r="2">"#);
        assert!(c.completed_start());
        assert!(!c.completed_start());
    }

    #[test]
    fn test_range_attribute() {
        let mut d = ElementScanner::new("dimension", &[("ref", AttrKind::Range)]);
        feed_all(&mut d, r#"<dimension ref="A1:C9"/>"#);
        assert!(d.completed());
        assert_eq!(d.range_value(0), ((1, 1), (3, 9)));
    }

    #[test]
    fn test_unescape_named_entities() {
        let mut buf = b"a &amp; b &lt;c&gt; &quot;d&quot; &apos;e&apos;".to_vec();
        unescape_in_place(&mut buf);
        assert_eq!(buf, b"a & b <c> \"d\" 'e'");
    }

    #[test]
    fn test_unescape_numeric_references() {
        let mut buf = b"R&amp;D &#x1F600;".to_vec();
        unescape_in_place(&mut buf);
        assert_eq!(buf, &[0x52, 0x26, 0x44, 0x20, 0xF0, 0x9F, 0x98, 0x80][..]);

        let mut buf = b"&#65;&#x42;c".to_vec();
        unescape_in_place(&mut buf);
        assert_eq!(buf, b"ABc");
    }

    #[test]
    fn test_unescape_keeps_invalid_references() {
        let mut buf = b"&unknown; &#; &#xZZ; & alone &#x110000;".to_vec();
        let expected = buf.clone();
        unescape_in_place(&mut buf);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_unescape_max_scalar() {
        let mut buf = b"&#x10FFFF;".to_vec();
        unescape_in_place(&mut buf);
        assert_eq!(buf, "\u{10FFFF}".as_bytes());
    }

    #[test]
    fn test_string_attribute_truncates() {
        let mut rel = ElementScanner::new("Relationship", &[("Target", AttrKind::Str)]);
        let long = "x".repeat(400);
        for b in format!(r#"<Relationship Target="{}"/>"#, long).bytes() {
            rel.feed(b);
        }
        assert!(rel.completed());
        assert_eq!(rel.str_value(0).len(), STRING_ATTR_CAPACITY);
    }
}
