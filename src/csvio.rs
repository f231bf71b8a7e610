/// Delimiters accepted in grade import files. Spreadsheet tools in different
/// locales export comma-, tab-, or semicolon-separated text.
pub const CANDIDATE_DELIMITERS: [char; 3] = [',', '\t', ';'];

const UTF8_BOM: char = '\u{feff}';

/// Strip a leading byte-order-mark, as written by Excel and friends.
pub fn strip_bom(s: &str) -> &str {
    s.strip_prefix(UTF8_BOM).unwrap_or(s)
}

/// Pick the delimiter appearing most often in the header line. Candidates are
/// scanned in order and must strictly beat the current best, so comma wins
/// ties (including the all-zero case for a single-column header).
pub fn detect_delimiter(header_line: &str) -> char {
    let mut best = CANDIDATE_DELIMITERS[0];
    let mut best_count = 0usize;
    for cand in CANDIDATE_DELIMITERS {
        let count = header_line.chars().filter(|c| *c == cand).count();
        if count > best_count {
            best = cand;
            best_count = count;
        }
    }
    best
}

/// Split one record on `delim`, honoring RFC-4180 quoting: fields may be
/// wrapped in double quotes, and a doubled quote inside a quoted field is a
/// literal quote.
pub fn parse_record(line: &str, delim: char) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == delim && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

/// RFC-4180 quoting for export: wrap when the value contains a comma, quote,
/// or line break, doubling internal quotes.
pub fn quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
