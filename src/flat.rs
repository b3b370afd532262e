//! Flat CSV output: a header row, then one row per record in `FIELDS` order.
//!
//! Appends write the header only when the file is new or empty. Quoting follows
//! RFC 4180; quoted fields may span lines.

use crate::record::{Record, FIELDS};
use crate::util::{append_with_backoff, create_with_backoff, open_with_backoff};
use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

const DELIM: char = ',';

/// Append `records` to `path`, creating it (with header) when missing.
pub fn append_records(path: &Path, records: &[Record]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = append_with_backoff(path, 16, 50).with_context(|| format!("open {} for append", path.display()))?;
    let needs_header = file.metadata()?.len() == 0;
    write_rows(file, needs_header, records).with_context(|| format!("append to {}", path.display()))
}

/// Overwrite `path` with a header and `records`.
pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = create_with_backoff(path, 16, 50).with_context(|| format!("create {}", path.display()))?;
    write_rows(file, true, records).with_context(|| format!("write {}", path.display()))
}

fn write_rows(file: File, header: bool, records: &[Record]) -> Result<()> {
    let mut w = BufWriter::new(file);
    if header {
        writeln!(w, "{}", FIELDS.join(","))?;
    }
    let mut line = String::with_capacity(256);
    for r in records {
        line.clear();
        push_row(&mut line, r);
        w.write_all(line.as_bytes())?;
    }
    w.flush()?;
    Ok(())
}

fn push_row(out: &mut String, r: &Record) {
    let cells = [
        r.id.clone(),
        r.subreddit.clone(),
        r.author.clone().unwrap_or_default(),
        r.created_utc.to_string(),
        r.score.to_string(),
        r.num_comments.to_string(),
        r.domain.clone(),
        r.stickied.to_string(),
        r.time_updated.map(|t| t.to_string()).unwrap_or_default(),
    ];
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(DELIM);
        }
        push_cell(out, cell);
    }
    out.push('\n');
}

fn push_cell(out: &mut String, s: &str) {
    if s.contains(DELIM) || s.contains('"') || s.contains('\n') || s.contains('\r') {
        out.push('"');
        out.push_str(&s.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(s);
    }
}

/// Read a flat file written by this module back into records.
///
/// Columns are matched by header name, so files with a subset of the columns
/// (or a different order) still load; absent optional columns take defaults.
pub fn read_flat_file(path: &Path) -> Result<Vec<Record>> {
    let mut f = open_with_backoff(path, 16, 50).with_context(|| format!("open {}", path.display()))?;
    let mut text = String::new();
    f.read_to_string(&mut text).with_context(|| format!("read {}", path.display()))?;

    let mut rows = parse_rows(&text).into_iter();
    let header = match rows.next() {
        Some(h) => h,
        None => return Ok(Vec::new()),
    };
    let columns = ColumnIndex::from_header(&header)?;

    let mut out = Vec::new();
    for (i, row) in rows.enumerate() {
        // Line numbers are 1-based and the header is line 1.
        let rec = columns.record(&row).with_context(|| format!("{} row {}", path.display(), i + 2))?;
        out.push(rec);
    }
    Ok(out)
}

/// Position of each known column in the header.
struct ColumnIndex {
    pos: [Option<usize>; FIELDS.len()],
}

impl ColumnIndex {
    fn from_header(header: &[String]) -> Result<Self> {
        let mut pos = [None; FIELDS.len()];
        for (i, name) in header.iter().enumerate() {
            if let Some(c) = FIELDS.iter().position(|f| *f == name.trim()) {
                pos[c] = Some(i);
            }
        }
        for required in ["id", "subreddit", "created_utc"] {
            let c = FIELDS.iter().position(|f| *f == required).unwrap_or_default();
            if pos[c].is_none() {
                bail!("header is missing column `{required}`");
            }
        }
        Ok(Self { pos })
    }

    fn cell<'r>(&self, row: &'r [String], field: &str) -> Option<&'r str> {
        let c = FIELDS.iter().position(|f| *f == field)?;
        self.pos[c].and_then(|i| row.get(i)).map(String::as_str)
    }

    fn record(&self, row: &[String]) -> Result<Record> {
        let text = |field: &str| self.cell(row, field).unwrap_or_default().to_string();
        let int = |field: &'static str| -> Result<Option<i64>> {
            match self.cell(row, field).map(str::trim) {
                None | Some("") => Ok(None),
                Some(s) => s
                    .parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                    .map(Some)
                    .map_err(|_| anyhow!("`{field}` is not a number: {s:?}")),
            }
        };

        let id = text("id");
        let subreddit = text("subreddit");
        if id.is_empty() || subreddit.is_empty() {
            bail!("empty `id` or `subreddit`");
        }
        let created_utc = int("created_utc")?.ok_or_else(|| anyhow!("empty `created_utc`"))?;
        let author = Some(text("author")).filter(|a| !a.is_empty());
        let stickied = matches!(self.cell(row, "stickied").map(str::trim), Some("true" | "True" | "1"));

        Ok(Record {
            id,
            subreddit,
            author,
            created_utc,
            score: int("score")?.unwrap_or(0),
            num_comments: int("num_comments")?.unwrap_or(0),
            domain: text("domain"),
            stickied,
            time_updated: int("time_updated")?,
        })
    }
}

/// Split CSV text into rows of fields. Blank lines are skipped.
fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut chars = text.chars().peekable();
    let mut in_quotes = false;
    let mut touched = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                touched = true;
            }
            DELIM => {
                row.push(std::mem::take(&mut field));
                touched = true;
            }
            '\r' => {}
            '\n' => {
                if touched || !field.is_empty() {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                touched = false;
            }
            _ => {
                field.push(c);
                touched = true;
            }
        }
    }
    if touched || !field.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

