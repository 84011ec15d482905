// src/report/xlsx.rs
//
// Minimal SpreadsheetML writer: one worksheet of inline-string and numeric
// cells inside the OPC zip container.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::{
    fs::File,
    io::{BufWriter, Seek, Write},
    path::Path,
};
use tracing::info;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

/// Excel rejects longer sheet names.
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        if v.is_finite() {
            Cell::Number(v)
        } else {
            Cell::Empty
        }
    }
}

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/></Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Spreadsheet column letters for a zero-based index (0 -> A, 26 -> AA).
pub fn column_letters(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// Characters Excel forbids in sheet names are replaced by `_`.
pub fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\') { '_' } else { c })
        .take(MAX_SHEET_NAME)
        .collect();
    if cleaned.trim().is_empty() {
        "Sheet1".to_string()
    } else {
        cleaned
    }
}

fn workbook_xml(sheet: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        escape_xml(sheet)
    )
}

fn core_xml() -> String {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><dc:creator>condomstudy</dc:creator><dcterms:created xsi:type="dcterms:W3CDTF">{now}</dcterms:created></cp:coreProperties>"#
    )
}

fn sheet_xml(rows: &[Vec<Cell>]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, cell) in row.iter().enumerate() {
            let at = format!("{}{}", column_letters(c), r + 1);
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => xml.push_str(&format!(
                    r#"<c r="{at}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                    escape_xml(s)
                )),
                Cell::Number(v) => xml.push_str(&format!(r#"<c r="{at}"><v>{v}</v></c>"#)),
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

/// Write a single-sheet workbook into any seekable sink.
pub fn write_workbook_to<W: Write + Seek>(sink: W, sheet: &str, rows: &[Vec<Cell>]) -> Result<W> {
    let mut zip = ZipWriter::new(sink);
    let options: FileOptions<'_, ()> =
        FileOptions::default().compression_method(CompressionMethod::Deflated);
    let sheet = sanitize_sheet_name(sheet);

    let parts: [(&str, String); 6] = [
        ("[Content_Types].xml", CONTENT_TYPES.to_string()),
        ("_rels/.rels", ROOT_RELS.to_string()),
        ("docProps/core.xml", core_xml()),
        ("xl/workbook.xml", workbook_xml(&sheet)),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS.to_string()),
        ("xl/worksheets/sheet1.xml", sheet_xml(rows)),
    ];
    for (name, body) in parts {
        zip.start_file(name, options)
            .with_context(|| format!("starting workbook part {}", name))?;
        zip.write_all(body.as_bytes())
            .with_context(|| format!("writing workbook part {}", name))?;
    }
    Ok(zip.finish()?)
}

#[tracing::instrument(level = "info", skip(rows), fields(path = %path.display()))]
pub fn write_workbook(path: &Path, sheet: &str, rows: &[Vec<Cell>]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating workbook {}", path.display()))?;
    let mut out = write_workbook_to(BufWriter::new(file), sheet, rows)?;
    out.flush()
        .with_context(|| format!("flushing workbook {}", path.display()))?;
    info!(rows = rows.len(), sheet, "workbook written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::init_test_logging;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;
    use zip::ZipArchive;

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(27), "AB");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
    }

    #[test]
    fn sheet_names_are_cleaned() {
        assert_eq!(sanitize_sheet_name("Descriptives"), "Descriptives");
        assert_eq!(sanitize_sheet_name("a/b:c"), "a_b_c");
        assert_eq!(sanitize_sheet_name(&"x".repeat(40)).len(), MAX_SHEET_NAME);
        assert_eq!(sanitize_sheet_name("  "), "Sheet1");
    }

    #[test]
    fn workbook_is_a_readable_zip() -> Result<()> {
        init_test_logging();
        let dir = TempDir::new()?;
        let path = dir.path().join("out").join("descriptives.xlsx");
        let rows = vec![
            vec![Cell::from("Variable"), Cell::from("Used (%)")],
            vec![Cell::from("Wealth <poorest> & co"), Cell::from(42.5)],
            vec![Cell::Empty, Cell::from(f64::NAN)],
        ];
        write_workbook(&path, "Descriptives", &rows)?;

        let mut archive = ZipArchive::new(File::open(&path)?)?;
        for part in [
            "[Content_Types].xml",
            "_rels/.rels",
            "xl/workbook.xml",
            "xl/_rels/workbook.xml.rels",
            "xl/worksheets/sheet1.xml",
            "docProps/core.xml",
        ] {
            assert!(archive.by_name(part).is_ok(), "missing {part}");
        }

        let mut workbook = String::new();
        archive.by_name("xl/workbook.xml")?.read_to_string(&mut workbook)?;
        assert!(workbook.contains(r#"<sheet name="Descriptives""#));

        let mut sheet = String::new();
        archive.by_name("xl/worksheets/sheet1.xml")?.read_to_string(&mut sheet)?;
        assert!(sheet.contains("Wealth &lt;poorest&gt; &amp; co"));
        assert!(sheet.contains(r#"<c r="B2"><v>42.5</v></c>"#));
        assert!(sheet.contains(r#"<row r="3"></row>"#));
        Ok(())
    }

    #[test]
    fn writes_into_memory() -> Result<()> {
        let cursor = write_workbook_to(Cursor::new(Vec::new()), "S", &[vec![Cell::from(1.0)]])?;
        let archive = ZipArchive::new(Cursor::new(cursor.into_inner()))?;
        assert_eq!(archive.len(), 6);
        Ok(())
    }
}
