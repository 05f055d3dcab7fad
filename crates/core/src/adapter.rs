use crate::error::IngestError;
use calamine::{open_workbook_auto, Data, Reader};
use lopdf::Document;
use std::fs;
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use tracing::debug;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const SNIFF_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Spreadsheet,
    Pdf,
}

impl DocumentKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentKind::Text => "text/plain",
            DocumentKind::Spreadsheet => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            DocumentKind::Pdf => "application/pdf",
        }
    }
}

/// Classifies a file by its leading bytes, never by extension. `None` means
/// no adapter handles the file.
pub fn sniff_kind(path: &Path) -> Result<Option<DocumentKind>, IngestError> {
    let mut window = [0u8; SNIFF_WINDOW];
    let mut file = fs::File::open(path)?;
    let mut filled = 0;

    while filled < window.len() {
        let read = file.read(&mut window[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    let head = &window[..filled];
    if head.starts_with(b"%PDF-") {
        return Ok(Some(DocumentKind::Pdf));
    }
    if head.starts_with(&ZIP_MAGIC) {
        return Ok(Some(DocumentKind::Spreadsheet));
    }
    if !head.is_empty() && looks_like_text(head) {
        return Ok(Some(DocumentKind::Text));
    }

    Ok(None)
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte sequence cut off by the sniff window is still text.
        Err(error) => error.error_len().is_none(),
    }
}

/// The uniform line-addressable content model: the unit sequence, the
/// concatenated searchable string, and each unit's byte range within it.
#[derive(Debug, Clone)]
pub struct SectionContent {
    units: Vec<String>,
    full_text: String,
    spans: Vec<Range<usize>>,
}

impl SectionContent {
    pub fn from_units(units: Vec<String>) -> Self {
        let mut spans = Vec::with_capacity(units.len());
        let mut cursor = 0;
        for unit in &units {
            spans.push(cursor..cursor + unit.len());
            cursor += unit.len() + 1;
        }

        let full_text = units.join("\n");
        Self {
            units,
            full_text,
            spans,
        }
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn is_blank(&self) -> bool {
        self.units.iter().all(|unit| unit.trim().is_empty())
    }

    /// Maps a byte span in `full_text` back to 0-based (start_unit,
    /// end_unit) indices by accumulated unit lengths, clamped to the unit
    /// sequence.
    pub fn locate(&self, start: usize, end: usize) -> (usize, usize) {
        if self.spans.is_empty() {
            return (0, 0);
        }

        let last = self.spans.len() - 1;
        let start_unit = self.spans.partition_point(|span| span.end < start).min(last);
        let terminal = end.saturating_sub(1).max(start);
        let end_unit = self
            .spans
            .partition_point(|span| span.end < terminal)
            .min(last);

        (start_unit, end_unit.max(start_unit))
    }

    /// Joins the units from `start_unit - radius` through `end_unit +
    /// radius`, clamped to the section boundaries.
    pub fn surrounding(&self, start_unit: usize, end_unit: usize, radius: usize) -> String {
        if self.units.is_empty() {
            return String::new();
        }

        let last = self.units.len() - 1;
        let from = start_unit.min(last).saturating_sub(radius);
        let to = (end_unit.min(last)).saturating_add(radius).min(last);
        self.units[from..=to].join("\n")
    }
}

/// One line-addressable view over (part of) a file. Plain files and PDFs
/// produce a single section; workbooks produce one per sheet so each sheet
/// gets its own file record.
#[derive(Debug, Clone)]
pub struct DocumentSection {
    pub name: String,
    pub content: SectionContent,
}

/// Converts a file into its section list. Unreadable or corrupt input is
/// an error; the caller counts the file as failed and writes no facts.
pub fn adapt_file(path: &Path, kind: DocumentKind) -> Result<Vec<DocumentSection>, IngestError> {
    match kind {
        DocumentKind::Text => adapt_text(path),
        DocumentKind::Spreadsheet => adapt_workbook(path),
        DocumentKind::Pdf => adapt_pdf(path),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn adapt_text(path: &Path) -> Result<Vec<DocumentSection>, IngestError> {
    let raw = fs::read_to_string(path)?;
    let units = raw.lines().map(str::to_string).collect();

    Ok(vec![DocumentSection {
        name: file_label(path),
        content: SectionContent::from_units(units),
    }])
}

fn adapt_workbook(path: &Path) -> Result<Vec<DocumentSection>, IngestError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|error| IngestError::WorkbookParse(error.to_string()))?;
    let label = file_label(path);

    let mut sections = Vec::new();
    for sheet in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|error| IngestError::WorkbookParse(error.to_string()))?;

        let units = range
            .rows()
            .map(|row| {
                row.iter()
                    .map(render_cell)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        sections.push(DocumentSection {
            name: format!("{label}_{sheet}"),
            content: SectionContent::from_units(units),
        });
    }

    Ok(sections)
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => " ".to_string(),
        Data::String(value) => value.clone(),
        other => other.to_string(),
    }
}

fn adapt_pdf(path: &Path) -> Result<Vec<DocumentSection>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut units = Vec::new();
    for (page_number, _object_id) in document.get_pages() {
        match document.extract_text(&[page_number]) {
            Ok(text) => units.push(text),
            Err(error) => {
                debug!(path = %path.display(), page = page_number, %error, "page text extraction failed, keeping empty page slot");
                units.push(String::new());
            }
        }
    }

    let content = SectionContent::from_units(units);
    if content.is_blank() {
        return Err(IngestError::PdfParse(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    Ok(vec![DocumentSection {
        name: file_label(path),
        content,
    }])
}
