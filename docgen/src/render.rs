//! Document renderers.
//!
//! The engine treats rendering as opaque: a [`Renderer`] turns a source record
//! into document bytes or an error message. [`RecordSheetRenderer`] is the
//! built-in renderer used by the `docgen-worker` binary; it lays a record out
//! as a single-page PDF fact sheet.

use std::fmt::Write as _;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

/// Error reported by a renderer; its message is recorded on the job verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RenderError(String);

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for RenderError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for RenderError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Turns a source record into document bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, record: &Value) -> Result<Bytes, RenderError>;
}

/// Record fields used as the sheet title, in order of preference.
const TITLE_FIELDS: [&str; 3] = ["name", "title", "displayName"];

/// Single-page A4 PDF listing a record's top-level fields.
#[derive(Debug, Clone)]
pub struct RecordSheetRenderer {
    page_width: u32,
    page_height: u32,
    margin: u32,
    title_size: u32,
    font_size: u32,
    line_height: u32,
    wrap_at: usize,
}

impl Default for RecordSheetRenderer {
    fn default() -> Self {
        Self {
            page_width: 595,
            page_height: 842,
            margin: 56,
            title_size: 18,
            font_size: 11,
            line_height: 15,
            wrap_at: 90,
        }
    }
}

#[async_trait]
impl Renderer for RecordSheetRenderer {
    async fn render(&self, record: &Value) -> Result<Bytes, RenderError> {
        let fields = record
            .as_object()
            .ok_or_else(|| RenderError::new("record must be a JSON object"))?;

        let title_field = TITLE_FIELDS
            .iter()
            .find(|name| fields.get(**name).is_some_and(Value::is_string));
        let title = title_field
            .and_then(|name| fields[*name].as_str())
            .unwrap_or("Record");

        let lines = self.body_lines(fields, title_field.copied());
        Ok(Bytes::from(self.build_pdf(title, &lines)))
    }
}

impl RecordSheetRenderer {
    fn max_lines(&self) -> usize {
        let usable = self
            .page_height
            .saturating_sub(2 * self.margin + self.title_size * 2);
        (usable / self.line_height).max(1) as usize
    }

    fn body_lines(&self, fields: &Map<String, Value>, skip: Option<&str>) -> Vec<String> {
        let mut lines = Vec::new();
        for (key, value) in fields {
            if Some(key.as_str()) == skip {
                continue;
            }
            let text = format!("{}: {}", key, display_value(value));
            lines.extend(wrap(&text, self.wrap_at));
        }

        let max = self.max_lines();
        if lines.len() > max {
            lines.truncate(max - 1);
            lines.push("...".to_string());
        }
        lines
    }

    fn content_stream(&self, title: &str, lines: &[String]) -> String {
        let top = self.page_height - self.margin;
        let mut content = String::new();
        let _ = writeln!(content, "BT");
        let _ = writeln!(content, "/F2 {} Tf", self.title_size);
        let _ = writeln!(content, "{} {} Td", self.margin, top);
        let _ = writeln!(content, "({}) Tj", escape_text(title));
        let _ = writeln!(content, "/F1 {} Tf", self.font_size);
        let _ = writeln!(content, "0 -{} Td", self.title_size * 2);
        for line in lines {
            let _ = writeln!(content, "({}) Tj", escape_text(line));
            let _ = writeln!(content, "0 -{} Td", self.line_height);
        }
        let _ = writeln!(content, "ET");
        content
    }

    fn build_pdf(&self, title: &str, lines: &[String]) -> Vec<u8> {
        let content = self.content_stream(title, lines);
        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
                 /Resources << /Font << /F1 4 0 R /F2 5 0 R >> >> /Contents 6 0 R >>",
                self.page_width, self.page_height
            ),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
                .to_string(),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>"
                .to_string(),
            format!(
                "<< /Length {} >>\nstream\n{}endstream",
                content.len(),
                content
            ),
        ];

        let mut pdf = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::with_capacity(objects.len());
        for (index, body) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", index + 1, body).as_bytes());
        }

        let xref_offset = pdf.len();
        let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
        for offset in offsets {
            let _ = write!(xref, "{:010} 00000 n \n", offset);
        }
        let _ = write!(
            xref,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        );
        pdf.extend_from_slice(xref.as_bytes());
        pdf
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Break `text` into lines of at most `width` characters, preferring spaces.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let split = word
                .char_indices()
                .nth(width)
                .map(|(i, _)| i)
                .unwrap_or(word.len());
            lines.push(word[..split].to_string());
            word = word[split..].to_string();
        }

        let needed = if current.is_empty() { 0 } else { 1 } + word.chars().count();
        if current.chars().count() + needed > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Escape a string for a PDF literal; characters outside Latin-1 become `?`.
fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            ' '..='~' => escaped.push(c),
            '\u{a0}'..='\u{ff}' => {
                let _ = write!(escaped, "\\{:03o}", c as u32);
            }
            _ => escaped.push('?'),
        }
    }
    escaped
}
