//! Export and import formats
//!
//! Every exporter is a pure function of validated notes and folders. JSON is
//! the only full-fidelity format and the only one that can be imported back.

use crate::models::{Folder, Note};
use crate::utils::{escape_html, markup_to_markdown, strip_markup};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Version stamped into JSON exports
pub const EXPORT_VERSION: u64 = 1;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown export format: {0}")]
    UnknownFormat(String),

    #[error("Export version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u64 },

    #[error("Malformed export: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
    Html,
    PlainText,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "md",
            ExportFormat::Html => "html",
            ExportFormat::PlainText => "txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            "html" | "htm" => Ok(ExportFormat::Html),
            "txt" | "text" | "plain" => Ok(ExportFormat::PlainText),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

/// Full-fidelity export envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: u64,
    pub exported_at: DateTime<Utc>,
    pub notes: Vec<Note>,
    pub folders: Vec<Folder>,
}

/// Unvalidated records parsed from an export, ready for bulk import
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportRecords {
    pub notes: Vec<Value>,
    pub folders: Vec<Value>,
}

pub fn export(
    format: ExportFormat,
    notes: &[Note],
    folders: &[Folder],
    exported_at: DateTime<Utc>,
) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => export_json(notes, folders, exported_at),
        ExportFormat::Markdown => Ok(export_markdown(notes, folders)),
        ExportFormat::Html => Ok(export_html(notes, folders)),
        ExportFormat::PlainText => Ok(export_plain_text(notes, folders)),
    }
}

pub fn export_json(
    notes: &[Note],
    folders: &[Folder],
    exported_at: DateTime<Utc>,
) -> Result<String, ExportError> {
    let bundle = ExportBundle {
        version: EXPORT_VERSION,
        exported_at,
        notes: notes.to_vec(),
        folders: folders.to_vec(),
    };
    Ok(serde_json::to_string_pretty(&bundle)?)
}

/// Parse a JSON export without validating its records.
///
/// Accepts the versioned envelope or a bare array of notes.
pub fn parse_json_export(input: &str) -> Result<ImportRecords, ExportError> {
    let value: Value = serde_json::from_str(input)?;

    match value {
        Value::Array(notes) => Ok(ImportRecords {
            notes,
            folders: Vec::new(),
        }),
        Value::Object(mut envelope) => {
            if let Some(found) = envelope.get("version").and_then(Value::as_u64) {
                if found > EXPORT_VERSION {
                    return Err(ExportError::UnsupportedVersion {
                        found,
                        supported: EXPORT_VERSION,
                    });
                }
            }
            let mut take_list = |key: &str| -> Result<Vec<Value>, ExportError> {
                match envelope.remove(key) {
                    None | Some(Value::Null) => Ok(Vec::new()),
                    Some(Value::Array(items)) => Ok(items),
                    Some(_) => Err(ExportError::Malformed(format!("'{}' must be an array", key))),
                }
            };
            Ok(ImportRecords {
                notes: take_list("notes")?,
                folders: take_list("folders")?,
            })
        }
        _ => Err(ExportError::Malformed(
            "expected an object or an array".to_string(),
        )),
    }
}

fn folder_names(folders: &[Folder]) -> HashMap<&str, &str> {
    folders
        .iter()
        .map(|f| (f.id.as_str(), f.name.as_str()))
        .collect()
}

fn display_title(note: &Note) -> &str {
    if note.title.trim().is_empty() {
        "Untitled"
    } else {
        &note.title
    }
}

pub fn export_markdown(notes: &[Note], folders: &[Folder]) -> String {
    let names = folder_names(folders);
    let sections: Vec<String> = notes
        .iter()
        .map(|note| {
            let mut section = format!("# {}\n", display_title(note));
            if let Some(folder) = note.folder_id.as_deref().and_then(|id| names.get(id)) {
                let _ = writeln!(section, "\n*Folder:* {}", folder);
            }
            if !note.tags.is_empty() {
                let tags: Vec<String> = note.tags.iter().map(|t| format!("`{}`", t)).collect();
                let _ = writeln!(section, "\n*Tags:* {}", tags.join(" "));
            }
            let body = markup_to_markdown(&note.content);
            if !body.is_empty() {
                let _ = writeln!(section, "\n{}", body);
            }
            section
        })
        .collect();
    sections.join("\n---\n\n")
}

pub fn export_html(notes: &[Note], folders: &[Folder]) -> String {
    let names = folder_names(folders);
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Notes</title>\n</head>\n<body>\n",
    );

    for note in notes {
        let _ = writeln!(
            html,
            "<article id=\"note-{}\" style=\"border-left: 4px solid {}\">",
            escape_html(&note.id),
            note.color
        );
        let _ = writeln!(html, "<h1>{}</h1>", escape_html(display_title(note)));
        if let Some(folder) = note.folder_id.as_deref().and_then(|id| names.get(id)) {
            let _ = writeln!(html, "<p class=\"folder\">{}</p>", escape_html(folder));
        }
        if !note.tags.is_empty() {
            let tags: Vec<String> = note
                .tags
                .iter()
                .map(|t| format!("<span class=\"tag\">{}</span>", escape_html(t)))
                .collect();
            let _ = writeln!(html, "<p class=\"tags\">{}</p>", tags.join(" "));
        }
        // Content is already markup
        let _ = writeln!(html, "<div class=\"content\">{}</div>", note.content);
        html.push_str("</article>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

pub fn export_plain_text(notes: &[Note], folders: &[Folder]) -> String {
    let names = folder_names(folders);
    let sections: Vec<String> = notes
        .iter()
        .map(|note| {
            let title = display_title(note);
            let mut section = format!("{}\n{}\n", title, "=".repeat(title.chars().count()));
            if let Some(folder) = note.folder_id.as_deref().and_then(|id| names.get(id)) {
                let _ = writeln!(section, "Folder: {}", folder);
            }
            if !note.tags.is_empty() {
                let _ = writeln!(section, "Tags: {}", note.tags.join(", "));
            }
            let body = strip_markup(&note.content);
            if !body.is_empty() {
                let _ = writeln!(section, "\n{}", body);
            }
            section
        })
        .collect();
    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteMetadata, DEFAULT_COLOR};
    use serde_json::json;

    fn sample() -> (Vec<Note>, Vec<Folder>) {
        let now = Utc::now();
        let folder = Folder {
            id: "f1".to_string(),
            name: "Work".to_string(),
            parent_id: None,
            color: DEFAULT_COLOR.to_string(),
            created_at: now,
            modified_at: now,
        };
        let note = Note {
            id: "n1".to_string(),
            title: "Plan <Q3>".to_string(),
            content: "<p>Ship <b>it</b></p>".to_string(),
            color: "#ff0000".to_string(),
            tags: vec!["work".to_string(), "q3".to_string()],
            folder_id: Some("f1".to_string()),
            favorite: false,
            shared: false,
            created_at: now,
            modified_at: now,
            synced: true,
            metadata: NoteMetadata::default(),
        };
        (vec![note], vec![folder])
    }

    #[test]
    fn test_json_export_parses_back() {
        let (notes, folders) = sample();
        let exported = export_json(&notes, &folders, Utc::now()).unwrap();

        let value: Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(value["version"], json!(EXPORT_VERSION));
        assert!(value.get("exportedAt").is_some());

        let records = parse_json_export(&exported).unwrap();
        assert_eq!(records.notes.len(), 1);
        assert_eq!(records.folders.len(), 1);
        assert_eq!(records.notes[0]["folderId"], json!("f1"));
    }

    #[test]
    fn test_parse_rejects_newer_versions_and_garbage() {
        let err = parse_json_export(r#"{"version": 99, "notes": []}"#).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedVersion { found: 99, .. }));

        let err = parse_json_export(r#"{"notes": "nope"}"#).unwrap_err();
        assert!(matches!(err, ExportError::Malformed(_)));

        assert!(parse_json_export("42").is_err());

        let bare = parse_json_export(r#"[{"id": "x"}]"#).unwrap();
        assert_eq!(bare.notes.len(), 1);
        assert!(bare.folders.is_empty());
    }

    #[test]
    fn test_markdown_export() {
        let (notes, folders) = sample();
        let md = export_markdown(&notes, &folders);
        assert!(md.starts_with("# Plan <Q3>"));
        assert!(md.contains("*Folder:* Work"));
        assert!(md.contains("`work` `q3`"));
        assert!(md.contains("Ship **it**"));
    }

    #[test]
    fn test_html_export_escapes_titles() {
        let (notes, folders) = sample();
        let html = export_html(&notes, &folders);
        assert!(html.contains("<h1>Plan &lt;Q3&gt;</h1>"));
        assert!(html.contains("<div class=\"content\"><p>Ship <b>it</b></p></div>"));
        assert!(html.trim_end().ends_with("</html>"));
    }

    #[test]
    fn test_plain_text_export() {
        let (notes, folders) = sample();
        let text = export_plain_text(&notes, &folders);
        assert!(text.starts_with("Plan <Q3>\n=========\n"));
        assert!(text.contains("Tags: work, q3"));
        assert!(text.contains("Ship it"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("MD".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert_eq!("text".parse::<ExportFormat>().unwrap(), ExportFormat::PlainText);
        assert_eq!(ExportFormat::Html.extension(), "html");
        assert!("pdf".parse::<ExportFormat>().is_err());
    }
}
