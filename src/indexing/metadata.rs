use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Metadata attached to every chunk of a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    pub title: String,
    pub document_type: Option<String>,
    pub jurisdiction: Option<String>,
    pub category: Option<String>,
    pub year: Option<String>,
    pub folder_category: Option<String>,
    pub oib_guideline: Option<String>,
}

struct Patterns {
    with_type_and_year: Regex,
    with_type: Regex,
    with_year: Regex,
    bare: Regex,
    oib: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        with_type_and_year: Regex::new(r"(?i)^(\d+)_AT_([^_]+)_(\d+)_([^_]+)_(.+?)_(\d{4})\.(pdf|txt)$")
            .expect("valid regex"),
        with_type: Regex::new(r"(?i)^(\d+)_AT_([^_]+)_(\d+)_([^_]+)_(.+?)\.(pdf|txt)$")
            .expect("valid regex"),
        with_year: Regex::new(r"(?i)^(\d+)_AT_([^_]+)_([^_]+)_(.+?)_(\d{4})\.(pdf|txt)$")
            .expect("valid regex"),
        bare: Regex::new(r"(?i)^(\d+)_AT_([^_]+)_([^_]+)_(.+?)\.(pdf|txt)$").expect("valid regex"),
        oib: Regex::new(r"OIB-RL\s*(\d+(?:\.\d+)?)").expect("valid regex"),
    })
}

fn level_type(level: &str) -> Option<String> {
    let name = match level {
        "1" => "law",
        "2" => "regulation",
        "3" => "guideline",
        "4" => "standard",
        _ => return None,
    };
    Some(name.to_string())
}

fn state_jurisdiction(state: &str) -> Option<String> {
    let name = match state {
        "0" => "federal",
        "W" => "vienna",
        "OOE" => "upper_austria",
        _ => return None,
    };
    Some(name.to_string())
}

fn category_name(code: &str) -> Option<String> {
    let name = match code {
        "GE" => "law",
        "VE" => "regulation",
        "OIB" => "guideline",
        "OEN" => "standard",
        _ => return None,
    };
    Some(name.to_string())
}

fn folder_category(folder: &str) -> Option<String> {
    let name = if folder.starts_with("00_Bundesgesetze") {
        "federal_laws"
    } else if folder.starts_with("01-02_Bundesl") {
        "state_laws"
    } else if folder.starts_with("03_OIB") {
        "oib_guidelines"
    } else if folder.starts_with("04_") && folder.contains("NORM") {
        "austrian_standards"
    } else {
        return None;
    };
    Some(name.to_string())
}

/// Parse metadata from a document id (relative path with `/` separators).
///
/// File names follow `{level}_AT_{state}_{type}_{category}_{title}_{year}.pdf`
/// where the type code and the year are optional. The top-level folder
/// tells federal laws, state laws, OIB guidelines and ÖNORM standards apart.
pub fn parse_document_metadata(document_id: &str) -> DocumentMetadata {
    let parts: Vec<&str> = document_id.split('/').collect();
    let filename = parts.last().copied().unwrap_or(document_id);
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);

    let mut metadata = DocumentMetadata {
        source: document_id.to_string(),
        title: stem.replace('_', " "),
        ..Default::default()
    };

    let p = patterns();
    // (level, state, category, title, year)
    let fields = if let Some(c) = p.with_type_and_year.captures(filename) {
        Some((c[1].to_string(), c[2].to_string(), c[4].to_string(), c[5].to_string(), Some(c[6].to_string())))
    } else if let Some(c) = p.with_type.captures(filename) {
        Some((c[1].to_string(), c[2].to_string(), c[4].to_string(), c[5].to_string(), None))
    } else if let Some(c) = p.with_year.captures(filename) {
        Some((c[1].to_string(), c[2].to_string(), c[3].to_string(), c[4].to_string(), Some(c[5].to_string())))
    } else {
        p.bare.captures(filename).map(|c| {
            (c[1].to_string(), c[2].to_string(), c[3].to_string(), c[4].to_string(), None)
        })
    };

    if let Some((level, state, category, title, year)) = fields {
        metadata.document_type = level_type(&level);
        metadata.jurisdiction = state_jurisdiction(&state);
        metadata.category = category_name(&category);
        metadata.title = title.replace('_', " ");
        metadata.year = year;
    }

    if parts.len() >= 2 {
        let main_folder = parts[0];
        metadata.folder_category = folder_category(main_folder);

        let sub_folder = if parts.len() >= 3 { parts[1] } else { "" };
        if sub_folder.contains("Wien") {
            metadata.jurisdiction = Some("vienna".to_string());
        } else if sub_folder.to_uppercase().contains("OBERÖSTERREICH") {
            metadata.jurisdiction = Some("upper_austria".to_string());
        } else if main_folder.contains("Bundesgesetze") {
            metadata.jurisdiction = Some("federal".to_string());
        }
    }

    if filename.contains("OIB") {
        metadata.oib_guideline = p.oib.captures(filename).map(|c| c[1].to_string());
    }

    metadata
}
