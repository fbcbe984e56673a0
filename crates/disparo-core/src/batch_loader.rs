use crate::ContactRecord;
use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;

pub const NAME_COLUMNS: [&str; 2] = ["nome", "name"];
pub const PHONE_COLUMNS: [&str; 2] = ["telefone", "phone"];
pub const MESSAGE_COLUMNS: [&str; 2] = ["mensagem", "message"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("csv parse error: {0}")]
    CsvParse(#[from] csv::Error),
    #[error("csv file has no data rows")]
    EmptyBatch,
}

impl LoadError {
    pub fn code(&self) -> &'static str {
        match self {
            LoadError::CsvParse(_) => "CSV_PARSE_ERROR",
            LoadError::EmptyBatch => "CSV_EMPTY",
        }
    }
}

struct ColumnIndex {
    headers: Vec<String>,
}

impl ColumnIndex {
    fn new(headers: &StringRecord) -> Self {
        let headers = headers
            .iter()
            .map(|header| header.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();
        Self { headers }
    }

    /// First non-empty value among the aliased columns, in alias order.
    fn first_value(&self, row: &StringRecord, aliases: &[&str]) -> String {
        aliases
            .iter()
            .filter_map(|alias| self.headers.iter().position(|header| header.as_str() == *alias))
            .filter_map(|idx| row.get(idx))
            .find(|value| !value.is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

/// Parse an uploaded CSV into pending contact records, one per data row.
///
/// Only header aliasing is done here; missing phone or message columns become
/// empty strings and are rejected later by the dispatch pipeline.
pub fn load_contacts(raw: &[u8]) -> Result<Vec<ContactRecord>, LoadError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw);
    let columns = ColumnIndex::new(reader.headers()?);

    let mut contacts = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let row = result?;
        let name = columns.first_value(&row, &NAME_COLUMNS);
        contacts.push(ContactRecord::new(
            idx,
            Some(name),
            columns.first_value(&row, &PHONE_COLUMNS),
            columns.first_value(&row, &MESSAGE_COLUMNS),
        ));
    }

    if contacts.is_empty() {
        return Err(LoadError::EmptyBatch);
    }
    Ok(contacts)
}
