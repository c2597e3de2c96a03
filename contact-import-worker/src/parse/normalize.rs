use once_cell::sync::Lazy;
use regex::Regex;

use crate::{job::model::RowError, types::ContactRecord};

use super::{
    decoder::{DecodedRow, RawRow},
    fields::{ColumnBindings, ContactField},
};

pub const MAX_EMAIL_LEN: usize = 254;
pub const MIN_PHONE_DIGITS: usize = 10;
pub const MAX_PHONE_DIGITS: usize = 15;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@.]+(\.[^\s@.]+)+$").expect("email pattern is valid")
});

/// The outcome of normalizing one decoded row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedRow {
    Valid {
        row: u64,
        record: ContactRecord,
        // Fields that were dropped but didn't sink the row
        warnings: Vec<RowError>,
        preview: String,
    },
    Invalid(RowError),
}

impl NormalizedRow {
    pub fn row(&self) -> u64 {
        match self {
            NormalizedRow::Valid { row, .. } => *row,
            NormalizedRow::Invalid(err) => err.row,
        }
    }
}

pub fn truncate_preview(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect()
}

pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trimmed and lowercased. Ok(None) for an empty value.
pub fn normalize_email(raw: &str) -> Result<Option<String>, String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Ok(None);
    }
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err(format!(
            "email is longer than {MAX_EMAIL_LEN} characters"
        ));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(format!("'{email}' is not a valid email address"));
    }
    Ok(Some(email))
}

/// Digits only, keeping a leading `+`. Ok(None) for an empty value.
pub fn normalize_phone(raw: &str) -> Result<Option<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(format!(
            "phone number has {} digits, expected {MIN_PHONE_DIGITS} to {MAX_PHONE_DIGITS}",
            digits.len()
        ));
    }
    if trimmed.starts_with('+') {
        Ok(Some(format!("+{digits}")))
    } else {
        Ok(Some(digits))
    }
}

pub fn normalize_name(raw: &str) -> Option<String> {
    Some(collapse_whitespace(raw)).filter(|n| !n.is_empty())
}

fn normalize_text(raw: &str) -> Option<String> {
    Some(raw.trim().to_string()).filter(|v| !v.is_empty())
}

fn row_preview(values: &[String], max_chars: usize) -> String {
    truncate_preview(&values.join(","), max_chars)
}

/// Maps one decoded row onto a contact. Pure: the same row and bindings always give
/// the same result.
pub fn normalize_row(row: &RawRow, bindings: &ColumnBindings, preview_chars: usize) -> NormalizedRow {
    let preview = row_preview(&row.values, preview_chars);

    if row.values.len() != bindings.width {
        return NormalizedRow::Invalid(RowError::error(
            row.index,
            vec![],
            format!(
                "expected {} columns, found {}",
                bindings.width,
                row.values.len()
            ),
            preview,
        ));
    }

    let mut record = ContactRecord::default();
    let mut failed_fields = Vec::new();
    let mut messages = Vec::new();
    let mut warnings = Vec::new();

    for &(column, field) in &bindings.columns {
        let raw = row.values[column].as_str();
        let value = match field {
            ContactField::Email => match normalize_email(raw) {
                Ok(v) => v,
                Err(msg) => {
                    failed_fields.push(field.to_string());
                    messages.push(msg);
                    None
                }
            },
            ContactField::SecondaryEmail => normalize_email(raw).unwrap_or_else(|msg| {
                warnings.push(RowError::warning(
                    row.index,
                    vec![field.to_string()],
                    msg,
                    preview.clone(),
                ));
                None
            }),
            f if f.is_phone() => normalize_phone(raw).unwrap_or_else(|msg| {
                warnings.push(RowError::warning(
                    row.index,
                    vec![field.to_string()],
                    msg,
                    preview.clone(),
                ));
                None
            }),
            f if f.is_name() => normalize_name(raw),
            _ => normalize_text(raw),
        };
        record.set(field, value);
    }

    if record.full_name.is_empty() {
        let parts: Vec<&str> = [record.first_name.as_deref(), record.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        record.full_name = parts.join(" ");
    }
    if record.full_name.is_empty() {
        failed_fields.push(ContactField::FullName.to_string());
        messages.push("full name is empty".to_string());
    }

    if !messages.is_empty() {
        return NormalizedRow::Invalid(RowError::error(
            row.index,
            failed_fields,
            messages.join("; "),
            preview,
        ));
    }

    record.derive();
    NormalizedRow::Valid {
        row: row.index,
        record,
        warnings,
        preview,
    }
}

pub fn normalize_decoded(
    decoded: DecodedRow,
    bindings: &ColumnBindings,
    preview_chars: usize,
) -> NormalizedRow {
    match decoded {
        DecodedRow::Row(row) => normalize_row(&row, bindings, preview_chars),
        DecodedRow::Malformed {
            index,
            error,
            preview,
        } => NormalizedRow::Invalid(RowError::error(
            index,
            vec![],
            error.to_string(),
            truncate_preview(&preview, preview_chars),
        )),
    }
}
