use std::{collections::HashSet, fmt::Display};

use crate::{
    parse::normalize::collapse_whitespace,
    store::{ExistingKeys, KeyProbe},
    types::ContactRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateReason {
    /// Email seen earlier in this file
    Email,
    /// Name and company seen earlier in this file
    NameCompany,
    ExistingEmail,
    ExistingNameCompany,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::Email => "email",
            DuplicateReason::NameCompany => "name+company",
            DuplicateReason::ExistingEmail => "existing_email",
            DuplicateReason::ExistingNameCompany => "existing_name+company",
        }
    }
}

impl Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Duplicate(DuplicateReason),
}

/// Identity keys of a contact, compared by exact match only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKeys {
    pub email: Option<String>,
    pub name: String,
    pub company: String,
}

impl DedupKeys {
    pub fn of(record: &ContactRecord) -> Self {
        Self {
            email: record.email.clone(),
            name: name_key(&record.full_name),
            company: record
                .company_name
                .as_deref()
                .map(company_key)
                .unwrap_or_default(),
        }
    }

    pub fn pair(&self) -> (String, String) {
        (self.name.clone(), self.company.clone())
    }
}

pub fn name_key(full_name: &str) -> String {
    collapse_whitespace(full_name).to_lowercase()
}

pub fn company_key(company: &str) -> String {
    collapse_whitespace(company).to_lowercase()
}

/// Builds the store lookup for one chunk of rows.
pub fn probe_for<'a>(keys: impl IntoIterator<Item = &'a DedupKeys>) -> KeyProbe {
    let mut probe = KeyProbe::default();
    let mut seen_emails = HashSet::new();
    let mut seen_pairs = HashSet::new();
    for key in keys {
        if let Some(email) = &key.email {
            if seen_emails.insert(email.clone()) {
                probe.emails.push(email.clone());
            }
        }
        let pair = key.pair();
        if seen_pairs.insert(pair.clone()) {
            probe.name_company.push(pair);
        }
    }
    probe
}

/// Per-job duplicate state. Rows must be classified in file order, so the result for
/// a row depends only on the rows before it.
#[derive(Debug, Default)]
pub struct DuplicateResolver {
    emails: HashSet<String>,
    pairs: HashSet<(String, String)>,
}

impl DuplicateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a row and, when it is new, remembers its keys. `existing` holds the
    /// keys already in the store, empty when cross-job checking is off.
    pub fn classify(&mut self, keys: &DedupKeys, existing: &ExistingKeys) -> Classification {
        let pair = keys.pair();

        if let Some(email) = &keys.email {
            if self.emails.contains(email) {
                return Classification::Duplicate(DuplicateReason::Email);
            }
        }
        if self.pairs.contains(&pair) {
            return Classification::Duplicate(DuplicateReason::NameCompany);
        }
        if let Some(email) = &keys.email {
            if existing.emails.contains(email) {
                return Classification::Duplicate(DuplicateReason::ExistingEmail);
            }
        }
        if existing.name_company.contains(&pair) {
            return Classification::Duplicate(DuplicateReason::ExistingNameCompany);
        }

        if let Some(email) = &keys.email {
            self.emails.insert(email.clone());
        }
        self.pairs.insert(pair);
        Classification::New
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
