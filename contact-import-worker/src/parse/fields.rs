use std::{collections::HashSet, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::error::FatalError;

use super::decoder::Header;

/// Contact attributes a source column can be mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactField {
    FirstName,
    LastName,
    FullName,
    Title,
    Seniority,
    Department,
    Email,
    SecondaryEmail,
    MobilePhone,
    OtherPhone,
    HomePhone,
    CorporatePhone,
    LinkedinUrl,
    CompanyName,
    CompanyWebsite,
    CompanyIndustry,
    CompanySize,
    City,
    State,
    Country,
}

impl ContactField {
    pub const ALL: [ContactField; 20] = [
        ContactField::FirstName,
        ContactField::LastName,
        ContactField::FullName,
        ContactField::Title,
        ContactField::Seniority,
        ContactField::Department,
        ContactField::Email,
        ContactField::SecondaryEmail,
        ContactField::MobilePhone,
        ContactField::OtherPhone,
        ContactField::HomePhone,
        ContactField::CorporatePhone,
        ContactField::LinkedinUrl,
        ContactField::CompanyName,
        ContactField::CompanyWebsite,
        ContactField::CompanyIndustry,
        ContactField::CompanySize,
        ContactField::City,
        ContactField::State,
        ContactField::Country,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactField::FirstName => "first_name",
            ContactField::LastName => "last_name",
            ContactField::FullName => "full_name",
            ContactField::Title => "title",
            ContactField::Seniority => "seniority",
            ContactField::Department => "department",
            ContactField::Email => "email",
            ContactField::SecondaryEmail => "secondary_email",
            ContactField::MobilePhone => "mobile_phone",
            ContactField::OtherPhone => "other_phone",
            ContactField::HomePhone => "home_phone",
            ContactField::CorporatePhone => "corporate_phone",
            ContactField::LinkedinUrl => "linkedin_url",
            ContactField::CompanyName => "company_name",
            ContactField::CompanyWebsite => "company_website",
            ContactField::CompanyIndustry => "company_industry",
            ContactField::CompanySize => "company_size",
            ContactField::City => "city",
            ContactField::State => "state",
            ContactField::Country => "country",
        }
    }

    pub fn is_name(&self) -> bool {
        matches!(
            self,
            ContactField::FirstName | ContactField::LastName | ContactField::FullName
        )
    }

    pub fn is_phone(&self) -> bool {
        matches!(
            self,
            ContactField::MobilePhone
                | ContactField::OtherPhone
                | ContactField::HomePhone
                | ContactField::CorporatePhone
        )
    }
}

impl Display for ContactField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMappingEntry {
    pub source: String,
    pub target: ContactField,
}

/// Ordered source column -> contact attribute mapping, supplied by whoever
/// created the import. Stored as a JSON array so the order survives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(pub Vec<FieldMappingEntry>);

impl FieldMapping {
    pub fn new<S: Into<String>>(entries: impl IntoIterator<Item = (S, ContactField)>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(source, target)| FieldMappingEntry {
                    source: source.into(),
                    target,
                })
                .collect(),
        )
    }

    pub fn entries(&self) -> &[FieldMappingEntry] {
        &self.0
    }

    /// Checks the mapping on its own, before any byte of the source is read.
    pub fn validate(&self) -> Result<(), FatalError> {
        if !self.0.iter().any(|e| e.target.is_name()) {
            return Err(FatalError::InvalidConfig(
                "no column is mapped to full_name, first_name or last_name".to_string(),
            ));
        }

        let mut targets = HashSet::new();
        for entry in &self.0 {
            if !targets.insert(entry.target) {
                return Err(FatalError::InvalidConfig(format!(
                    "more than one column is mapped to {}",
                    entry.target
                )));
            }
        }
        Ok(())
    }

    /// Resolves every mapped column against the decoded header.
    pub fn bind(&self, header: &Header) -> Result<ColumnBindings, FatalError> {
        self.validate()?;
        let mut columns = Vec::with_capacity(self.0.len());
        for entry in &self.0 {
            let Some(index) = header.position(&entry.source) else {
                return Err(FatalError::InvalidConfig(format!(
                    "mapped column '{}' is not present in the file header",
                    entry.source
                )));
            };
            columns.push((index, entry.target));
        }
        Ok(ColumnBindings {
            width: header.len(),
            columns,
        })
    }
}

/// A field mapping resolved to column positions for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBindings {
    pub width: usize,
    pub columns: Vec<(usize, ContactField)>,
}
