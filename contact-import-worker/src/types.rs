use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parse::fields::ContactField;

// Title words that mark a decision maker, matched against whole words of the title
const SENIOR_TITLE_WORDS: [&str; 17] = [
    "chief", "ceo", "cto", "cfo", "coo", "cmo", "cio", "cro", "vp", "svp", "evp", "head",
    "director", "founder", "cofounder", "owner", "partner",
];

pub const MAX_LEAD_SCORE: i32 = 100;

/// A normalized contact, ready to be written. `full_name` is never empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub title: Option<String>,
    pub seniority: Option<String>,
    pub department: Option<String>,
    pub email: Option<String>,
    pub secondary_email: Option<String>,
    pub mobile_phone: Option<String>,
    pub other_phone: Option<String>,
    pub home_phone: Option<String>,
    pub corporate_phone: Option<String>,
    pub linkedin_url: Option<String>,
    pub company_name: Option<String>,
    pub company_website: Option<String>,
    pub company_industry: Option<String>,
    pub company_size: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub email_domain: Option<String>,
    pub lead_score: i32,
    pub is_deleted: bool,
}

impl ContactRecord {
    pub fn get(&self, field: ContactField) -> Option<&str> {
        let value = match field {
            ContactField::FullName => return Some(self.full_name.as_str()).filter(|s| !s.is_empty()),
            ContactField::FirstName => &self.first_name,
            ContactField::LastName => &self.last_name,
            ContactField::Title => &self.title,
            ContactField::Seniority => &self.seniority,
            ContactField::Department => &self.department,
            ContactField::Email => &self.email,
            ContactField::SecondaryEmail => &self.secondary_email,
            ContactField::MobilePhone => &self.mobile_phone,
            ContactField::OtherPhone => &self.other_phone,
            ContactField::HomePhone => &self.home_phone,
            ContactField::CorporatePhone => &self.corporate_phone,
            ContactField::LinkedinUrl => &self.linkedin_url,
            ContactField::CompanyName => &self.company_name,
            ContactField::CompanyWebsite => &self.company_website,
            ContactField::CompanyIndustry => &self.company_industry,
            ContactField::CompanySize => &self.company_size,
            ContactField::City => &self.city,
            ContactField::State => &self.state,
            ContactField::Country => &self.country,
        };
        value.as_deref()
    }

    pub fn set(&mut self, field: ContactField, value: Option<String>) {
        let slot = match field {
            ContactField::FullName => {
                self.full_name = value.unwrap_or_default();
                return;
            }
            ContactField::FirstName => &mut self.first_name,
            ContactField::LastName => &mut self.last_name,
            ContactField::Title => &mut self.title,
            ContactField::Seniority => &mut self.seniority,
            ContactField::Department => &mut self.department,
            ContactField::Email => &mut self.email,
            ContactField::SecondaryEmail => &mut self.secondary_email,
            ContactField::MobilePhone => &mut self.mobile_phone,
            ContactField::OtherPhone => &mut self.other_phone,
            ContactField::HomePhone => &mut self.home_phone,
            ContactField::CorporatePhone => &mut self.corporate_phone,
            ContactField::LinkedinUrl => &mut self.linkedin_url,
            ContactField::CompanyName => &mut self.company_name,
            ContactField::CompanyWebsite => &mut self.company_website,
            ContactField::CompanyIndustry => &mut self.company_industry,
            ContactField::CompanySize => &mut self.company_size,
            ContactField::City => &mut self.city,
            ContactField::State => &mut self.state,
            ContactField::Country => &mut self.country,
        };
        *slot = value;
    }

    pub fn has_phone(&self) -> bool {
        self.mobile_phone.is_some()
            || self.other_phone.is_some()
            || self.home_phone.is_some()
            || self.corporate_phone.is_some()
    }

    /// Fills in the fields computed from the others. Call after every mutation.
    pub fn derive(&mut self) {
        self.email_domain = self
            .email
            .as_deref()
            .or(self.secondary_email.as_deref())
            .and_then(|e| e.rsplit_once('@'))
            .map(|(_, domain)| domain.to_string());
        self.lead_score = lead_score(self);
    }
}

pub fn is_senior_title(title: &str) -> bool {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| SENIOR_TITLE_WORDS.contains(&word))
}

/// Completeness score in 0..=100, higher for contacts worth reaching out to first.
pub fn lead_score(record: &ContactRecord) -> i32 {
    let mut score = 0;
    if record.email.is_some() {
        score += 20;
    }
    if record.has_phone() {
        score += 15;
    }
    if record.corporate_phone.is_some() {
        score += 5;
    }
    if let Some(title) = &record.title {
        score += 10;
        if is_senior_title(title) {
            score += 15;
        }
    }
    if record.company_name.is_some() {
        score += 10;
    }
    if record.company_website.is_some() {
        score += 5;
    }
    if record.linkedin_url.is_some() {
        score += 10;
    }
    if record.city.is_some() || record.country.is_some() {
        score += 5;
    }
    score.min(MAX_LEAD_SCORE)
}

/// A record that passed validation and deduplication, waiting for its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingContact {
    pub row: u64,
    pub record: ContactRecord,
    pub preview: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Imported,
    Created,
    Updated,
    Enriched,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Imported => "imported",
            ActivityType::Created => "created",
            ActivityType::Updated => "updated",
            ActivityType::Enriched => "enriched",
        }
    }
}

/// Append-only audit entry, written in the same transaction as the contact it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactActivity {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub activity_type: ActivityType,
    pub description: String,
    pub changes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ContactActivity {
    pub fn imported(contact_id: Uuid, job_id: Uuid, row: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            contact_id,
            activity_type: ActivityType::Imported,
            description: format!("Imported from row {row} of import {job_id}"),
            changes: serde_json::json!({ "import_job_id": job_id, "row": row }),
            created_at: Utc::now(),
        }
    }
}
