use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::FatalError,
    parse::{
        decoder::{DecodeOptions, Encoding},
        fields::FieldMapping,
    },
    source::{file::FileSource, DataSource},
};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_RETAINED_ERRORS: usize = 100;

/// Everything needed to create a job, as supplied by whoever uploaded the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub source_name: String,
    pub source: SourceConfig,
    pub field_mapping: FieldMapping,
    #[serde(default)]
    pub options: ImportOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    File { path: PathBuf },
}

impl SourceConfig {
    pub fn construct(&self) -> Box<dyn DataSource> {
        match self {
            SourceConfig::File { path } => Box::new(FileSource::new(path.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    // None means detect it from the start of the file
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retained_errors")]
    pub max_retained_errors: usize,
    #[serde(default)]
    pub count_rows_first: bool,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_retained_errors() -> usize {
    DEFAULT_MAX_RETAINED_ERRORS
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            has_header: true,
            encoding: Encoding::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retained_errors: DEFAULT_MAX_RETAINED_ERRORS,
            count_rows_first: false,
        }
    }
}

impl ImportOptions {
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.batch_size == 0 {
            return Err(FatalError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        self.delimiter_byte().map(drop)
    }

    pub fn decode_options(&self) -> Result<DecodeOptions, FatalError> {
        Ok(DecodeOptions {
            delimiter: self.delimiter_byte()?,
            has_header: self.has_header,
            encoding: self.encoding,
        })
    }

    fn delimiter_byte(&self) -> Result<Option<u8>, FatalError> {
        let Some(delimiter) = self.delimiter else {
            return Ok(None);
        };
        match u8::try_from(delimiter) {
            Ok(byte) if byte.is_ascii() && byte != b'"' && byte != b'\n' && byte != b'\r' => {
                Ok(Some(byte))
            }
            _ => Err(FatalError::InvalidConfig(format!(
                "{delimiter:?} cannot be used as a delimiter"
            ))),
        }
    }
}
