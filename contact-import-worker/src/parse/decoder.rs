use std::{
    collections::{HashMap, HashSet},
    io::{Chain, Cursor, Read},
    sync::Arc,
};

use csv::ByteRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FatalError;

/// How much of the source is inspected to guess the delimiter
pub const SAMPLE_BYTES: usize = 1024;

/// Delimiters considered by auto-detection, in tie-break priority order
pub const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

// Malformed rows keep at most this much of their raw content around
const MAX_PREVIEW_CHARS: usize = 512;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "latin1", alias = "iso-8859-1", alias = "ISO-8859-1")]
    Latin1,
}

impl Encoding {
    pub fn label(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Latin1 => "latin1",
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            Encoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    fn decode_lossy(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// None means auto-detect from the first SAMPLE_BYTES of the source
    pub delimiter: Option<u8>,
    pub has_header: bool,
    pub encoding: Encoding,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            has_header: true,
            encoding: Encoding::Utf8,
        }
    }
}

/// Row-scoped decode failures. These never stop the decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("column {column} is not valid {encoding} text")]
    InvalidEncoding {
        column: usize,
        encoding: &'static str,
    },
    #[error("quoted field is not terminated before the end of the file")]
    UnterminatedQuote,
    #[error("malformed CSV record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
}

impl Header {
    /// Builds a header from raw column names. Blank names become `column_N`, and
    /// repeated names get a `__1`, `__2`, ... suffix so every column stays addressable.
    pub fn new(names: Vec<String>) -> Self {
        let names = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let name = name.trim();
                if name.is_empty() {
                    format!("column_{}", i + 1)
                } else {
                    name.to_string()
                }
            })
            .collect();
        Self {
            names: dedupe_names(names),
        }
    }

    pub fn positional(width: usize) -> Self {
        Self {
            names: (1..=width).map(|i| format!("column_{i}")).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

pub fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        if taken.insert(name.clone()) {
            out.push(name);
            continue;
        }
        let suffix = next_suffix.entry(name.clone()).or_insert(1);
        let renamed = loop {
            let candidate = format!("{name}__{suffix}");
            *suffix += 1;
            if !taken.contains(&candidate) {
                break candidate;
            }
        };
        taken.insert(renamed.clone());
        out.push(renamed);
    }

    out
}

/// Picks the candidate delimiter occurring most often in the sample. Ties go to the
/// earlier candidate, so an empty or delimiter-free sample yields a comma.
pub fn detect_delimiter(sample: &[u8]) -> u8 {
    let mut best = CANDIDATE_DELIMITERS[0];
    let mut best_count = 0;
    for candidate in CANDIDATE_DELIMITERS {
        let count = sample.iter().filter(|b| **b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based position among the data rows of the file
    pub index: u64,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRow {
    Row(RawRow),
    Malformed {
        index: u64,
        error: DecodeError,
        preview: String,
    },
}

impl DecodedRow {
    pub fn index(&self) -> u64 {
        match self {
            DecodedRow::Row(row) => row.index,
            DecodedRow::Malformed { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

// Follows the quoting state of the byte stream as the csv reader consumes it. The csv
// reader silently closes a quoted field at end of input, this lets us notice when it did.
struct QuoteTracker<R> {
    inner: R,
    delimiter: u8,
    state: QuoteState,
}

impl<R> QuoteTracker<R> {
    fn new(inner: R, delimiter: u8) -> Self {
        Self {
            inner,
            delimiter,
            state: QuoteState::FieldStart,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        let delimiter = self.delimiter;
        for &byte in bytes {
            self.state = match (self.state, byte) {
                (QuoteState::FieldStart, b'"') => QuoteState::Quoted,
                (QuoteState::Quoted, b'"') => QuoteState::QuoteInQuoted,
                (QuoteState::Quoted, _) => QuoteState::Quoted,
                (QuoteState::QuoteInQuoted, b'"') => QuoteState::Quoted,
                (_, b'\n' | b'\r') => QuoteState::FieldStart,
                (_, b) if b == delimiter => QuoteState::FieldStart,
                _ => QuoteState::Unquoted,
            };
        }
    }

    fn in_quoted_field(&self) -> bool {
        self.state == QuoteState::Quoted
    }
}

impl<R: Read> Read for QuoteTracker<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.observe(&buf[..read]);
        Ok(read)
    }
}

type Tracked<R> = QuoteTracker<Chain<Cursor<Vec<u8>>, R>>;

// A record read from the csv reader, or the reason it could not be split into fields
type PendingRecord = Result<ByteRecord, String>;

/// Lazily decodes a CSV byte stream into rows. Memory use is bounded by the csv
/// reader's buffer and one record of lookahead, whatever the size of the source.
pub struct RowDecoder<R: Read> {
    reader: csv::Reader<Tracked<R>>,
    header: Arc<Header>,
    delimiter: u8,
    encoding: Encoding,
    lookahead: Option<PendingRecord>,
    rows_read: u64,
    strip_bom: bool,
}

impl<R: Read> RowDecoder<R> {
    /// Reads the delimiter sample and the header row. Any I/O failure here is fatal.
    pub fn new(mut source: R, options: &DecodeOptions) -> Result<Self, FatalError> {
        let sample = read_sample(&mut source)?;
        let delimiter = options
            .delimiter
            .unwrap_or_else(|| detect_delimiter(&sample));

        let tracked = QuoteTracker::new(Cursor::new(sample).chain(source), delimiter);
        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(tracked);

        let mut decoder = Self {
            reader,
            header: Arc::new(Header::default()),
            delimiter,
            encoding: options.encoding,
            lookahead: None,
            rows_read: 0,
            strip_bom: options.encoding == Encoding::Utf8,
        };

        let first = decoder.read_record()?;
        let header = match (options.has_header, first) {
            (true, Some(Ok(record))) => {
                let names = record
                    .iter()
                    .map(|field| decoder.encoding.decode_lossy(field))
                    .collect();
                decoder.strip_bom = false;
                Header::new(strip_bom(names))
            }
            (true, _) => Header::default(),
            (false, Some(first)) => {
                let width = first.as_ref().map(|r| r.len()).unwrap_or(0);
                decoder.lookahead = Some(first);
                Header::positional(width)
            }
            (false, None) => Header::default(),
        };
        decoder.header = Arc::new(header);

        Ok(decoder)
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn next_row(&mut self) -> Result<Option<DecodedRow>, FatalError> {
        let current = match self.lookahead.take() {
            Some(record) => record,
            None => match self.read_record()? {
                Some(record) => record,
                None => return Ok(None),
            },
        };

        // One record of lookahead tells us whether `current` is the last one, which is
        // the only record an unterminated quote can end up in.
        self.lookahead = self.read_record()?;
        let unterminated = self.lookahead.is_none() && self.reader.get_ref().in_quoted_field();

        self.rows_read += 1;
        Ok(Some(self.decode(self.rows_read, current, unterminated)))
    }

    /// Consumes the decoder, counting the data rows left without decoding them.
    pub fn count_remaining(mut self) -> Result<u64, FatalError> {
        let mut count = u64::from(self.lookahead.take().is_some());
        while self.read_record()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    fn read_record(&mut self) -> Result<Option<PendingRecord>, FatalError> {
        let mut record = ByteRecord::new();
        match self.reader.read_byte_record(&mut record) {
            Ok(true) => Ok(Some(Ok(record))),
            Ok(false) => Ok(None),
            Err(e) => match e.into_kind() {
                csv::ErrorKind::Io(io) => Err(FatalError::SourceUnreadable(io)),
                other => Ok(Some(Err(format!("{other:?}")))),
            },
        }
    }

    fn decode(&mut self, index: u64, pending: PendingRecord, unterminated: bool) -> DecodedRow {
        let record = match pending {
            Ok(record) => record,
            Err(message) => {
                return DecodedRow::Malformed {
                    index,
                    error: DecodeError::Malformed(message),
                    preview: String::new(),
                }
            }
        };

        if unterminated {
            return DecodedRow::Malformed {
                index,
                error: DecodeError::UnterminatedQuote,
                preview: self.preview(&record),
            };
        }

        let mut values = Vec::with_capacity(record.len());
        for (column, field) in record.iter().enumerate() {
            match self.encoding.decode(field) {
                Some(value) => values.push(value),
                None => {
                    return DecodedRow::Malformed {
                        index,
                        error: DecodeError::InvalidEncoding {
                            column: column + 1,
                            encoding: self.encoding.label(),
                        },
                        preview: self.preview(&record),
                    }
                }
            }
        }

        if self.strip_bom {
            self.strip_bom = false;
            values = strip_bom(values);
        }

        DecodedRow::Row(RawRow { index, values })
    }

    fn preview(&self, record: &ByteRecord) -> String {
        let delimiter = char::from(self.delimiter).to_string();
        let joined = record
            .iter()
            .map(|field| self.encoding.decode_lossy(field))
            .collect::<Vec<_>>()
            .join(&delimiter);
        joined.chars().take(MAX_PREVIEW_CHARS).collect()
    }
}

impl<R: Read> Iterator for RowDecoder<R> {
    type Item = Result<DecodedRow, FatalError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

fn read_sample<R: Read>(source: &mut R) -> Result<Vec<u8>, FatalError> {
    let mut sample = vec![0; SAMPLE_BYTES];
    let mut filled = 0;
    while filled < SAMPLE_BYTES {
        match source.read(&mut sample[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FatalError::SourceUnreadable(e)),
        }
    }
    sample.truncate(filled);
    Ok(sample)
}

fn strip_bom(mut values: Vec<String>) -> Vec<String> {
    if let Some(first) = values.first_mut() {
        if let Some(stripped) = first.strip_prefix(BOM) {
            *first = stripped.to_string();
        }
    }
    values
}
