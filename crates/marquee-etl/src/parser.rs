//! Tab-delimited dump parser
//!
//! Turns a gzipped dump into a lazy, single-pass sequence of [`Record`]s.
//!
//! # File Format
//! The first line is a header naming the columns. Every following line holds
//! one row, fields separated by `\t`. The literal `\N` marks a missing value.
//! Multi-valued fields (professions, genres, known-for titles) are separated
//! by `,`. In the participations dump `characters` is a JSON array such as
//! `["Self","Narrator"]`.
//!
//! Malformed rows are skipped and counted in the [`ParseSummary`]; only
//! problems with the file itself (bad header, broken gzip stream) end the
//! sequence with an [`EtlError::CorruptSource`].

use crate::error::{EtlError, EtlResult};
use crate::models::{Dataset, Participation, Person, Rating, Record, RoleCategory, Title};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Missing-value sentinel used throughout the dumps
pub const NULL_MARKER: &str = "\\N";

const FIELD_DELIMITER: char = '\t';
const LIST_DELIMITER: char = ',';

/// Row errors kept verbatim in the summary; the rest are only counted
pub const MAX_SAMPLE_ERRORS: usize = 10;

/// Row errors logged at warn level before switching to debug
const MAX_LOGGED_ERRORS: u64 = 25;

/// Decompression buffer; the dumps are hundreds of MB compressed
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Records buffered between the parsing thread and the loader
pub const CHANNEL_CAPACITY: usize = 10_000;

/// A row that could not be turned into a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowParseError {
    pub line: u64,
    pub reason: String,
}

impl fmt::Display for RowParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Counters describing one pass over a dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseSummary {
    pub dataset: Dataset,
    /// Data rows read, excluding the header and blank lines
    pub rows_read: u64,
    pub records_emitted: u64,
    /// Malformed rows
    pub rows_skipped: u64,
    /// Well-formed participations whose role is not actor/actress
    pub rows_filtered: u64,
    pub sample_errors: Vec<RowParseError>,
}

impl ParseSummary {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            rows_read: 0,
            records_emitted: 0,
            rows_skipped: 0,
            rows_filtered: 0,
            sample_errors: Vec::new(),
        }
    }

    fn record_error(&mut self, error: RowParseError) {
        self.rows_skipped += 1;
        if self.rows_skipped <= MAX_LOGGED_ERRORS {
            warn!(dataset = %self.dataset, line = error.line, reason = %error.reason, "Skipping malformed row");
        } else {
            debug!(dataset = %self.dataset, line = error.line, reason = %error.reason, "Skipping malformed row");
        }
        if self.sample_errors.len() < MAX_SAMPLE_ERRORS {
            self.sample_errors.push(error);
        }
    }
}

/// Result of parsing one data line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Record(Record),
    /// Valid row that is intentionally dropped (role not of interest)
    Filtered,
}

// ============================================================================
// Field helpers
// ============================================================================

fn optional(field: &str) -> Option<&str> {
    if field == NULL_MARKER || field.is_empty() {
        None
    } else {
        Some(field)
    }
}

fn required<'a>(field: &'a str, name: &str) -> Result<&'a str, String> {
    optional(field).ok_or_else(|| format!("missing required field {}", name))
}

fn optional_number<T: FromStr>(field: &str, name: &str) -> Result<Option<T>, String> {
    optional(field)
        .map(|value| {
            value
                .parse()
                .map_err(|_| format!("invalid {} '{}'", name, value))
        })
        .transpose()
}

fn required_number<T: FromStr>(field: &str, name: &str) -> Result<T, String> {
    let value = required(field, name)?;
    value
        .parse()
        .map_err(|_| format!("invalid {} '{}'", name, value))
}

fn list(field: &str) -> Vec<String> {
    optional(field)
        .map(|value| {
            value
                .split(LIST_DELIMITER)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `characters` is a JSON array; anything else is kept as a single entry
fn characters(field: &str) -> Vec<String> {
    match optional(field) {
        None => Vec::new(),
        Some(raw) => serde_json::from_str::<Vec<String>>(raw).unwrap_or_else(|_| vec![raw.to_string()]),
    }
}

fn split_fields(dataset: Dataset, line: &str) -> Result<Vec<&str>, String> {
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    let expected = dataset.expected_header().len();
    if fields.len() != expected {
        return Err(format!("expected {} fields, got {}", expected, fields.len()));
    }
    Ok(fields)
}

// ============================================================================
// Per-dataset row parsers
// ============================================================================

fn parse_person(fields: &[&str]) -> Result<Person, String> {
    Ok(Person {
        nconst: required(fields[0], "nconst")?.to_string(),
        primary_name: required(fields[1], "primaryName")?.to_string(),
        birth_year: optional_number(fields[2], "birthYear")?,
        death_year: optional_number(fields[3], "deathYear")?,
        primary_profession: list(fields[4]),
        known_for_titles: list(fields[5]),
    })
}

fn parse_title(fields: &[&str]) -> Result<Title, String> {
    let is_adult = match optional(fields[4]) {
        None | Some("0") => false,
        Some("1") => true,
        Some(other) => return Err(format!("invalid isAdult '{}'", other)),
    };

    Ok(Title {
        tconst: required(fields[0], "tconst")?.to_string(),
        title_type: required(fields[1], "titleType")?.to_string(),
        primary_title: required(fields[2], "primaryTitle")?.to_string(),
        original_title: optional(fields[3]).map(str::to_string),
        is_adult,
        start_year: optional_number(fields[5], "startYear")?,
        end_year: optional_number(fields[6], "endYear")?,
        runtime_minutes: optional_number(fields[7], "runtimeMinutes")?,
        genres: list(fields[8]),
    })
}

fn parse_rating(fields: &[&str]) -> Result<Rating, String> {
    let average_rating: f64 = required_number(fields[1], "averageRating")?;
    if !(0.0..=10.0).contains(&average_rating) {
        return Err(format!("averageRating {} outside [0, 10]", average_rating));
    }

    let num_votes: i64 = required_number(fields[2], "numVotes")?;
    if num_votes < 0 {
        return Err(format!("negative numVotes {}", num_votes));
    }

    Ok(Rating {
        tconst: required(fields[0], "tconst")?.to_string(),
        average_rating,
        num_votes,
    })
}

fn parse_participation(fields: &[&str]) -> Result<ParsedLine, String> {
    // Filter before validating the rest so crew rows never count as errors
    let category = match optional(fields[3]).and_then(|c| c.parse::<RoleCategory>().ok()) {
        Some(category) => category,
        None => return Ok(ParsedLine::Filtered),
    };

    Ok(ParsedLine::Record(Record::Participation(Participation {
        tconst: required(fields[0], "tconst")?.to_string(),
        ordering: required_number(fields[1], "ordering")?,
        nconst: required(fields[2], "nconst")?.to_string(),
        category,
        job: optional(fields[4]).map(str::to_string),
        characters: characters(fields[5]),
    })))
}

/// Parse a single data line of `dataset`
pub fn parse_line(dataset: Dataset, line: &str) -> Result<ParsedLine, String> {
    let fields = split_fields(dataset, line)?;
    match dataset {
        Dataset::People => parse_person(&fields).map(|p| ParsedLine::Record(Record::Person(p))),
        Dataset::Titles => parse_title(&fields).map(|t| ParsedLine::Record(Record::Title(t))),
        Dataset::Ratings => parse_rating(&fields).map(|r| ParsedLine::Record(Record::Rating(r))),
        Dataset::Participations => parse_participation(&fields),
    }
}

/// Check a header line against the columns `dataset` must have
pub fn validate_header(dataset: Dataset, header: &str) -> EtlResult<()> {
    let columns: Vec<&str> = header
        .trim_end_matches(['\r', '\n'])
        .split(FIELD_DELIMITER)
        .collect();
    if columns != dataset.expected_header() {
        return Err(EtlError::corrupt(
            dataset,
            format!(
                "unexpected header [{}], expected [{}]",
                columns.join(", "),
                dataset.expected_header().join(", ")
            ),
        ));
    }
    Ok(())
}

// ============================================================================
// Streaming parser
// ============================================================================

/// Lazy record iterator over one dump.
///
/// Yields `Ok(record)` for every valid row. An `Err` means the file itself is
/// unreadable; the iterator is exhausted afterwards.
pub struct RecordParser<R: BufRead> {
    dataset: Dataset,
    reader: R,
    /// Raw line bytes; decoded per row so bad encoding only costs that row
    buffer: Vec<u8>,
    line_no: u64,
    parse_limit: Option<usize>,
    summary: ParseSummary,
    finished: bool,
}

impl RecordParser<BufReader<GzDecoder<File>>> {
    /// Open a gzipped dump and validate its header
    pub fn open(path: &Path, dataset: Dataset) -> EtlResult<Self> {
        let file = File::open(path)
            .map_err(|e| EtlError::corrupt(dataset, format!("cannot open {}: {}", path.display(), e)))?;
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, GzDecoder::new(file));
        Self::from_reader(reader, dataset)
    }
}

impl<R: BufRead> RecordParser<R> {
    /// Wrap an already-decompressed reader and validate its header
    pub fn from_reader(mut reader: R, dataset: Dataset) -> EtlResult<Self> {
        let mut header = String::new();
        let read = reader
            .read_line(&mut header)
            .map_err(|e| EtlError::corrupt(dataset, format!("failed to read header: {}", e)))?;
        if read == 0 {
            return Err(EtlError::corrupt(dataset, "file is empty"));
        }
        validate_header(dataset, &header)?;

        Ok(Self {
            dataset,
            reader,
            buffer: Vec::new(),
            line_no: 1,
            parse_limit: None,
            summary: ParseSummary::new(dataset),
            finished: false,
        })
    }

    /// Stop after `limit` emitted records
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.parse_limit = limit;
        self
    }

    pub fn summary(&self) -> &ParseSummary {
        &self.summary
    }

    pub fn into_summary(self) -> ParseSummary {
        self.summary
    }

    fn limit_reached(&self) -> bool {
        self.parse_limit
            .is_some_and(|limit| self.summary.records_emitted >= limit as u64)
    }
}

impl<R: BufRead> Iterator for RecordParser<R> {
    type Item = EtlResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if self.limit_reached() {
                debug!(dataset = %self.dataset, limit = ?self.parse_limit, "Reached parse limit");
                self.finished = true;
                break;
            }

            self.buffer.clear();
            match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(0) => {
                    self.finished = true;
                },
                Ok(_) => {
                    self.line_no += 1;
                    let line = match std::str::from_utf8(&self.buffer) {
                        Ok(text) => text.trim_end_matches(['\r', '\n']),
                        Err(e) => {
                            self.summary.rows_read += 1;
                            let line = self.line_no;
                            self.summary.record_error(RowParseError {
                                line,
                                reason: format!("invalid UTF-8 after byte {}", e.valid_up_to()),
                            });
                            continue;
                        },
                    };
                    if line.is_empty() {
                        continue;
                    }
                    self.summary.rows_read += 1;

                    match parse_line(self.dataset, line) {
                        Ok(ParsedLine::Record(record)) => {
                            self.summary.records_emitted += 1;
                            return Some(Ok(record));
                        },
                        Ok(ParsedLine::Filtered) => {
                            self.summary.rows_filtered += 1;
                        },
                        Err(reason) => {
                            let line = self.line_no;
                            self.summary.record_error(RowParseError { line, reason });
                        },
                    }
                },
                Err(e) => {
                    self.finished = true;
                    return Some(Err(EtlError::corrupt(
                        self.dataset,
                        format!("read failed after line {}: {}", self.line_no, e),
                    )));
                },
            }
        }
        None
    }
}

/// Parse `path` on a blocking thread and stream the records back.
///
/// The bounded channel applies back-pressure: parsing pauses while the
/// loader is busy. The join handle resolves to the final summary, or to the
/// fatal error that ended the stream early. Dropping the stream stops the
/// parsing thread at its next send.
pub fn spawn_parser(
    path: PathBuf,
    dataset: Dataset,
    parse_limit: Option<usize>,
    cancel: CancellationToken,
) -> (ReceiverStream<Record>, JoinHandle<EtlResult<ParseSummary>>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let handle = tokio::task::spawn_blocking(move || -> EtlResult<ParseSummary> {
        let mut parser = RecordParser::open(&path, dataset)?.with_limit(parse_limit);

        for item in parser.by_ref() {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            if tx.blocking_send(item?).is_err() {
                debug!(dataset = %dataset, "Record consumer went away, stopping parser");
                break;
            }
        }

        let summary = parser.into_summary();
        info!(
            dataset = %dataset,
            rows_read = summary.rows_read,
            emitted = summary.records_emitted,
            skipped = summary.rows_skipped,
            filtered = summary.rows_filtered,
            "Finished parsing"
        );
        Ok(summary)
    });

    (ReceiverStream::new(rx), handle)
}
