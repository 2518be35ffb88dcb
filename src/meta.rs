//! Processed-date log stored as a CSV object in the target bucket.
//!
//! The log is read-modify-written without locking; only one job instance
//! may run against a given meta key at a time.

use std::collections::BTreeSet;

use chrono::{Days, NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, info};

use crate::object_store::{ObjectStore, StoreError, Table};

pub const META_DATE_FORMAT: &str = "%Y-%m-%d";
pub const META_PROCESS_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const META_SOURCE_DATE_COL: &str = "source_date";
pub const META_PROCESS_COL: &str = "datetime_of_processing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaRecord {
    pub source_date: NaiveDate,
    pub processed_at: NaiveDateTime,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("meta file {key} has columns {found:?}, expected [source_date, datetime_of_processing]")]
    WrongMetaFile { key: String, found: Vec<String> },
    #[error("meta file {key} row {row}: failed to parse {field} value '{value}'")]
    ParseField {
        key: String,
        row: usize,
        field: &'static str,
        value: String,
    },
}

pub struct MetaTracker<'a> {
    store: &'a dyn ObjectStore,
    key: String,
}

impl<'a> MetaTracker<'a> {
    pub fn new(store: &'a dyn ObjectStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn read_log(&self) -> Result<Vec<MetaRecord>, MetaError> {
        let table = match self.store.read_object(&self.key) {
            Ok(table) => table,
            Err(StoreError::NotFound { .. }) => {
                debug!(
                    component = "meta",
                    event = "meta.read.missing",
                    key = %self.key
                );
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        parse_meta_table(&self.key, &table)
    }

    pub fn unprocessed_dates(
        &self,
        first_extract_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<NaiveDate>, MetaError> {
        let log = self.read_log()?;
        Ok(unprocessed_dates_from_log(&log, first_extract_date, today))
    }

    pub fn record_processed(
        &self,
        dates: &BTreeSet<NaiveDate>,
        processed_at: NaiveDateTime,
    ) -> Result<Vec<MetaRecord>, MetaError> {
        let mut log = self.read_log()?;
        let known: BTreeSet<NaiveDate> = log.iter().map(|record| record.source_date).collect();

        let appended: Vec<MetaRecord> = dates
            .iter()
            .filter(|date| !known.contains(*date))
            .map(|date| MetaRecord {
                source_date: *date,
                processed_at,
            })
            .collect();

        if appended.is_empty() {
            debug!(
                component = "meta",
                event = "meta.update.skipped",
                key = %self.key,
                requested_dates = dates.len()
            );
            return Ok(appended);
        }

        log.extend(appended.iter().copied());
        self.store.write_object(&self.key, &meta_table(&log))?;

        info!(
            component = "meta",
            event = "etl.meta.updated",
            key = %self.key,
            appended = appended.len(),
            total = log.len()
        );
        Ok(appended)
    }
}

// Dates from `first_extract_date` (or the day after the latest logged date,
// whichever is later) through the day before `today`, minus logged dates.
pub fn unprocessed_dates_from_log(
    log: &[MetaRecord],
    first_extract_date: NaiveDate,
    today: NaiveDate,
) -> Vec<NaiveDate> {
    let processed: BTreeSet<NaiveDate> = log.iter().map(|record| record.source_date).collect();

    let after_latest = processed
        .last()
        .and_then(|latest| latest.checked_add_days(Days::new(1)));
    let start = match after_latest {
        Some(next) if next > first_extract_date => next,
        _ => first_extract_date,
    };
    let Some(yesterday) = today.checked_sub_days(Days::new(1)) else {
        return Vec::new();
    };

    start
        .iter_days()
        .take_while(|date| *date <= yesterday)
        .filter(|date| !processed.contains(date))
        .collect()
}

fn parse_meta_table(key: &str, table: &Table) -> Result<Vec<MetaRecord>, MetaError> {
    let expected = [META_SOURCE_DATE_COL, META_PROCESS_COL];
    if table.headers.len() != expected.len()
        || table
            .headers
            .iter()
            .zip(expected)
            .any(|(found, wanted)| found != wanted)
    {
        return Err(MetaError::WrongMetaFile {
            key: key.to_string(),
            found: table.headers.clone(),
        });
    }

    table
        .rows
        .iter()
        .enumerate()
        .map(|(row, fields)| {
            let date_raw = fields[0].trim();
            let processed_raw = fields[1].trim();
            let source_date = NaiveDate::parse_from_str(date_raw, META_DATE_FORMAT).map_err(
                |_| MetaError::ParseField {
                    key: key.to_string(),
                    row,
                    field: META_SOURCE_DATE_COL,
                    value: date_raw.to_string(),
                },
            )?;
            let processed_at =
                NaiveDateTime::parse_from_str(processed_raw, META_PROCESS_DATE_FORMAT).map_err(
                    |_| MetaError::ParseField {
                        key: key.to_string(),
                        row,
                        field: META_PROCESS_COL,
                        value: processed_raw.to_string(),
                    },
                )?;
            Ok(MetaRecord {
                source_date,
                processed_at,
            })
        })
        .collect()
}

fn meta_table(log: &[MetaRecord]) -> Table {
    let mut table = Table::new([META_SOURCE_DATE_COL, META_PROCESS_COL]);
    for record in log {
        table.push_row(vec![
            record.source_date.format(META_DATE_FORMAT).to_string(),
            record
                .processed_at
                .format(META_PROCESS_DATE_FORMAT)
                .to_string(),
        ]);
    }
    table
}
