//! Raw Xetra rows and the daily per-instrument report built from them.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{SourceConfig, TargetConfig};
use crate::object_store::Table;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub isin: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub start_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub traded_volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReportRecord {
    pub isin: String,
    pub date: NaiveDate,
    pub opening_price: f64,
    pub closing_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub traded_volume: u64,
    pub change_prev_close_pct: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("object {key} is missing column '{column}'")]
    MissingColumn { key: String, column: String },
    #[error("object {key} row {row}: failed to parse {column} value '{value}'")]
    ParseField {
        key: String,
        row: usize,
        column: String,
        value: String,
    },
}

struct ColumnLookup<'t> {
    key: &'t str,
    table: &'t Table,
}

impl<'t> ColumnLookup<'t> {
    fn index(&self, column: &str) -> Result<usize, ReportError> {
        self.table
            .column_index(column)
            .ok_or_else(|| ReportError::MissingColumn {
                key: self.key.to_string(),
                column: column.to_string(),
            })
    }

    fn parse<T>(
        &self,
        row: usize,
        idx: usize,
        column: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<T, ReportError> {
        let raw = self.table.rows[row]
            .get(idx)
            .map(|value| value.trim())
            .unwrap_or_default();
        parse(raw).ok_or_else(|| ReportError::ParseField {
            key: self.key.to_string(),
            row,
            column: column.to_string(),
            value: raw.to_string(),
        })
    }
}

pub fn parse_raw_records(
    key: &str,
    table: &Table,
    cfg: &SourceConfig,
) -> Result<Vec<RawRecord>, ReportError> {
    let lookup = ColumnLookup { key, table };
    let isin_idx = lookup.index(&cfg.col_isin)?;
    let date_idx = lookup.index(&cfg.col_date)?;
    let time_idx = lookup.index(&cfg.col_time)?;
    let start_idx = lookup.index(&cfg.col_start_price)?;
    let min_idx = lookup.index(&cfg.col_min_price)?;
    let max_idx = lookup.index(&cfg.col_max_price)?;
    let vol_idx = lookup.index(&cfg.col_traded_vol)?;

    let mut records = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        records.push(RawRecord {
            isin: lookup.parse(row, isin_idx, &cfg.col_isin, |raw| {
                (!raw.is_empty()).then(|| raw.to_string())
            })?,
            date: lookup.parse(row, date_idx, &cfg.col_date, |raw| {
                NaiveDate::parse_from_str(raw, &cfg.date_format).ok()
            })?,
            time: lookup.parse(row, time_idx, &cfg.col_time, |raw| {
                NaiveTime::parse_from_str(raw, &cfg.time_format).ok()
            })?,
            start_price: lookup.parse(row, start_idx, &cfg.col_start_price, parse_price)?,
            min_price: lookup.parse(row, min_idx, &cfg.col_min_price, parse_price)?,
            max_price: lookup.parse(row, max_idx, &cfg.col_max_price, parse_price)?,
            traded_volume: lookup.parse(row, vol_idx, &cfg.col_traded_vol, |raw| {
                raw.parse::<u64>().ok()
            })?,
        });
    }

    Ok(records)
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn aggregate_daily(raw: &[RawRecord]) -> Vec<DailyReportRecord> {
    let mut groups: BTreeMap<(&str, NaiveDate), Vec<&RawRecord>> = BTreeMap::new();
    for record in raw {
        groups
            .entry((record.isin.as_str(), record.date))
            .or_default()
            .push(record);
    }

    let mut out = Vec::with_capacity(groups.len());
    let mut previous_close: Option<(&str, f64)> = None;

    for ((isin, date), mut rows) in groups {
        // Stable: rows with equal times keep source order.
        rows.sort_by_key(|row| row.time);

        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            continue;
        };
        let opening_price = first.start_price;
        let closing_price = last.start_price;
        let min_price = rows
            .iter()
            .map(|row| row.min_price)
            .fold(f64::INFINITY, f64::min);
        let max_price = rows
            .iter()
            .map(|row| row.max_price)
            .fold(f64::NEG_INFINITY, f64::max);
        let traded_volume: u64 = rows.iter().map(|row| row.traded_volume).sum();

        let change_prev_close_pct = match previous_close {
            Some((prev_isin, prev_close)) if prev_isin == isin && prev_close != 0.0 => {
                Some(round2((closing_price - prev_close) / prev_close * 100.0))
            }
            _ => None,
        };
        previous_close = Some((isin, closing_price));

        out.push(DailyReportRecord {
            isin: isin.to_string(),
            date,
            opening_price: round2(opening_price),
            closing_price: round2(closing_price),
            min_price: round2(min_price),
            max_price: round2(max_price),
            traded_volume,
            change_prev_close_pct,
        });
    }

    out
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn report_to_table(records: &[DailyReportRecord], cfg: &TargetConfig) -> Table {
    let mut table = Table::new(cfg.columns());
    for record in records {
        table.push_row(vec![
            record.isin.clone(),
            record.date.format(&cfg.date_format).to_string(),
            record.opening_price.to_string(),
            record.closing_price.to_string(),
            record.min_price.to_string(),
            record.max_price.to_string(),
            record.traded_volume.to_string(),
            record
                .change_prev_close_pct
                .map(|pct| pct.to_string())
                .unwrap_or_default(),
        ]);
    }
    table
}

pub fn report_from_table(
    key: &str,
    table: &Table,
    cfg: &TargetConfig,
) -> Result<Vec<DailyReportRecord>, ReportError> {
    let lookup = ColumnLookup { key, table };
    let [isin_col, date_col, open_col, close_col, min_col, max_col, vol_col, change_col] =
        cfg.columns();
    let isin_idx = lookup.index(isin_col)?;
    let date_idx = lookup.index(date_col)?;
    let open_idx = lookup.index(open_col)?;
    let close_idx = lookup.index(close_col)?;
    let min_idx = lookup.index(min_col)?;
    let max_idx = lookup.index(max_col)?;
    let vol_idx = lookup.index(vol_col)?;
    let change_idx = lookup.index(change_col)?;

    let mut records = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        records.push(DailyReportRecord {
            isin: lookup.parse(row, isin_idx, isin_col, |raw| Some(raw.to_string()))?,
            date: lookup.parse(row, date_idx, date_col, |raw| {
                NaiveDate::parse_from_str(raw, &cfg.date_format).ok()
            })?,
            opening_price: lookup.parse(row, open_idx, open_col, parse_price)?,
            closing_price: lookup.parse(row, close_idx, close_col, parse_price)?,
            min_price: lookup.parse(row, min_idx, min_col, parse_price)?,
            max_price: lookup.parse(row, max_idx, max_col, parse_price)?,
            traded_volume: lookup.parse(row, vol_idx, vol_col, |raw| raw.parse().ok())?,
            change_prev_close_pct: lookup.parse(row, change_idx, change_col, |raw| {
                if raw.is_empty() {
                    Some(None)
                } else {
                    parse_price(raw).map(Some)
                }
            })?,
        });
    }

    Ok(records)
}
