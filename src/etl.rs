//! Xetra daily report job: extract source objects, aggregate, load the report
//! and record processed dates.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, JobConfig, SourceConfig, TargetConfig};
use crate::meta::{MetaError, MetaTracker};
use crate::object_store::{decode_object, ObjectStore, StoreError};
use crate::report::{
    aggregate_daily, parse_raw_records, report_to_table, DailyReportRecord, RawRecord, ReportError,
};

#[derive(Debug, Error)]
pub enum EtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractPlan {
    pub report_dates: Vec<NaiveDate>,
    pub lookback_date: Option<NaiveDate>,
}

impl ExtractPlan {
    pub fn is_empty(&self) -> bool {
        self.report_dates.is_empty()
    }

    fn dates_to_read(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.lookback_date
            .into_iter()
            .chain(self.report_dates.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub plan: ExtractPlan,
    pub records: Vec<RawRecord>,
    pub objects_read: usize,
    pub duplicate_objects_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReceipt {
    pub key: String,
    pub rows: usize,
    pub dates: BTreeSet<NaiveDate>,
    pub meta_records_appended: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NoNewData { checked_dates: usize },
    Loaded(LoadReceipt),
}

pub struct XetraEtl<'a> {
    src_bucket: &'a dyn ObjectStore,
    trg_bucket: &'a dyn ObjectStore,
    meta_key: String,
    src_args: SourceConfig,
    trg_args: TargetConfig,
    tz: Tz,
}

impl<'a> XetraEtl<'a> {
    pub fn new(
        src_bucket: &'a dyn ObjectStore,
        trg_bucket: &'a dyn ObjectStore,
        meta_key: impl Into<String>,
        src_args: SourceConfig,
        trg_args: TargetConfig,
        tz: Tz,
    ) -> Self {
        Self {
            src_bucket,
            trg_bucket,
            meta_key: meta_key.into(),
            src_args,
            trg_args,
            tz,
        }
    }

    pub fn from_job_config(
        src_bucket: &'a dyn ObjectStore,
        trg_bucket: &'a dyn ObjectStore,
        cfg: &JobConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self::new(
            src_bucket,
            trg_bucket,
            cfg.meta_key.clone(),
            cfg.source.clone(),
            cfg.target.clone(),
            cfg.tz()?,
        ))
    }

    fn meta(&self) -> MetaTracker<'a> {
        MetaTracker::new(self.trg_bucket, self.meta_key.clone())
    }

    pub fn plan_extract(&self, today: NaiveDate) -> Result<ExtractPlan, EtlError> {
        let report_dates = self
            .meta()
            .unprocessed_dates(self.src_args.first_extract_date, today)?;
        let lookback_date = report_dates
            .first()
            .and_then(|first| first.checked_sub_days(Days::new(1)));

        Ok(ExtractPlan {
            report_dates,
            lookback_date,
        })
    }

    pub fn extract(&self, plan: &ExtractPlan) -> Result<Extracted, EtlError> {
        let mut records = Vec::new();
        let mut seen_digests = HashSet::new();
        let mut objects_read = 0usize;
        let mut duplicate_objects_skipped = 0usize;
        let delimiter = self.src_args.delimiter_byte()?;

        for date in plan.dates_to_read() {
            let prefix = self.src_args.key_prefix(date);
            let keys = self.src_bucket.list_objects(&prefix)?;
            if keys.is_empty() {
                debug!(
                    component = "xetra_etl",
                    event = "etl.extract.date_skipped",
                    date = %date,
                    prefix = %prefix
                );
                continue;
            }

            for key in keys {
                let bytes = match self.src_bucket.get_bytes(&key) {
                    Ok(bytes) => bytes,
                    Err(StoreError::NotFound { .. }) => {
                        warn!(
                            component = "xetra_etl",
                            event = "etl.extract.object_vanished",
                            key = %key
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };

                let table = decode_object(&key, &bytes, delimiter)?;
                if table.is_empty() {
                    // Header-only objects are excluded from duplicate detection.
                    objects_read += 1;
                    debug!(
                        component = "xetra_etl",
                        event = "etl.extract.empty_object",
                        key = %key
                    );
                    continue;
                }

                let digest = hex::encode(Sha256::digest(&bytes));
                if !seen_digests.insert(digest.clone()) {
                    warn!(
                        component = "xetra_etl",
                        event = "etl.extract.duplicate_object",
                        key = %key,
                        sha256 = %digest
                    );
                    duplicate_objects_skipped += 1;
                    continue;
                }

                objects_read += 1;
                let mut parsed = parse_raw_records(&key, &table, &self.src_args)?;
                debug!(
                    component = "xetra_etl",
                    event = "etl.extract.object_read",
                    key = %key,
                    rows = parsed.len()
                );
                records.append(&mut parsed);
            }
        }

        info!(
            component = "xetra_etl",
            event = "etl.extract.finish",
            report_dates = plan.report_dates.len(),
            objects_read,
            duplicate_objects_skipped,
            rows = records.len()
        );

        Ok(Extracted {
            plan: plan.clone(),
            records,
            objects_read,
            duplicate_objects_skipped,
        })
    }

    pub fn transform_report1(&self, extracted: &Extracted) -> Vec<DailyReportRecord> {
        let report_dates: HashSet<NaiveDate> =
            extracted.plan.report_dates.iter().copied().collect();
        let mut report = aggregate_daily(&extracted.records);
        report.retain(|record| report_dates.contains(&record.date));

        info!(
            component = "xetra_etl",
            event = "etl.transform.finish",
            input_rows = extracted.records.len(),
            output_rows = report.len()
        );
        report
    }

    pub fn load(
        &self,
        report: &[DailyReportRecord],
        run_at: &DateTime<Tz>,
    ) -> Result<LoadReceipt, EtlError> {
        let key = self.trg_args.report_key(run_at);
        let table = report_to_table(report, &self.trg_args);
        self.trg_bucket.write_object(&key, &table)?;

        let dates: BTreeSet<NaiveDate> = report.iter().map(|record| record.date).collect();
        info!(
            component = "xetra_etl",
            event = "etl.load.finish",
            key = %key,
            rows = report.len(),
            dates = dates.len()
        );

        let appended = self.meta().record_processed(&dates, run_at.naive_local())?;

        Ok(LoadReceipt {
            key,
            rows: report.len(),
            dates,
            meta_records_appended: appended.len(),
        })
    }

    pub fn etl_report1(&self, now: DateTime<Utc>) -> Result<RunOutcome, EtlError> {
        let run_at = now.with_timezone(&self.tz);
        let today = run_at.date_naive();
        info!(
            component = "xetra_etl",
            event = "etl.run.start",
            run_at = %run_at,
            first_extract_date = %self.src_args.first_extract_date
        );

        let plan = self.plan_extract(today)?;
        if plan.is_empty() {
            info!(
                component = "xetra_etl",
                event = "etl.run.noop",
                reason = "no_unprocessed_dates"
            );
            return Ok(RunOutcome::NoNewData { checked_dates: 0 });
        }

        let extracted = self.extract(&plan)?;
        let report = self.transform_report1(&extracted);
        if report.is_empty() {
            info!(
                component = "xetra_etl",
                event = "etl.run.noop",
                reason = "no_source_rows",
                checked_dates = plan.report_dates.len()
            );
            return Ok(RunOutcome::NoNewData {
                checked_dates: plan.report_dates.len(),
            });
        }

        let receipt = self.load(&report, &run_at)?;
        info!(
            component = "xetra_etl",
            event = "etl.run.finish",
            key = %receipt.key,
            rows = receipt.rows,
            meta_records_appended = receipt.meta_records_appended
        );
        Ok(RunOutcome::Loaded(receipt))
    }
}
