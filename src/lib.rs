//! Xetra daily report ETL.
//!
//! Reads hourly Xetra trading reports from a source bucket, aggregates them
//! into one row per instrument and trade date, writes the report to a target
//! bucket and tracks processed dates in a meta file next to it.

mod config;
mod etl;
mod meta;
mod object_store;
mod observability;
mod report;

pub use config::{
    job_config_from_env, ConfigError, JobConfig, SourceConfig, TargetConfig, DEFAULT_META_KEY,
    DEFAULT_TIMEZONE,
};
pub use etl::{EtlError, ExtractPlan, Extracted, LoadReceipt, RunOutcome, XetraEtl};
pub use meta::{
    unprocessed_dates_from_log, MetaError, MetaRecord, MetaTracker, META_DATE_FORMAT,
    META_PROCESS_COL, META_PROCESS_DATE_FORMAT, META_SOURCE_DATE_COL,
};
pub use object_store::{
    decode_csv, decode_object, encode_csv, InMemoryBucket, LocalBucket, ObjectStore, StoreError,
    Table,
};
pub use observability::{
    init_logging, log_app_start, log_job_config, log_run_outcome, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use report::{
    aggregate_daily, parse_raw_records, report_from_table, report_to_table, DailyReportRecord,
    RawRecord, ReportError,
};
