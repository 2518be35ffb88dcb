use chrono::Utc;
use xetra::{
    init_logging, job_config_from_env, log_app_start, log_job_config, log_run_outcome,
    logging_config_from_env, LocalBucket, XetraEtl,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let job_cfg = job_config_from_env()?;
    log_job_config(&job_cfg);

    let src_bucket = LocalBucket::new(&job_cfg.source_root);
    let trg_bucket = LocalBucket::new(&job_cfg.target_root);
    let etl = XetraEtl::from_job_config(&src_bucket, &trg_bucket, &job_cfg)?;

    let outcome = etl.etl_report1(Utc::now())?;
    log_run_outcome(&outcome);

    Ok(())
}
