//! Thin pass-throughs to [`GlacierClient`] for operator debugging: list
//! pending/completed jobs on the vault, or download one job's raw output.

use std::path::Path;

use anyhow::{Context, Result};
use gletscher_core::glacier::GlacierClient;

use crate::config::Config;

fn client(config: &Config) -> Result<GlacierClient> {
    Ok(GlacierClient::new(
        &config.aws_region,
        &config.aws_account_id,
        &config.vault_name,
        &config.aws_access_key,
        &config.aws_secret_access_key,
    )?)
}

pub async fn list_jobs(config: &Config) -> Result<()> {
    let client = client(config)?;
    let jobs = client.list_jobs().await.context("listing glacier jobs")?;

    for job in &jobs {
        let status = if job.completed {
            job.status_code.as_str()
        } else {
            "InProgress"
        };
        println!(
            "{} {:<20} {} {}",
            job.job_id,
            job.action,
            status,
            job.archive_id.as_deref().unwrap_or("-"),
        );
    }
    log::info!("listed {} glacier jobs", jobs.len());
    Ok(())
}

pub async fn retrieve_job_output(config: &Config, job_id: &str, output_file: &Path) -> Result<()> {
    let client = client(config)?;
    let body = client
        .get_job_output(job_id, None)
        .await
        .with_context(|| format!("fetching output of job {}", job_id))?;
    std::fs::write(output_file, &body)
        .with_context(|| format!("writing {}", output_file.display()))?;
    log::info!(
        "wrote {} bytes of job {} output to {}",
        body.len(),
        job_id,
        output_file.display()
    );
    println!("wrote {} bytes to {}", body.len(), output_file.display());
    Ok(())
}
