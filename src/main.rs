use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use sf_sync::{config, job, jobs, warehouse, warehouse::Warehouse};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run only the named job (default: all, in catalog order)
    #[arg(long)]
    job: Option<String>,

    /// List registered jobs and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    if args.list {
        for name in jobs::catalog() {
            println!("{name}");
        }
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;

    let names = match &args.job {
        Some(name) => {
            if !jobs::catalog().contains(&name.as_str()) {
                bail!("unknown job {name:?}; use --list to see registered jobs");
            }
            vec![name.as_str()]
        }
        None => jobs::catalog(),
    };

    let pool = warehouse::init_pool(&cfg.warehouse).await?;
    let dest = Warehouse::new(pool);

    let mut failed = 0usize;
    for name in names {
        let units = jobs::build(name, &cfg).unwrap_or_default();
        for unit in units {
            info!(job = %unit.name, output = %unit.output.describe(), "starting job");
            match job::run(&cfg, &dest, &unit).await {
                Ok(report) => {
                    info!(
                        job = %report.job,
                        fetched = report.records_fetched,
                        loaded = report.rows_loaded,
                        failed_chunks = report.chunks_failed,
                        "job finished"
                    );
                }
                Err(err) => {
                    error!(job = %unit.name, error = %err, "job failed");
                    failed += 1;
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} job unit(s) failed");
    }
    Ok(())
}
