// src/main.rs

use anyhow::Result;
use condomstudy::{config::AnalysisConfig, pipeline};
use std::{env, path::PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    // ─── init logging ──────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,condomstudy=info"));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();
    info!("startup");

    // optional single positional argument: the YAML config
    let config_path: Option<PathBuf> = env::args().nth(1).map(PathBuf::from);
    let cfg = AnalysisConfig::load(config_path.as_deref())?;
    info!(
        respondents = %cfg.respondent_path.display(),
        households = %cfg.household_path.display(),
        lonely_psu = ?cfg.lonely_psu,
        "configuration resolved"
    );

    let summary = pipeline::run(&cfg)?;
    info!(
        analysed = summary.analysis_rows,
        workbook = %cfg.workbook_path.display(),
        "done"
    );
    Ok(())
}
