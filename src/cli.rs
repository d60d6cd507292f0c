//! CLI struct definitions and dispatch for the `tidepool` binary.

use crate::api::{self, AppState};
use crate::core::config::Config;
use crate::core::embed::HttpEmbedder;
use crate::core::generate::HttpGenerator;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "tidepool",
    version = env!("CARGO_PKG_VERSION"),
    about = "Tidepool is a local-first context plane: per-project semantic retrieval over your repositories, plus sacred-plan governance that detects when development drifts from approved architecture."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP + WebSocket API server.
    Serve {
        /// Override HTTP_BIND (host:port).
        #[clap(long)]
        bind: Option<String>,
    },
    /// Run startup validation checks and print a report.
    Doctor {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { bind } => serve(bind).await,
        Command::Doctor { format } => doctor(&format).await,
    }
}

async fn serve(bind: Option<String>) -> anyhow::Result<()> {
    init_tracing();
    let mut config = Config::from_env()?;
    if let Some(bind) = bind {
        config.http_bind = bind;
    }

    let embedder = Arc::new(HttpEmbedder::new(
        &config.embedding_base_url,
        &config.embedding_api_key,
        &config.embedding_model,
        config.embedding_dim,
    )?);
    let generator = Arc::new(HttpGenerator::new(
        &config.generation_base_url,
        &config.generation_api_key,
        &config.generation_model,
    )?);

    let state = AppState::build(config, embedder.clone(), generator.clone())?;

    // Service probes are non-fatal: listing and governance endpoints keep
    // working while /health reports degraded.
    let embedding_ok = match embedder.probe().await {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, "embedding service probe failed; starting degraded");
            false
        }
    };
    let generation_ok = match generator.probe().await {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, "generation service probe failed; starting degraded");
            false
        }
    };
    state.set_dependency_health(embedding_ok, generation_ok);

    api::serve(state).await?;
    Ok(())
}

fn push(checks: &mut Vec<CheckResult>, name: &str, status: CheckStatus, message: String) {
    checks.push(CheckResult {
        name: name.to_string(),
        status,
        message,
    });
}

async fn doctor(format: &str) -> anyhow::Result<()> {
    let mut checks = Vec::new();

    for key in ["EMBEDDING_API_KEY", "GENERATION_API_KEY", "SACRED_APPROVAL_KEY"] {
        match std::env::var(key) {
            Ok(v) if !v.trim().is_empty() => {
                push(&mut checks, key, CheckStatus::Pass, "set".into())
            }
            _ => push(
                &mut checks,
                key,
                CheckStatus::Fail,
                "missing (required)".into(),
            ),
        }
    }

    let config = match Config::from_env() {
        Ok(config) => Some(config),
        Err(err) => {
            push(&mut checks, "config", CheckStatus::Fail, err.to_string());
            None
        }
    };

    if let Some(config) = &config {
        match config.ensure_layout() {
            Ok(()) => push(
                &mut checks,
                "data_root",
                CheckStatus::Pass,
                format!("{} is writable", config.data_root.display()),
            ),
            Err(err) => push(&mut checks, "data_root", CheckStatus::Fail, err.to_string()),
        }

        match crate::core::vector::VectorStore::new(
            &config.vector_store_dir(),
            config.embedding_dim,
        )
        .and_then(|store| store.open("doctor_probe").map(|_| store))
        .and_then(|store| store.drop_collection("doctor_probe"))
        {
            Ok(()) => push(
                &mut checks,
                "vector_store",
                CheckStatus::Pass,
                format!("openable, dimension {}", config.embedding_dim),
            ),
            Err(err) => push(&mut checks, "vector_store", CheckStatus::Fail, err.to_string()),
        }

        let embedder = HttpEmbedder::new(
            &config.embedding_base_url,
            &config.embedding_api_key,
            &config.embedding_model,
            config.embedding_dim,
        )?;
        match embedder.probe().await {
            Ok(()) => push(
                &mut checks,
                "embedding_service",
                CheckStatus::Pass,
                config.embedding_base_url.clone(),
            ),
            Err(err) => push(
                &mut checks,
                "embedding_service",
                CheckStatus::Warn,
                format!("unreachable ({err}); server would start degraded"),
            ),
        }

        let generator = HttpGenerator::new(
            &config.generation_base_url,
            &config.generation_api_key,
            &config.generation_model,
        )?;
        match generator.probe().await {
            Ok(()) => push(
                &mut checks,
                "generation_service",
                CheckStatus::Pass,
                config.generation_base_url.clone(),
            ),
            Err(err) => push(
                &mut checks,
                "generation_service",
                CheckStatus::Warn,
                format!("unreachable ({err}); server would start degraded"),
            ),
        }
    }

    let report = DoctorReport {
        passed: checks.iter().filter(|c| c.status == CheckStatus::Pass).count(),
        failed: checks.iter().filter(|c| c.status == CheckStatus::Fail).count(),
        warnings: checks.iter().filter(|c| c.status == CheckStatus::Warn).count(),
        checks,
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        use colored::Colorize;
        println!("Tidepool Doctor — Startup Checks\n");
        for check in &report.checks {
            let icon = match check.status {
                CheckStatus::Pass => "●".bright_green(),
                CheckStatus::Fail => "●".bright_red(),
                CheckStatus::Warn => "●".bright_yellow(),
            };
            println!("  {} {}: {}", icon, check.name.bright_white(), check.message);
        }
        println!(
            "\n{} passed, {} failed, {} warnings",
            report.passed, report.failed, report.warnings
        );
    }

    if report.failed > 0 {
        anyhow::bail!("{} doctor check(s) failed", report.failed);
    }
    Ok(())
}
