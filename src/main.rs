use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use leadscout::pipeline;
use leadscout::{Config, Engine};

const USAGE: &str = "Usage: leadscout <input.csv> <output.csv> \
    [--workers N] [--threshold N] [--max-pages N] [--pdf] [--domain-only] [-v]";

struct CliArgs {
    input: PathBuf,
    output: PathBuf,
    workers: Option<usize>,
    threshold: Option<i32>,
    max_pages: Option<usize>,
    process_pdfs: bool,
    domain_only: bool,
    verbose: bool,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut workers = None;
    let mut threshold = None;
    let mut max_pages = None;
    let mut process_pdfs = false;
    let mut domain_only = false;
    let mut verbose = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--workers" => {
                let v = args.next().ok_or("--workers needs a value")?;
                workers = Some(v.parse().map_err(|_| format!("invalid --workers: {v}"))?);
            }
            "--threshold" => {
                let v = args.next().ok_or("--threshold needs a value")?;
                threshold = Some(v.parse().map_err(|_| format!("invalid --threshold: {v}"))?);
            }
            "--max-pages" => {
                let v = args.next().ok_or("--max-pages needs a value")?;
                max_pages = Some(v.parse().map_err(|_| format!("invalid --max-pages: {v}"))?);
            }
            "--pdf" => process_pdfs = true,
            "--domain-only" => domain_only = true,
            "-v" | "--verbose" => verbose = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown flag: {other}"));
            }
            _ => positional.push(arg),
        }
    }

    if positional.len() != 2 {
        return Err("expected exactly two positional arguments: input and output".to_string());
    }

    Ok(CliArgs {
        input: PathBuf::from(&positional[0]),
        output: PathBuf::from(&positional[1]),
        workers,
        threshold,
        max_pages,
        process_pdfs,
        domain_only,
        verbose,
    })
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides win over the environment, same ranges apply.
    if let Some(workers) = args.workers {
        if !(1..=64).contains(&workers) {
            error!("--workers {} out of range [1, 64]", workers);
            std::process::exit(1);
        }
        config.max_workers = workers;
    }
    if let Some(threshold) = args.threshold {
        if !(0..=100).contains(&threshold) {
            error!("--threshold {} out of range [0, 100]", threshold);
            std::process::exit(1);
        }
        config.domain_score_threshold = threshold;
    }
    if let Some(max_pages) = args.max_pages {
        if !(1..=500).contains(&max_pages) {
            error!("--max-pages {} out of range [1, 500]", max_pages);
            std::process::exit(1);
        }
        config.max_fallback_pages = max_pages;
    }
    config.process_pdfs = config.process_pdfs || args.process_pdfs;
    config.save_domain_only = args.domain_only;

    let companies = match pipeline::read_companies(&args.input) {
        Ok(companies) if !companies.is_empty() => companies,
        Ok(_) => {
            error!("No companies found in {}", args.input.display());
            std::process::exit(1);
        }
        Err(e) => {
            error!("Failed to read input: {:#}", e);
            std::process::exit(1);
        }
    };

    let engine = Arc::new(Engine::new(Arc::new(config)));

    let report = tokio::select! {
        report = pipeline::run(engine.clone(), companies) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; shutting down workers");
            engine.shutdown().await;
            std::process::exit(130);
        }
    };

    engine.shutdown().await;

    if let Err(e) = pipeline::write_rows(&args.output, &report.rows) {
        error!("Failed to write output: {:#}", e);
        std::process::exit(1);
    }

    info!("{}", report.summary());
    info!("Saved {} rows -> {}", report.rows.len(), args.output.display());
}
