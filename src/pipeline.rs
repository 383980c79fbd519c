//! Bulk processing: companies in, deduplicated (Company, Domain, Email)
//! rows out, with a run summary.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::stream::{self, StreamExt};
use tracing::info;

use crate::core::{LeadRow, RunReport, RunStats};
use crate::net;
use crate::orchestrator::Engine;

/// Read the `Company` column from a tabular file.
pub fn read_companies(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let headers = reader
        .headers()
        .context("input file has no header row")?
        .clone();
    let company_idx = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("company"))
        .ok_or_else(|| anyhow!("input needs a 'Company' column"))?;

    let mut companies = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read input row")?;
        if let Some(name) = record.get(company_idx) {
            let name = name.trim();
            if !name.is_empty() {
                companies.push(name.to_string());
            }
        }
    }
    Ok(companies)
}

/// Write rows as CSV with the canonical header.
pub fn write_rows(path: &Path, rows: &[LeadRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["Company", "Domain", "Email"])?;
    for row in rows {
        writer.write_record([&row.company, &row.domain, &row.email])?;
    }
    writer.flush()?;
    Ok(())
}

/// Deduplicate on (Company, Domain, Email), preserving first-seen order.
pub fn dedup_rows(rows: Vec<LeadRow>) -> Vec<LeadRow> {
    let mut seen = HashSet::new();
    rows.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

/// Process every company through the engine with a worker pool of
/// `max_workers`; aggregates stats and rows into the final report.
pub async fn run(engine: Arc<Engine>, companies: Vec<String>) -> RunReport {
    let start = Instant::now();
    let max_workers = engine.config().max_workers;
    info!(
        "Processing {} companies with {} workers",
        companies.len(),
        max_workers
    );

    let results: Vec<(RunStats, Vec<LeadRow>)> = stream::iter(companies)
        .map(|company| {
            let engine = engine.clone();
            // One redirect-loop guard scope per company, like one session
            // per worker.
            async move {
                net::with_fetch_guard(async move { engine.process_company(&company).await }).await
            }
        })
        .buffer_unordered(max_workers)
        .collect()
        .await;

    let mut stats = RunStats::default();
    let mut rows = Vec::new();
    for (company_stats, company_rows) in results {
        stats.merge(&company_stats);
        rows.extend(company_rows);
    }

    RunReport {
        stats,
        rows: dedup_rows(rows),
        http_stats: engine.fetcher().stats_snapshot(),
        elapsed_secs: start.elapsed().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(company: &str, domain: &str, email: &str) -> LeadRow {
        LeadRow {
            company: company.to_string(),
            domain: domain.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let rows = vec![
            row("A", "a.example", "x@a.example"),
            row("B", "b.example", "y@b.example"),
            row("A", "a.example", "x@a.example"),
        ];
        let deduped = dedup_rows(rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].company, "A");
        assert_eq!(deduped[1].company, "B");
    }

    #[test]
    fn read_companies_requires_company_column() {
        let dir = std::env::temp_dir();
        let path = dir.join("leadscout_test_input_no_col.csv");
        std::fs::write(&path, "Name\nAcme\n").unwrap();
        assert!(read_companies(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn read_companies_skips_blank_cells() {
        let dir = std::env::temp_dir();
        let path = dir.join("leadscout_test_input.csv");
        std::fs::write(&path, "Id,Company\n1,Acme Inc\n2,\n3,  Gamma GmbH \n").unwrap();
        let companies = read_companies(&path).unwrap();
        assert_eq!(companies, vec!["Acme Inc", "Gamma GmbH"]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_rows_emits_header_and_rows() {
        let dir = std::env::temp_dir();
        let path = dir.join("leadscout_test_output.csv");
        write_rows(&path, &[row("Acme Inc", "acme.example", "info@acme.example")]).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("Company,Domain,Email\n"));
        assert!(written.contains("Acme Inc,acme.example,info@acme.example"));
        std::fs::remove_file(&path).ok();
    }
}
