//! Reference test binary entry point
//!
//! Runs every reference scenario and prints a summary. Pass `--json <path>`
//! to also write the results as JSON.

use std::path::PathBuf;

use reference_tests::{all_tests, TestResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn json_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--json" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

fn to_json(results: &[TestResult]) -> serde_json::Value {
    serde_json::Value::Array(
        results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "passed": r.passed,
                    "timesteps": r.timesteps,
                    "sim_time": r.sim_time,
                    "partitions": r.metrics.partitions,
                    "active_cells": r.metrics.active_cells,
                    "imbalance": r.metrics.imbalance,
                    "halo_bytes": r.metrics.halo_bytes,
                    "wall_time_s": r.metrics.wall_time.as_secs_f64(),
                    "checks": r.checks.iter().map(|c| serde_json::json!({
                        "name": c.name,
                        "passed": c.passed,
                        "message": c.message,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect(),
    )
}

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reference_tests=info,orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Partitioned Grid Reference Test Suite");
    tracing::info!("=====================================");

    let tests = all_tests();
    tracing::info!("Found {} reference tests", tests.len());

    let mut results: Vec<TestResult> = Vec::new();
    let mut passed_count = 0;
    let mut failed_count = 0;

    for test in tests {
        match test.run() {
            Ok(result) => {
                if result.passed {
                    passed_count += 1;
                } else {
                    failed_count += 1;
                }
                result.print_summary();
                results.push(result);
            }
            Err(e) => {
                eprintln!("\nERROR running test {}: {}", test.name, e);
                failed_count += 1;
            }
        }
    }

    println!("\n{}", "=".repeat(80));
    println!("OVERALL SUMMARY");
    println!("{}", "=".repeat(80));
    println!("Total tests: {}", passed_count + failed_count);
    println!("Passed: {}", passed_count);
    println!("Failed: {}", failed_count);
    println!("{}", "=".repeat(80));

    if let Some(path) = json_path() {
        let report = to_json(&results);
        match serde_json::to_string_pretty(&report) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, text) {
                    eprintln!("Failed to write {}: {}", path.display(), e);
                    failed_count += 1;
                }
            }
            Err(e) => {
                eprintln!("Failed to serialize results: {}", e);
                failed_count += 1;
            }
        }
    }

    // Exit with error code if any tests failed
    if failed_count > 0 {
        std::process::exit(1);
    }
}
