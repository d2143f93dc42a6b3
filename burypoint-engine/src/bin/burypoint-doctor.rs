//! Cache consistency doctor.
//!
//! Usage: burypoint-doctor [--config <path>] [--days <n>] [--fix]
//!
//! Diagnoses the trailing window for the configured tracking points and,
//! with `--fix`, repairs what it finds and re-verifies after the settle delay.
//! Prints counts only.

use std::process::ExitCode;

use burypoint_core::constants::MAX_WINDOW_DAYS;
use burypoint_core::{BuryPointConfig, DateRange, Severity};
use burypoint_engine::{init_tracing, BuryPointEngine, CancelFlag};
use chrono::Utc;

struct Args {
    days: u32,
    fix: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args { days: 7, fix: false };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--fix" => args.fix = true,
            "--days" => {
                let value = iter.next().ok_or("--days needs a value")?;
                args.days = value
                    .parse::<u32>()
                    .ok()
                    .filter(|days| (1..=MAX_WINDOW_DAYS).contains(days))
                    .ok_or_else(|| {
                        format!("invalid --days value: {value} (expected 1..={MAX_WINDOW_DAYS})")
                    })?;
            }
            // Consumed by BuryPointConfig::load.
            "--config" => {
                iter.next();
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Usage: burypoint-doctor [--config <path>] [--days <n>] [--fix]");
            return ExitCode::from(2);
        }
    };

    let config = match BuryPointConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("{e}");
    }

    let mut tracking_points = config.health.tracking_point_ids.clone();
    if tracking_points.is_empty() {
        tracking_points = config.preload.tracking_point_ids.clone();
    }
    if tracking_points.is_empty() {
        eprintln!("No tracking points configured under [health] or [preload]");
        return ExitCode::FAILURE;
    }

    let engine = match BuryPointEngine::from_config(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let range = DateRange::trailing(Utc::now().date_naive(), args.days);
    let cancel = CancelFlag::new();
    println!("Checking {range} for {} tracking points", tracking_points.len());

    if args.fix {
        match engine.reconcile(&range, &tracking_points, &cancel).await {
            Ok(report) if report.before.success => {
                println!("{}", report.summary());
                let remaining = report
                    .after
                    .as_ref()
                    .map(|r| r.count_by_severity(Severity::High))
                    .unwrap_or_else(|| report.before.count_by_severity(Severity::High));
                if remaining > 0 {
                    return ExitCode::FAILURE;
                }
                ExitCode::SUCCESS
            }
            Ok(report) => {
                eprintln!("Diagnostic failed: {}", report.before.error.unwrap_or_default());
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        }
    } else {
        match engine.run_full_diagnostic(&range, &tracking_points, &cancel).await {
            Ok(report) if report.success => {
                println!(
                    "{} ({} high, {} medium, {} low); health {}",
                    report.summary(),
                    report.count_by_severity(Severity::High),
                    report.count_by_severity(Severity::Medium),
                    report.count_by_severity(Severity::Low),
                    report.health()
                );
                ExitCode::SUCCESS
            }
            Ok(report) => {
                eprintln!("Diagnostic failed: {}", report.error.unwrap_or_default());
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        }
    }
}
