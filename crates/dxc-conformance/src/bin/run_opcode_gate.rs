#![forbid(unsafe_code)]

use dxc_conformance::{
    HarnessConfig, SuiteReport, run_all_core_suites, set_scenario_log_path,
};
use dxc_runtime::LoadMode;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize)]
struct SuiteSummary {
    suite: String,
    case_count: usize,
    pass_count: usize,
    variant_pass_count: usize,
    fail_count: usize,
    fingerprint: String,
    failures: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GateSummary {
    status: &'static str,
    load_mode: &'static str,
    scenario_log: String,
    suites: Vec<SuiteSummary>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_opcode_gate failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut cfg = HarnessConfig::from_env()?;
    let mut log_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-path requires a value".to_string())?;
                log_path = Some(PathBuf::from(value));
            }
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires a value".to_string())?;
                cfg.load_mode = LoadMode::parse(&value)
                    .ok_or_else(|| format!("invalid --mode {value} (deferred|eager)"))?;
            }
            "--opcode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--opcode requires a value".to_string())?;
                cfg.opcode_filter.insert(value);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p dxc-conformance --bin run_opcode_gate -- [--log-path <path>] [--mode deferred|eager] [--opcode <family>]..."
                );
                return Ok(());
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    let log_path = log_path.unwrap_or_else(|| {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../artifacts/logs")
            .join(format!(
                "opcode_gate_{}_{ts_millis}.jsonl",
                cfg.load_mode.as_str()
            ))
    });
    set_scenario_log_path(Some(log_path.clone()));

    let suites = run_all_core_suites(&cfg)?;
    let status = if suites.iter().all(SuiteReport::all_passed) {
        "pass"
    } else {
        "fail"
    };
    let summary = GateSummary {
        status,
        load_mode: cfg.load_mode.as_str(),
        scenario_log: log_path.display().to_string(),
        suites: suites.into_iter().map(summarize_suite).collect(),
    };

    let summary_json = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("failed serializing summary: {err}"))?;
    println!("{summary_json}");

    if status == "fail" {
        std::process::exit(2);
    }
    Ok(())
}

fn summarize_suite(report: SuiteReport) -> SuiteSummary {
    SuiteSummary {
        suite: report.suite.to_string(),
        case_count: report.case_count,
        pass_count: report.pass_count,
        variant_pass_count: report.variant_pass_count,
        fail_count: report.fail_count(),
        fingerprint: report.fingerprint,
        failures: report.failures,
    }
}
