#![forbid(unsafe_code)]

use dxc_conformance::fixtures::load_scenarios;
use dxc_conformance::{HarnessConfig, collect_manifest, filter_opcodes};
use std::fs;
use std::path::PathBuf;

fn main() {
    if let Err(err) = run() {
        eprintln!("collect_scenarios failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut cfg = HarnessConfig::from_env()?;
    let mut output: Option<PathBuf> = None;
    let mut as_lines = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a value".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--opcode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--opcode requires a value".to_string())?;
                cfg.opcode_filter.insert(value);
            }
            "--lines" => as_lines = true,
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p dxc-conformance --bin collect_scenarios -- [--output <path>] [--opcode <family>]... [--lines]"
                );
                return Ok(());
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    let scenarios = filter_opcodes(load_scenarios(&cfg.fixture_root)?, &cfg.opcode_filter)?;
    let manifest = collect_manifest(&scenarios);
    let payload = if as_lines {
        let mut lines = String::new();
        for (opcode, entries) in &manifest {
            for entry in entries {
                lines.push_str(&entry.line(opcode));
                lines.push('\n');
            }
        }
        lines
    } else {
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|err| format!("failed serializing manifest: {err}"))?;
        format!("{json}\n")
    };

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
            }
            fs::write(&path, payload.as_bytes())
                .map_err(|err| format!("failed writing {}: {err}", path.display()))?;
            eprintln!(
                "wrote {} scenarios in {} families to {}",
                scenarios.len(),
                manifest.len(),
                path.display()
            );
        }
        None => print!("{payload}"),
    }
    Ok(())
}
