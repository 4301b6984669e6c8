#![forbid(unsafe_code)]

pub mod fixtures;
pub mod scenario;

use crate::scenario::{ExpectedOutcome, Outcome, Scenario, Verdict};
use dxc_runtime::{
    ClassificationEvent, ClassificationLedger, FailureStage, LoadMode, ReferenceLoader,
    StubRegistry,
};
use dxc_stub::FailureKind;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub load_mode: LoadMode,
    /// Opcode families to run; empty runs every family.
    pub opcode_filter: BTreeSet<String>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            load_mode: LoadMode::Deferred,
            opcode_filter: BTreeSet::new(),
        }
    }

    /// Applies `DXC_FIXTURE_ROOT`, `DXC_LOAD_MODE` and `DXC_OPCODES` on top of
    /// [`HarnessConfig::default_paths`].
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// [`HarnessConfig::from_env`] over an arbitrary variable source.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Self::default_paths();
        if let Some(root) = lookup("DXC_FIXTURE_ROOT") {
            config.fixture_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("DXC_LOAD_MODE") {
            config.load_mode = LoadMode::parse(&raw)
                .ok_or_else(|| format!("DXC_LOAD_MODE: invalid load mode {raw}"))?;
        }
        if let Some(raw) = lookup("DXC_OPCODES") {
            config.opcode_filter = parse_opcode_list(&raw);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[must_use]
pub fn parse_opcode_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|op| !op.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub stub_table_present: bool,
    pub scenario_table_present: bool,
    pub fixture_count: usize,
    pub load_mode: LoadMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub case_count: usize,
    /// Includes variant passes.
    pub pass_count: usize,
    pub variant_pass_count: usize,
    pub failures: Vec<String>,
    /// SHA-256 over the ordered per-scenario verdict lines.
    pub fingerprint: String,
}

impl SuiteReport {
    #[must_use]
    pub fn fail_count(&self) -> usize {
        self.case_count.saturating_sub(self.pass_count)
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count && self.failures.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct ScenarioLogEntry<'a> {
    suite: &'static str,
    scenario_id: &'a str,
    opcode: &'a str,
    category: &'static str,
    mode: &'static str,
    stub: &'a str,
    outcome: String,
    verdict: &'static str,
    detail: &'a str,
    classification: Option<&'static str>,
    failure_stage: Option<FailureStage>,
    failure_kind: Option<FailureKind>,
    passed: bool,
}

static SCENARIO_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_scenario_log_path(path: Option<PathBuf>) {
    let cell = SCENARIO_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

fn maybe_append_scenario_log(entry: &ScenarioLogEntry<'_>) -> Result<(), String> {
    let configured = SCENARIO_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os("DXC_SCENARIO_LOG_PATH").map(PathBuf::from);
    let Some(path) = configured.or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing scenario log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending scenario log {}: {err}", path.display()))
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    HarnessReport {
        suite: "smoke",
        stub_table_present: config.fixture_root.join(fixtures::STUB_TABLE).exists(),
        scenario_table_present: config.fixture_root.join(fixtures::SCENARIO_TABLE).exists(),
        fixture_count,
        load_mode: config.load_mode,
    }
}

/// Execution order: opcode family, then category (normal, boundary,
/// exception, verification failure), then id.
#[must_use]
pub fn ordered(scenarios: &[Scenario]) -> Vec<&Scenario> {
    let mut order: Vec<&Scenario> = scenarios.iter().collect();
    order.sort_by(|a, b| {
        a.opcode
            .cmp(&b.opcode)
            .then(a.category.rank().cmp(&b.category.rank()))
            .then(a.id.cmp(&b.id))
    });
    order
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub id: String,
    pub category: &'static str,
    pub stub: String,
    pub title: String,
}

impl ManifestEntry {
    /// `stub;opcode/category;title`, one scenario per line.
    #[must_use]
    pub fn line(&self, opcode: &str) -> String {
        format!("{};{opcode}/{};{}", self.stub, self.category, self.title)
    }
}

/// Scenarios per opcode family, in execution order.
#[must_use]
pub fn collect_manifest(scenarios: &[Scenario]) -> BTreeMap<String, Vec<ManifestEntry>> {
    let mut manifest: BTreeMap<String, Vec<ManifestEntry>> = BTreeMap::new();
    for scenario in ordered(scenarios) {
        manifest
            .entry(scenario.opcode.clone())
            .or_default()
            .push(ManifestEntry {
                id: scenario.id.clone(),
                category: scenario.category.as_str(),
                stub: scenario.stub.clone(),
                title: scenario.title.clone(),
            });
    }
    manifest
}

pub fn filter_opcodes(
    scenarios: Vec<Scenario>,
    filter: &BTreeSet<String>,
) -> Result<Vec<Scenario>, String> {
    if filter.is_empty() {
        return Ok(scenarios);
    }
    let known: BTreeSet<&str> = scenarios.iter().map(|s| s.opcode.as_str()).collect();
    if let Some(unknown) = filter.iter().find(|op| !known.contains(op.as_str())) {
        return Err(format!("unknown opcode family {unknown}"));
    }
    Ok(scenarios
        .into_iter()
        .filter(|s| filter.contains(&s.opcode))
        .collect())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Runs every scenario against a fresh [`ReferenceLoader`] over `registry`.
///
/// Infrastructure faults abort the suite; every other outcome becomes a
/// verdict.
pub fn run_scenarios(
    suite: &'static str,
    scenarios: &[Scenario],
    registry: &StubRegistry,
    mode: LoadMode,
) -> Result<SuiteReport, String> {
    let mut report = SuiteReport {
        suite,
        case_count: scenarios.len(),
        pass_count: 0,
        variant_pass_count: 0,
        failures: Vec::new(),
        fingerprint: String::new(),
    };
    let mut ledger = ClassificationLedger::new();
    let mut classified: BTreeMap<&str, &'static str> = BTreeMap::new();
    let mut transcript = String::new();

    for scenario in ordered(scenarios) {
        let loader = ReferenceLoader::new(registry, mode);
        let executed = scenario.pending().execute(&loader).map_err(|fault| {
            format!(
                "{}: infrastructure fault [{}]: {fault}",
                scenario.id,
                fault.reason_code()
            )
        })?;
        let expects_classification = matches!(scenario.expected, ExpectedOutcome::Failure(_))
            && !matches!(executed.outcome(), Outcome::ReturnValue(_));
        let recorded_before = ledger.events().len();
        let verified = executed.verify_recorded(&mut ledger, mode);
        let event = if ledger.events().len() > recorded_before {
            ledger.last()
        } else {
            None
        };
        let verdict = verified.verdict();
        let normalized = verified.outcome().normalized();
        if expects_classification {
            classified.insert(scenario.id.as_str(), verdict.label());
        }

        match verdict {
            Verdict::Pass => report.pass_count += 1,
            Verdict::VariantPass { .. } => {
                report.pass_count += 1;
                report.variant_pass_count += 1;
            }
            Verdict::Fail { diagnostic } => {
                report.failures.push(format!(
                    "{}: mode={} stub={} {diagnostic}",
                    scenario.id,
                    mode.as_str(),
                    scenario.stub
                ));
            }
        }
        let _ = writeln!(transcript, "{}\t{}\t{normalized}", scenario.id, verdict.label());

        maybe_append_scenario_log(&ScenarioLogEntry {
            suite,
            scenario_id: &scenario.id,
            opcode: &scenario.opcode,
            category: scenario.category.as_str(),
            mode: mode.as_str(),
            stub: &scenario.stub,
            outcome: normalized,
            verdict: verdict.label(),
            detail: verdict.detail(),
            classification: event.map(|event| event.label),
            failure_stage: event.map(|event| event.stage),
            failure_kind: event.and_then(|event| event.kind),
            passed: verdict.is_pass(),
        })?;
    }

    validate_classification_fields(&mut report, mode, &classified, ledger.events());

    report.fingerprint = sha256_hex(transcript.as_bytes());
    Ok(report)
}

/// Cross-checks ledger events against the verdicts of the scenarios that
/// produced them. `classified` maps every scenario whose failure outcome
/// went through the classifier to its verdict label.
fn validate_classification_fields(
    report: &mut SuiteReport,
    mode: LoadMode,
    classified: &BTreeMap<&str, &'static str>,
    events: &[ClassificationEvent],
) {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for event in events {
        let id = event.scenario.trim();
        if id.is_empty() {
            report
                .failures
                .push("classification event missing scenario id".to_string());
            continue;
        }
        if !seen.insert(id) {
            report
                .failures
                .push(format!("{id}: duplicate classification event"));
        }
        if event.mode != mode {
            report.failures.push(format!(
                "{id}: classification recorded under {} during a {} run",
                event.mode,
                mode.as_str()
            ));
        }
        if event.kind.is_none() && event.label != "unexpected_failure" {
            report.failures.push(format!(
                "{id}: {} without a recognized failure kind",
                event.label
            ));
        }
        let Some(verdict) = classified.get(id) else {
            report
                .failures
                .push(format!("{id}: classification event without a failure outcome"));
            continue;
        };
        let consistent = matches!(
            (event.label, *verdict),
            ("expected_failure", "pass")
                | ("tolerated_variant", "variant_pass")
                | ("unexpected_failure", "fail")
        );
        if !consistent {
            report.failures.push(format!(
                "{id}: classification {} disagrees with verdict {verdict}",
                event.label
            ));
        }
    }
    for id in classified.keys() {
        if !seen.contains(id) {
            report
                .failures
                .push(format!("{id}: missing classification event"));
        }
    }
}

pub fn run_opcode_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let registry = fixtures::load_registry(&config.fixture_root)?;
    let scenarios = filter_opcodes(
        fixtures::load_scenarios(&config.fixture_root)?,
        &config.opcode_filter,
    )?;
    run_scenarios("opcode", &scenarios, &registry, config.load_mode)
}

pub fn run_all_core_suites(config: &HarnessConfig) -> Result<Vec<SuiteReport>, String> {
    Ok(vec![run_opcode_suite(config)?])
}
