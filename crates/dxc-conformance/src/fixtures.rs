use crate::scenario::Scenario;
use dxc_runtime::StubRegistry;
use dxc_stub::StubDefinition;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub const STUB_TABLE: &str = "opcode_stubs.json";
pub const SCENARIO_TABLE: &str = "opcode_scenarios.json";

pub fn load_stub_definitions(fixture_root: &Path) -> Result<Vec<StubDefinition>, String> {
    let path = fixture_root.join(STUB_TABLE);
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid json in {}: {err}", path.display()))
}

pub fn load_scenarios(fixture_root: &Path) -> Result<Vec<Scenario>, String> {
    let path = fixture_root.join(SCENARIO_TABLE);
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    let scenarios: Vec<Scenario> = serde_json::from_str(&raw)
        .map_err(|err| format!("invalid json in {}: {err}", path.display()))?;

    let mut seen = BTreeSet::new();
    for scenario in &scenarios {
        if !seen.insert(scenario.id.as_str()) {
            return Err(format!("duplicate scenario id {}", scenario.id));
        }
        if scenario.opcode.trim().is_empty() {
            return Err(format!("{}: opcode must not be empty", scenario.id));
        }
    }
    Ok(scenarios)
}

/// Expands templates and mutations, then registers every unit.
pub fn build_registry(definitions: &[StubDefinition]) -> Result<StubRegistry, String> {
    StubRegistry::from_units(definitions.iter().map(StubDefinition::build))
        .map_err(|err| format!("stub table rejected [{}]: {err}", err.reason_code()))
}

pub fn load_registry(fixture_root: &Path) -> Result<StubRegistry, String> {
    build_registry(&load_stub_definitions(fixture_root)?)
}
