//! Scenario model and the Pending -> Executed -> Verified runner.

use dxc_runtime::{
    AcceptanceSet, CapturedFailure, Classification, ClassificationLedger, ClassifiedFailure,
    FailureStage, InfrastructureFault, Invocation, LoadAttempt, LoadMode, StubLoader,
    classify_and_record, classify_failure,
};
use dxc_value::{Value, ValueComparison};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioCategory {
    Normal,
    Boundary,
    Exception,
    VerificationFailure,
}

impl ScenarioCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Boundary => "boundary",
            Self::Exception => "exception",
            Self::VerificationFailure => "verification_failure",
        }
    }

    /// Execution rank within an opcode family.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Boundary => 1,
            Self::Exception => 2,
            Self::VerificationFailure => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    ReturnValue {
        value: Value,
        #[serde(default)]
        comparison: ValueComparison,
    },
    Failure(AcceptanceSet),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    ReturnValue(Value),
    ThrownError(CapturedFailure),
    RejectedAtLoad(CapturedFailure),
}

impl Outcome {
    /// Stable rendering without messages, e.g. `thrown:arithmetic_fault`.
    #[must_use]
    pub fn normalized(&self) -> String {
        let kind_of = |failure: &CapturedFailure| {
            failure
                .kind()
                .map_or_else(|| failure.type_name.clone(), |kind| kind.name().to_string())
        };
        match self {
            Self::ReturnValue(value) => format!("return:{value}"),
            Self::ThrownError(failure) => format!("thrown:{}", kind_of(failure)),
            Self::RejectedAtLoad(failure) => format!("rejected:{}", kind_of(failure)),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReturnValue(value) => write!(f, "returned {value}"),
            Self::ThrownError(failure) => write!(f, "threw {failure}"),
            Self::RejectedAtLoad(failure) => write!(f, "rejected at load with {failure}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    VariantPass { note: String },
    Fail { diagnostic: String },
}

impl Verdict {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::VariantPass { .. } => "variant_pass",
            Self::Fail { .. } => "fail",
        }
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        !matches!(self, Self::Fail { .. })
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Pass => "",
            Self::VariantPass { note } => note,
            Self::Fail { diagnostic } => diagnostic,
        }
    }
}

/// One conformance case. Immutable once loaded from the fixture table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub opcode: String,
    #[serde(default)]
    pub title: String,
    pub category: ScenarioCategory,
    pub stub: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub expected: ExpectedOutcome,
}

impl Scenario {
    #[must_use]
    pub fn pending(&self) -> PendingScenario<'_> {
        PendingScenario { scenario: self }
    }

    /// Runs both transitions. Only infrastructure faults escape.
    pub fn invoke(
        &self,
        loader: &dyn StubLoader,
    ) -> Result<VerifiedScenario<'_>, InfrastructureFault> {
        Ok(self.pending().execute(loader)?.verify())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PendingScenario<'s> {
    scenario: &'s Scenario,
}

impl<'s> PendingScenario<'s> {
    pub fn execute(
        self,
        loader: &dyn StubLoader,
    ) -> Result<ExecutedScenario<'s>, InfrastructureFault> {
        let outcome = match loader.load(&self.scenario.stub)? {
            LoadAttempt::Rejected(failure) => Outcome::RejectedAtLoad(failure),
            LoadAttempt::Ready(handle) => match handle.invoke(&self.scenario.args)? {
                Invocation::Returned(value) => Outcome::ReturnValue(value),
                Invocation::Threw(failure) => Outcome::ThrownError(failure),
            },
        };
        Ok(ExecutedScenario {
            scenario: self.scenario,
            outcome,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutedScenario<'s> {
    scenario: &'s Scenario,
    outcome: Outcome,
}

impl<'s> ExecutedScenario<'s> {
    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    #[must_use]
    pub fn verify(self) -> VerifiedScenario<'s> {
        self.judge(classify_failure)
    }

    /// Like [`ExecutedScenario::verify`], additionally recording the failure
    /// classification (if any) in `ledger`.
    pub fn verify_recorded(
        self,
        ledger: &mut ClassificationLedger,
        mode: LoadMode,
    ) -> VerifiedScenario<'s> {
        let id = self.scenario.id.clone();
        self.judge(|stage, failure, acceptance| {
            classify_and_record(ledger, mode, id, stage, failure, acceptance)
        })
    }

    fn judge(
        self,
        classify: impl FnOnce(FailureStage, &CapturedFailure, &AcceptanceSet) -> ClassifiedFailure,
    ) -> VerifiedScenario<'s> {
        let verdict = match (&self.scenario.expected, &self.outcome) {
            (ExpectedOutcome::ReturnValue { value, comparison }, Outcome::ReturnValue(actual)) => {
                if actual.matches(value, *comparison) {
                    Verdict::Pass
                } else {
                    Verdict::Fail {
                        diagnostic: format!(
                            "expected {value}, got {actual} ({} comparison)",
                            comparison.as_str()
                        ),
                    }
                }
            }
            (ExpectedOutcome::ReturnValue { value, .. }, other) => Verdict::Fail {
                diagnostic: format!("expected {value}, but {other}"),
            },
            (ExpectedOutcome::Failure(acceptance), Outcome::ReturnValue(actual)) => {
                Verdict::Fail {
                    diagnostic: format!("expected {}, but returned {actual}", acceptance.primary),
                }
            }
            (ExpectedOutcome::Failure(acceptance), Outcome::ThrownError(failure)) => {
                verdict_for(classify(FailureStage::Execution, failure, acceptance))
            }
            (ExpectedOutcome::Failure(acceptance), Outcome::RejectedAtLoad(failure)) => {
                verdict_for(classify(FailureStage::Load, failure, acceptance))
            }
        };
        VerifiedScenario {
            scenario: self.scenario,
            outcome: self.outcome,
            verdict,
        }
    }
}

fn verdict_for(classified: ClassifiedFailure) -> Verdict {
    match classified.classification {
        Classification::ExpectedFailure => Verdict::Pass,
        Classification::ToleratedVariant { expected, actual } => Verdict::VariantPass {
            note: format!("tolerated {actual} in place of {expected}"),
        },
        Classification::UnexpectedFailure { reason } => Verdict::Fail { diagnostic: reason },
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedScenario<'s> {
    scenario: &'s Scenario,
    outcome: Outcome,
    verdict: Verdict,
}

impl VerifiedScenario<'_> {
    #[must_use]
    pub fn scenario(&self) -> &Scenario {
        self.scenario
    }

    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    #[must_use]
    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpectedOutcome, Outcome, Scenario, ScenarioCategory, Verdict};
    use dxc_runtime::{
        AcceptanceSet, CapturedFailure, ClassificationLedger, InfrastructureFault, Invocation,
        LoadAttempt, LoadMode, OutcomePattern, StubHandle, StubLoader,
    };
    use dxc_stub::FailureKind;
    use dxc_value::{Value, ValueComparison};

    /// Loader that replays a fixed outcome, standing in for a foreign VM.
    struct Scripted(Outcome);

    struct ScriptedHandle(Invocation);

    impl StubHandle for ScriptedHandle {
        fn identifier(&self) -> &str {
            "scripted"
        }

        fn invoke(&self, _args: &[Value]) -> Result<Invocation, InfrastructureFault> {
            Ok(self.0.clone())
        }
    }

    impl StubLoader for Scripted {
        fn load(&self, _identifier: &str) -> Result<LoadAttempt<'_>, InfrastructureFault> {
            Ok(match &self.0 {
                Outcome::RejectedAtLoad(failure) => LoadAttempt::Rejected(failure.clone()),
                Outcome::ThrownError(failure) => {
                    LoadAttempt::Ready(Box::new(ScriptedHandle(Invocation::Threw(failure.clone()))))
                }
                Outcome::ReturnValue(value) => {
                    let invocation = Invocation::Returned(value.clone());
                    LoadAttempt::Ready(Box::new(ScriptedHandle(invocation)))
                }
            })
        }
    }

    struct Broken;

    impl StubLoader for Broken {
        fn load(&self, _identifier: &str) -> Result<LoadAttempt<'_>, InfrastructureFault> {
            Err(InfrastructureFault::LoaderUnavailable {
                detail: "no class path".to_string(),
            })
        }
    }

    fn scenario(expected: ExpectedOutcome) -> Scenario {
        Scenario {
            id: "drem.signed_zero".to_string(),
            opcode: "drem".to_string(),
            title: "negative zero dividend keeps its sign".to_string(),
            category: ScenarioCategory::Boundary,
            stub: "dxc.opcodes.drem.T_drem_1".to_string(),
            args: vec![Value::Double(-0.0), Value::Double(1.0)],
            expected,
        }
    }

    fn returns(value: Value, comparison: ValueComparison) -> ExpectedOutcome {
        ExpectedOutcome::ReturnValue { value, comparison }
    }

    #[test]
    fn exact_comparison_distinguishes_signed_zero() {
        let case = scenario(returns(Value::Double(-0.0), ValueComparison::Exact));
        let verified = case
            .invoke(&Scripted(Outcome::ReturnValue(Value::Double(0.0))))
            .expect("no infra fault");
        assert_eq!(verified.verdict().label(), "fail");

        let verified = case
            .invoke(&Scripted(Outcome::ReturnValue(Value::Double(-0.0))))
            .expect("no infra fault");
        assert_eq!(verified.verdict(), &Verdict::Pass);
    }

    #[test]
    fn numeric_comparison_never_equates_nan() {
        let case = scenario(returns(Value::Double(f64::NAN), ValueComparison::Numeric));
        let verified = case
            .invoke(&Scripted(Outcome::ReturnValue(Value::Double(f64::NAN))))
            .expect("no infra fault");
        assert!(!verified.verdict().is_pass());

        let case = scenario(returns(Value::Double(0.0), ValueComparison::Numeric));
        let verified = case
            .invoke(&Scripted(Outcome::ReturnValue(Value::Double(-0.0))))
            .expect("no infra fault");
        assert!(verified.verdict().is_pass());
    }

    #[test]
    fn deferred_and_eager_rejections_both_pass() {
        let expected = ExpectedOutcome::Failure(
            AcceptanceSet::new(OutcomePattern::at_execution(FailureKind::IllegalAccess))
                .tolerate(OutcomePattern::at_load(FailureKind::VerificationError)),
        );
        let case = scenario(expected);

        let thrown = Outcome::ThrownError(CapturedFailure::new("IllegalAccessError", "private"));
        let verified = case.invoke(&Scripted(thrown)).expect("no infra fault");
        assert_eq!(verified.verdict(), &Verdict::Pass);

        let rejected = Outcome::RejectedAtLoad(CapturedFailure::new("VerifyError", "eager"));
        let verified = case.invoke(&Scripted(rejected)).expect("no infra fault");
        match verified.verdict() {
            Verdict::VariantPass { note } => {
                assert!(note.contains("load:verification_error"), "{note}");
            }
            other => panic!("expected variant pass, got {other:?}"),
        }
    }

    #[test]
    fn return_where_failure_expected_is_a_fail() {
        let case = scenario(ExpectedOutcome::Failure(AcceptanceSet::new(
            OutcomePattern::at_execution(FailureKind::ArithmeticFault),
        )));
        let verified = case
            .invoke(&Scripted(Outcome::ReturnValue(Value::Int(0))))
            .expect("no infra fault");
        assert!(verified.verdict().detail().contains("execution:arithmetic_fault"));
    }

    #[test]
    fn infrastructure_faults_propagate() {
        let case = scenario(returns(Value::Int(1), ValueComparison::Exact));
        let err = case.invoke(&Broken).expect_err("loader fault escapes");
        assert_eq!(err.reason_code(), "infra_loader_unavailable");
    }

    #[test]
    fn recorded_verification_fills_ledger_only_for_failures() {
        let mut ledger = ClassificationLedger::new();
        let case = scenario(ExpectedOutcome::Failure(AcceptanceSet::new(
            OutcomePattern::at_load(FailureKind::VerificationError),
        )));
        let loader = Scripted(Outcome::RejectedAtLoad(CapturedFailure::of_kind(
            FailureKind::ClassFormatError,
            "constant index",
        )));
        let executed = case.pending().execute(&loader).expect("no infra fault");
        assert_eq!(executed.outcome().normalized(), "rejected:class_format_error");
        let verified = executed.verify_recorded(&mut ledger, LoadMode::Eager);
        assert_eq!(verified.verdict().label(), "variant_pass");
        assert_eq!(ledger.events().len(), 1);

        let case = scenario(returns(Value::Int(1), ValueComparison::Exact));
        let loader = Scripted(Outcome::ReturnValue(Value::Int(1)));
        let executed = case.pending().execute(&loader).expect("no infra fault");
        let _ = executed.verify_recorded(&mut ledger, LoadMode::Eager);
        assert_eq!(ledger.events().len(), 1);
    }

    #[test]
    fn scenario_rows_deserialize() {
        let raw = r#"{
            "id": "irem.by_zero",
            "opcode": "irem",
            "category": "exception",
            "stub": "dxc.opcodes.irem.T_irem_1",
            "args": [{"kind":"int","literal":"1"},{"kind":"int","literal":"0"}],
            "expected": {"failure": {"primary": {"stage":"execution","kind":"arithmetic_fault"}}}
        }"#;
        let case: Scenario = serde_json::from_str(raw).expect("row parses");
        assert_eq!(case.category, ScenarioCategory::Exception);
        assert!(case.title.is_empty());
        assert!(matches!(case.expected, ExpectedOutcome::Failure(_)));
    }
}
