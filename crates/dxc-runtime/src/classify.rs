use crate::{CapturedFailure, LoadMode};
use dxc_stub::FailureKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kinds that signal "the runtime refused this program" regardless of
/// whether the refusal happened while loading or on first use.
pub const VERIFIER_REJECTION_KINDS: [FailureKind; 3] = [
    FailureKind::VerificationError,
    FailureKind::ClassFormatError,
    FailureKind::IncompatibleClassChange,
];

#[must_use]
pub fn is_verifier_rejection(kind: FailureKind) -> bool {
    VERIFIER_REJECTION_KINDS.contains(&kind)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Load,
    Execution,
}

impl FailureStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Execution => "execution",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutcomePattern {
    pub stage: FailureStage,
    pub kind: FailureKind,
}

impl OutcomePattern {
    #[must_use]
    pub const fn at_load(kind: FailureKind) -> Self {
        Self {
            stage: FailureStage::Load,
            kind,
        }
    }

    #[must_use]
    pub const fn at_execution(kind: FailureKind) -> Self {
        Self {
            stage: FailureStage::Execution,
            kind,
        }
    }
}

impl fmt::Display for OutcomePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage.as_str(), self.kind)
    }
}

/// One primary expected failure plus explicitly tolerated alternates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceSet {
    pub primary: OutcomePattern,
    #[serde(default)]
    pub tolerated: BTreeSet<OutcomePattern>,
}

impl AcceptanceSet {
    #[must_use]
    pub fn new(primary: OutcomePattern) -> Self {
        Self {
            primary,
            tolerated: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn tolerate(mut self, pattern: OutcomePattern) -> Self {
        self.tolerated.insert(pattern);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    ExpectedFailure,
    ToleratedVariant {
        expected: OutcomePattern,
        actual: OutcomePattern,
    },
    UnexpectedFailure {
        reason: String,
    },
}

impl Classification {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ExpectedFailure => "expected_failure",
            Self::ToleratedVariant { .. } => "tolerated_variant",
            Self::UnexpectedFailure { .. } => "unexpected_failure",
        }
    }

    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Self::UnexpectedFailure { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub kind: Option<FailureKind>,
    pub classification: Classification,
}

pub fn classify_failure(
    stage: FailureStage,
    failure: &CapturedFailure,
    acceptance: &AcceptanceSet,
) -> ClassifiedFailure {
    let Some(kind) = failure.kind() else {
        return ClassifiedFailure {
            kind: None,
            classification: Classification::UnexpectedFailure {
                reason: format!(
                    "unrecognized failure type `{}` at {} (expected {})",
                    failure.type_name,
                    stage.as_str(),
                    acceptance.primary
                ),
            },
        };
    };
    let actual = OutcomePattern { stage, kind };
    let expected = acceptance.primary;

    let classification = if actual == expected {
        Classification::ExpectedFailure
    } else if acceptance.tolerated.contains(&actual)
        || (is_verifier_rejection(expected.kind) && is_verifier_rejection(kind))
    {
        Classification::ToleratedVariant { expected, actual }
    } else {
        Classification::UnexpectedFailure {
            reason: format!("expected {expected}, got {actual} ({failure})"),
        }
    };

    ClassifiedFailure {
        kind: Some(kind),
        classification,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionCheck {
    pub accepted: bool,
    pub kind: Option<FailureKind>,
}

/// Accepts any verifier-rejection kind, at whatever stage it was raised.
#[must_use]
pub fn check_verify_rejection(failure: &CapturedFailure) -> RejectionCheck {
    let kind = failure.kind();
    RejectionCheck {
        accepted: kind.is_some_and(is_verifier_rejection),
        kind,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationEvent {
    pub ts_millis: u128,
    pub mode: LoadMode,
    pub scenario: String,
    pub stage: FailureStage,
    pub kind: Option<FailureKind>,
    pub label: &'static str,
}

#[derive(Debug, Default, Clone)]
pub struct ClassificationLedger {
    events: Vec<ClassificationEvent>,
}

impl ClassificationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: ClassificationEvent) {
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[ClassificationEvent] {
        &self.events
    }

    #[must_use]
    pub fn last(&self) -> Option<&ClassificationEvent> {
        self.events.last()
    }
}

pub fn classify_and_record(
    ledger: &mut ClassificationLedger,
    mode: LoadMode,
    scenario: impl Into<String>,
    stage: FailureStage,
    failure: &CapturedFailure,
    acceptance: &AcceptanceSet,
) -> ClassifiedFailure {
    let classified = classify_failure(stage, failure, acceptance);
    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    ledger.record(ClassificationEvent {
        ts_millis,
        mode,
        scenario: scenario.into(),
        stage,
        kind: classified.kind,
        label: classified.classification.label(),
    });
    classified
}

#[cfg(test)]
mod tests {
    use super::{
        AcceptanceSet, Classification, ClassificationLedger, FailureStage, OutcomePattern,
        check_verify_rejection, classify_and_record, classify_failure,
    };
    use crate::{CapturedFailure, LoadMode};
    use dxc_stub::FailureKind;

    fn verify_at_load() -> AcceptanceSet {
        AcceptanceSet::new(OutcomePattern::at_load(FailureKind::VerificationError))
    }

    #[test]
    fn exact_primary_match_is_expected() {
        let failure = CapturedFailure::of_kind(FailureKind::VerificationError, "underflow");
        let classified = classify_failure(FailureStage::Load, &failure, &verify_at_load());
        assert_eq!(classified.classification, Classification::ExpectedFailure);
        assert_eq!(classified.kind, Some(FailureKind::VerificationError));
    }

    #[test]
    fn verifier_rejections_tolerate_each_other_across_stages() {
        let failure = CapturedFailure::new("java.lang.VerifyError", "");
        let classified = classify_failure(FailureStage::Execution, &failure, &verify_at_load());
        assert_eq!(
            classified.classification,
            Classification::ToleratedVariant {
                expected: OutcomePattern::at_load(FailureKind::VerificationError),
                actual: OutcomePattern::at_execution(FailureKind::VerificationError),
            }
        );

        let failure = CapturedFailure::new("ClassFormatError", "bad index");
        let classified = classify_failure(FailureStage::Load, &failure, &verify_at_load());
        assert!(classified.classification.is_acceptable());
    }

    #[test]
    fn explicit_tolerance_covers_non_rejection_kinds() {
        let acceptance = AcceptanceSet::new(OutcomePattern::at_execution(
            FailureKind::IllegalAccess,
        ))
        .tolerate(OutcomePattern::at_load(FailureKind::VerificationError));
        let failure = CapturedFailure::of_kind(FailureKind::VerificationError, "eager");
        let classified = classify_failure(FailureStage::Load, &failure, &acceptance);
        assert_eq!(classified.classification.label(), "tolerated_variant");

        let failure = CapturedFailure::of_kind(FailureKind::NoSuchMember, "");
        let classified = classify_failure(FailureStage::Execution, &failure, &acceptance);
        assert_eq!(classified.classification.label(), "unexpected_failure");
    }

    #[test]
    fn runtime_failures_do_not_get_the_rejection_band() {
        let acceptance =
            AcceptanceSet::new(OutcomePattern::at_execution(FailureKind::ArithmeticFault));
        let failure = CapturedFailure::of_kind(FailureKind::VerificationError, "");
        let classified = classify_failure(FailureStage::Load, &failure, &acceptance);
        assert!(!classified.classification.is_acceptable());
    }

    #[test]
    fn unrecognized_kind_fails() {
        let failure = CapturedFailure::new("InternalError", "jit");
        let classified = classify_failure(FailureStage::Load, &failure, &verify_at_load());
        assert_eq!(classified.kind, None);
        match classified.classification {
            Classification::UnexpectedFailure { reason } => {
                assert!(reason.contains("InternalError"), "{reason}");
            }
            other => panic!("expected unexpected failure, got {other:?}"),
        }
    }

    #[test]
    fn check_verify_rejection_reports_normalized_kind() {
        let check = check_verify_rejection(&CapturedFailure::new(
            "IncompatibleClassChangeError",
            "",
        ));
        assert!(check.accepted);
        assert_eq!(check.kind, Some(FailureKind::IncompatibleClassChange));

        let check = check_verify_rejection(&CapturedFailure::new("NullPointerException", ""));
        assert!(!check.accepted);
        assert_eq!(check.kind, Some(FailureKind::NullPointer));
    }

    #[test]
    fn records_classifications() {
        let mut ledger = ClassificationLedger::new();
        let failure = CapturedFailure::of_kind(FailureKind::VerificationError, "underflow");
        let classified = classify_and_record(
            &mut ledger,
            LoadMode::Eager,
            "dxc.opcodes.irem.T_irem_2",
            FailureStage::Load,
            &failure,
            &verify_at_load(),
        );
        assert_eq!(classified.classification, Classification::ExpectedFailure);
        assert_eq!(ledger.events().len(), 1);
        let event = ledger.last().expect("event should be present");
        assert_eq!(event.scenario, "dxc.opcodes.irem.T_irem_2");
        assert_eq!(event.label, "expected_failure");
        assert_eq!(event.mode, LoadMode::Eager);
        assert_eq!(event.stage, FailureStage::Load);

        let line = serde_json::to_value(event).expect("event serializes");
        assert_eq!(line["stage"], "load");
        assert_eq!(line["kind"], "verification_error");
        assert_eq!(line["mode"], "eager");
    }
}
