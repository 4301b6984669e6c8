#![forbid(unsafe_code)]

pub mod classify;

pub use classify::{
    AcceptanceSet, Classification, ClassificationEvent, ClassificationLedger, ClassifiedFailure,
    FailureStage, OutcomePattern, RejectionCheck, VERIFIER_REJECTION_KINDS,
    check_verify_rejection, classify_and_record, classify_failure, is_verifier_rejection,
};

use dxc_stub::{
    ExecError, FailureKind, Fault, Linker, StubReference, StubUnit, VerifiedUnit, execute,
    verify,
};
use dxc_value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A failure observed while loading or running a stub, as reported by the
/// loader. `type_name` is kept verbatim; [`CapturedFailure::kind`]
/// normalizes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFailure {
    pub type_name: String,
    pub message: String,
}

impl CapturedFailure {
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn of_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::new(kind.name(), message)
    }

    #[must_use]
    pub fn kind(&self) -> Option<FailureKind> {
        FailureKind::parse(&self.type_name)
    }
}

impl From<Fault> for CapturedFailure {
    fn from(fault: Fault) -> Self {
        Self::of_kind(fault.kind, fault.message)
    }
}

impl fmt::Display for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.type_name)
        } else {
            write!(f, "{}: {}", self.type_name, self.message)
        }
    }
}

/// The loader or harness could not even attempt the operation. Never part
/// of a conformance result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfrastructureFault {
    DuplicateStub { identifier: String },
    ArgumentMismatch { identifier: String, detail: String },
    LoaderUnavailable { detail: String },
}

impl InfrastructureFault {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::DuplicateStub { .. } => "infra_duplicate_stub",
            Self::ArgumentMismatch { .. } => "infra_argument_mismatch",
            Self::LoaderUnavailable { .. } => "infra_loader_unavailable",
        }
    }
}

impl fmt::Display for InfrastructureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStub { identifier } => {
                write!(f, "stub {identifier} registered more than once")
            }
            Self::ArgumentMismatch { identifier, detail } => {
                write!(f, "invalid arguments for {identifier}: {detail}")
            }
            Self::LoaderUnavailable { detail } => write!(f, "loader unavailable: {detail}"),
        }
    }
}

impl std::error::Error for InfrastructureFault {}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Returned(Value),
    Threw(CapturedFailure),
}

/// A loaded stub ready for its entry point to be invoked.
pub trait StubHandle {
    fn identifier(&self) -> &str;

    fn invoke(&self, args: &[Value]) -> Result<Invocation, InfrastructureFault>;
}

pub enum LoadAttempt<'a> {
    Ready(Box<dyn StubHandle + 'a>),
    Rejected(CapturedFailure),
}

impl fmt::Debug for LoadAttempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(handle) => f.debug_tuple("Ready").field(&handle.identifier()).finish(),
            Self::Rejected(failure) => f.debug_tuple("Rejected").field(failure).finish(),
        }
    }
}

/// Seam between the oracle and whatever loads and verifies program units.
pub trait StubLoader {
    fn load(&self, identifier: &str) -> Result<LoadAttempt<'_>, InfrastructureFault>;
}

/// Immutable table of stub units keyed by fully-qualified identifier.
#[derive(Debug, Default, Clone)]
pub struct StubRegistry {
    units: BTreeMap<String, StubUnit>,
}

impl StubRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_units(
        units: impl IntoIterator<Item = StubUnit>,
    ) -> Result<Self, InfrastructureFault> {
        let mut registry = Self::new();
        for unit in units {
            registry.register(unit)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, unit: StubUnit) -> Result<(), InfrastructureFault> {
        if self.units.contains_key(&unit.name) {
            return Err(InfrastructureFault::DuplicateStub {
                identifier: unit.name,
            });
        }
        self.units.insert(unit.name.clone(), unit);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&StubUnit> {
        self.units.get(identifier)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// When cross-unit references are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Resolve at first use; failures surface while executing.
    #[default]
    Deferred,
    /// Resolve every reference while loading; failures reject the unit.
    Eager,
}

impl LoadMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Eager => "eager",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "deferred" | "lazy" => Some(Self::Deferred),
            "eager" | "strict" => Some(Self::Eager),
            _ => None,
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Resolver<'r> {
    registry: &'r StubRegistry,
}

impl<'r> Resolver<'r> {
    /// Resolution order: definition, verification, member, access, static-ness.
    fn resolve(self, reference: &StubReference) -> Result<VerifiedUnit<'r>, Fault> {
        let target = &reference.target;
        let Some(unit) = self.registry.get(target) else {
            return Err(Fault::new(FailureKind::NoClassDefFound, target.clone()));
        };
        let verified =
            verify(unit).map_err(|err| Fault::new(err.failure_kind(), format!("{target}: {err}")))?;
        if !unit.matches_descriptor(reference) {
            return Err(Fault::new(
                FailureKind::NoSuchMember,
                format!(
                    "{target} has signature {:?} -> {}, caller expects {:?} -> {}",
                    unit.params, unit.returns, reference.params, reference.returns
                ),
            ));
        }
        if !unit.accessible {
            return Err(Fault::new(
                FailureKind::IllegalAccess,
                format!("{target} is not accessible"),
            ));
        }
        if unit.is_static != reference.is_static {
            let expected = if reference.is_static { "static" } else { "instance" };
            return Err(Fault::new(
                FailureKind::IncompatibleClassChange,
                format!("{target}: expected {expected} entry point"),
            ));
        }
        Ok(verified)
    }
}

impl Linker for Resolver<'_> {
    fn link(&self, reference: &StubReference) -> Result<VerifiedUnit<'_>, Fault> {
        self.resolve(reference)
    }
}

/// Loads units from a [`StubRegistry`] using the in-tree verifier and
/// interpreter.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceLoader<'r> {
    resolver: Resolver<'r>,
    mode: LoadMode,
}

impl<'r> ReferenceLoader<'r> {
    #[must_use]
    pub fn new(registry: &'r StubRegistry, mode: LoadMode) -> Self {
        Self {
            resolver: Resolver { registry },
            mode,
        }
    }
}

impl StubLoader for ReferenceLoader<'_> {
    fn load(&self, identifier: &str) -> Result<LoadAttempt<'_>, InfrastructureFault> {
        let Some(unit) = self.resolver.registry.get(identifier) else {
            return Ok(LoadAttempt::Rejected(CapturedFailure::of_kind(
                FailureKind::NoClassDefFound,
                identifier,
            )));
        };
        let verified = match verify(unit) {
            Ok(verified) => verified,
            Err(err) => {
                return Ok(LoadAttempt::Rejected(CapturedFailure::of_kind(
                    err.failure_kind(),
                    format!("{identifier}: {err}"),
                )));
            }
        };
        if self.mode == LoadMode::Eager {
            for reference in &unit.references {
                if let Err(fault) = self.resolver.resolve(reference) {
                    return Ok(LoadAttempt::Rejected(CapturedFailure::of_kind(
                        FailureKind::VerificationError,
                        format!(
                            "{identifier}: eager resolution of {} failed with {fault}",
                            reference.target
                        ),
                    )));
                }
            }
        }
        Ok(LoadAttempt::Ready(Box::new(ReferenceHandle {
            identifier: identifier.to_string(),
            unit: verified,
            resolver: self.resolver,
        })))
    }
}

struct ReferenceHandle<'r> {
    identifier: String,
    unit: VerifiedUnit<'r>,
    resolver: Resolver<'r>,
}

impl StubHandle for ReferenceHandle<'_> {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn invoke(&self, args: &[Value]) -> Result<Invocation, InfrastructureFault> {
        match execute(self.unit, args, &self.resolver) {
            Ok(value) => Ok(Invocation::Returned(value)),
            Err(ExecError::Fault(fault)) => Ok(Invocation::Threw(fault.into())),
            Err(ExecError::Arguments(mismatch)) => Err(InfrastructureFault::ArgumentMismatch {
                identifier: self.identifier.clone(),
                detail: mismatch.to_string(),
            }),
        }
    }
}
