#![forbid(unsafe_code)]

pub mod interp;
pub mod verify;

pub use interp::{
    ArgumentMismatch, ExecError, HEAP_ELEMENT_BUDGET, Linker, MAX_CALL_DEPTH, check_arguments,
    execute,
};
pub use verify::{VerifiedUnit, VerifyError, verify};

use dxc_value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized failure taxonomy shared by loaders, verifiers and scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    VerificationError,
    ClassFormatError,
    IncompatibleClassChange,
    NoClassDefFound,
    NoSuchMember,
    IllegalAccess,
    ArithmeticFault,
    IndexOutOfBounds,
    NullPointer,
    NegativeArraySize,
    ClassCast,
    StackOverflow,
    OutOfMemory,
}

pub const ALL_FAILURE_KINDS: [FailureKind; 13] = [
    FailureKind::VerificationError,
    FailureKind::ClassFormatError,
    FailureKind::IncompatibleClassChange,
    FailureKind::NoClassDefFound,
    FailureKind::NoSuchMember,
    FailureKind::IllegalAccess,
    FailureKind::ArithmeticFault,
    FailureKind::IndexOutOfBounds,
    FailureKind::NullPointer,
    FailureKind::NegativeArraySize,
    FailureKind::ClassCast,
    FailureKind::StackOverflow,
    FailureKind::OutOfMemory,
];

impl FailureKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::VerificationError => "verification_error",
            Self::ClassFormatError => "class_format_error",
            Self::IncompatibleClassChange => "incompatible_class_change",
            Self::NoClassDefFound => "no_class_def_found",
            Self::NoSuchMember => "no_such_member",
            Self::IllegalAccess => "illegal_access",
            Self::ArithmeticFault => "arithmetic_fault",
            Self::IndexOutOfBounds => "index_out_of_bounds",
            Self::NullPointer => "null_pointer",
            Self::NegativeArraySize => "negative_array_size",
            Self::ClassCast => "class_cast",
            Self::StackOverflow => "stack_overflow",
            Self::OutOfMemory => "out_of_memory",
        }
    }

    /// Normalizes a raw failure type name reported by a loader.
    ///
    /// Accepts the canonical snake_case names as well as the JVM/Dalvik
    /// throwable class names, with or without the `java.lang.` package.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let simple = trimmed.strip_prefix("java.lang.").unwrap_or(trimmed);
        match simple {
            "verification_error" | "VerifyError" => Some(Self::VerificationError),
            "class_format_error" | "ClassFormatError" => Some(Self::ClassFormatError),
            "incompatible_class_change" | "IncompatibleClassChangeError" => {
                Some(Self::IncompatibleClassChange)
            }
            "no_class_def_found" | "NoClassDefFoundError" | "ClassNotFoundException" => {
                Some(Self::NoClassDefFound)
            }
            "no_such_member" | "NoSuchFieldError" | "NoSuchMethodError" => {
                Some(Self::NoSuchMember)
            }
            "illegal_access" | "IllegalAccessError" => Some(Self::IllegalAccess),
            "arithmetic_fault" | "ArithmeticException" => Some(Self::ArithmeticFault),
            "index_out_of_bounds"
            | "ArrayIndexOutOfBoundsException"
            | "IndexOutOfBoundsException" => Some(Self::IndexOutOfBounds),
            "null_pointer" | "NullPointerException" => Some(Self::NullPointer),
            "negative_array_size" | "NegativeArraySizeException" => {
                Some(Self::NegativeArraySize)
            }
            "class_cast" | "ClassCastException" => Some(Self::ClassCast),
            "stack_overflow" | "StackOverflowError" => Some(Self::StackOverflow),
            "out_of_memory" | "OutOfMemoryError" => Some(Self::OutOfMemory),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure raised by the reference stub machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FailureKind,
    pub message: String,
}

impl Fault {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    /// Shift and bitwise operators only exist for integral kinds.
    #[must_use]
    pub const fn is_integral_only(self) -> bool {
        matches!(
            self,
            Self::Shl | Self::Shr | Self::Ushr | Self::And | Self::Or | Self::Xor
        )
    }

    #[must_use]
    pub const fn is_shift(self) -> bool {
        matches!(self, Self::Shl | Self::Shr | Self::Ushr)
    }
}

/// Result of comparing against NaN for `cmpl`/`cmpg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NanBias {
    #[default]
    Less,
    Greater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrowKind {
    Byte,
    Char,
    Short,
}

/// One instruction of a stub program.
///
/// Locals occupy one slot each regardless of width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    Load {
        kind: ValueKind,
        index: u16,
    },
    Store {
        kind: ValueKind,
        index: u16,
    },
    PushInt {
        value: i32,
    },
    Const {
        index: u16,
    },
    ConstNull,
    Binary {
        kind: ValueKind,
        operator: BinaryOp,
    },
    Neg {
        kind: ValueKind,
    },
    Convert {
        from: ValueKind,
        to: ValueKind,
    },
    Narrow {
        to: NarrowKind,
    },
    Cmp {
        kind: ValueKind,
        #[serde(default)]
        nan_bias: NanBias,
    },
    NewArray {
        elem: ValueKind,
    },
    ArrayLoad {
        elem: ValueKind,
    },
    ArrayStore {
        elem: ValueKind,
    },
    ArrayLength,
    Invoke {
        reference: u16,
    },
    Pop,
    Dup,
    Return {
        kind: ValueKind,
    },
}

impl Instr {
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Store { .. } => "store",
            Self::PushInt { .. } => "push_int",
            Self::Const { .. } => "const",
            Self::ConstNull => "const_null",
            Self::Binary { .. } => "binary",
            Self::Neg { .. } => "neg",
            Self::Convert { .. } => "convert",
            Self::Narrow { .. } => "narrow",
            Self::Cmp { .. } => "cmp",
            Self::NewArray { .. } => "new_array",
            Self::ArrayLoad { .. } => "array_load",
            Self::ArrayStore { .. } => "array_store",
            Self::ArrayLength => "array_length",
            Self::Invoke { .. } => "invoke",
            Self::Pop => "pop",
            Self::Dup => "dup",
            Self::Return { .. } => "return",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_stack() -> u16 {
    8
}

/// Symbolic reference from one unit to another, with the descriptor the
/// caller was compiled against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubReference {
    pub target: String,
    #[serde(default)]
    pub params: Vec<ValueKind>,
    pub returns: ValueKind,
    #[serde(default = "default_true")]
    pub is_static: bool,
}

impl StubReference {
    #[must_use]
    pub fn new(target: impl Into<String>, params: Vec<ValueKind>, returns: ValueKind) -> Self {
        Self {
            target: target.into(),
            params,
            returns,
            is_static: true,
        }
    }
}

/// A minimal program unit: one entry point plus its constant and
/// reference tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubUnit {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ValueKind>,
    pub returns: ValueKind,
    /// Extra local slots beyond the parameters.
    #[serde(default)]
    pub locals: u16,
    #[serde(default = "default_max_stack")]
    pub max_stack: u16,
    #[serde(default)]
    pub constants: Vec<Value>,
    #[serde(default)]
    pub references: Vec<StubReference>,
    #[serde(default = "default_true")]
    pub is_static: bool,
    #[serde(default = "default_true")]
    pub accessible: bool,
    pub code: Vec<Instr>,
}

impl StubUnit {
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.params.len() + usize::from(self.locals)
    }

    /// Whether a reference descriptor agrees with this unit's signature.
    #[must_use]
    pub fn matches_descriptor(&self, reference: &StubReference) -> bool {
        self.params == reference.params && self.returns == reference.returns
    }
}

#[derive(Debug, Clone)]
pub struct StubBuilder {
    unit: StubUnit,
}

impl StubBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            unit: StubUnit {
                name: name.into(),
                params: Vec::new(),
                returns: ValueKind::Void,
                locals: 0,
                max_stack: default_max_stack(),
                constants: Vec::new(),
                references: Vec::new(),
                is_static: true,
                accessible: true,
                code: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn param(mut self, kind: ValueKind) -> Self {
        self.unit.params.push(kind);
        self
    }

    #[must_use]
    pub fn params(mut self, kinds: impl IntoIterator<Item = ValueKind>) -> Self {
        self.unit.params.extend(kinds);
        self
    }

    #[must_use]
    pub fn returns(mut self, kind: ValueKind) -> Self {
        self.unit.returns = kind;
        self
    }

    #[must_use]
    pub fn locals(mut self, count: u16) -> Self {
        self.unit.locals = count;
        self
    }

    #[must_use]
    pub fn max_stack(mut self, depth: u16) -> Self {
        self.unit.max_stack = depth;
        self
    }

    #[must_use]
    pub fn constant(mut self, value: Value) -> Self {
        self.unit.constants.push(value);
        self
    }

    #[must_use]
    pub fn reference(mut self, reference: StubReference) -> Self {
        self.unit.references.push(reference);
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.unit.accessible = false;
        self
    }

    #[must_use]
    pub fn instance(mut self) -> Self {
        self.unit.is_static = false;
        self
    }

    #[must_use]
    pub fn op(mut self, instr: Instr) -> Self {
        self.unit.code.push(instr);
        self
    }

    #[must_use]
    pub fn ops(mut self, instrs: impl IntoIterator<Item = Instr>) -> Self {
        self.unit.code.extend(instrs);
        self
    }

    #[must_use]
    pub fn build(self) -> StubUnit {
        self.unit
    }
}

/// Canonical single-operation stub: load every parameter in order, apply
/// `instr`, return the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTemplate {
    #[serde(default)]
    pub params: Vec<ValueKind>,
    pub instr: Instr,
    pub returns: ValueKind,
}

impl OperationTemplate {
    #[must_use]
    pub fn build(&self, name: &str) -> StubUnit {
        let depth = u16::try_from(self.params.len() + 1).unwrap_or(u16::MAX);
        let mut builder = StubBuilder::new(name)
            .params(self.params.iter().copied())
            .returns(self.returns)
            .max_stack(depth);
        for (index, kind) in self.params.iter().enumerate() {
            let index = u16::try_from(index).unwrap_or(u16::MAX);
            builder = builder.op(Instr::Load { kind: *kind, index });
        }
        builder
            .op(self.instr)
            .op(Instr::Return { kind: self.returns })
            .build()
    }
}

/// Derives a malformed variant from a well-formed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    /// Removes the last operand load, leaving the operation short.
    DropOperand,
    /// Retypes the last parameter and its load; units without parameters
    /// get a return of the wrong kind instead.
    WrongOperandKind,
    /// Prepends a load from one past the end of the constant pool.
    BadConstantIndex,
    /// Declares one fewer stack slot than the operand loads need.
    ShrinkMaxStack,
    /// Removes the final return so execution falls off the end.
    MissingReturn,
}

impl Mutation {
    pub fn apply(self, unit: &mut StubUnit) {
        match self {
            Self::DropOperand => {
                match unit
                    .code
                    .iter()
                    .rposition(|instr| matches!(instr, Instr::Load { .. }))
                {
                    Some(pos) => {
                        unit.code.remove(pos);
                    }
                    None => unit.code.insert(0, Instr::Pop),
                }
            }
            Self::WrongOperandKind => {
                let Some(last) = unit.params.len().checked_sub(1) else {
                    let wrong = confused_kind(unit.returns);
                    if let Some(pos) = unit
                        .code
                        .iter()
                        .rposition(|instr| matches!(instr, Instr::Return { .. }))
                    {
                        unit.code[pos] = Instr::Return { kind: wrong };
                    }
                    return;
                };
                let wrong = confused_kind(unit.params[last]);
                unit.params[last] = wrong;
                let last_index = u16::try_from(last).unwrap_or(u16::MAX);
                for instr in &mut unit.code {
                    match instr {
                        Instr::Load { kind, index } if *index == last_index => *kind = wrong,
                        _ => {}
                    }
                }
            }
            Self::BadConstantIndex => {
                let index = u16::try_from(unit.constants.len()).unwrap_or(u16::MAX);
                unit.code.insert(0, Instr::Const { index });
                unit.code.insert(1, Instr::Pop);
            }
            Self::ShrinkMaxStack => {
                let needed = u16::try_from(unit.params.len().max(1)).unwrap_or(u16::MAX);
                unit.max_stack = needed - 1;
            }
            Self::MissingReturn => {
                if let Some(pos) = unit
                    .code
                    .iter()
                    .rposition(|instr| matches!(instr, Instr::Return { .. }))
                {
                    unit.code.remove(pos);
                }
            }
        }
    }
}

fn confused_kind(kind: ValueKind) -> ValueKind {
    match kind {
        ValueKind::Int => ValueKind::Double,
        ValueKind::Long => ValueKind::Int,
        ValueKind::Float => ValueKind::Long,
        ValueKind::Double => ValueKind::Float,
        ValueKind::Ref | ValueKind::Void => ValueKind::Int,
    }
}

/// One row of a stub fixture table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum StubDefinition {
    Template {
        name: String,
        template: OperationTemplate,
        #[serde(default)]
        mutation: Option<Mutation>,
    },
    Unit(StubUnit),
}

impl StubDefinition {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Template { name, .. } => name,
            Self::Unit(unit) => &unit.name,
        }
    }

    #[must_use]
    pub fn build(&self) -> StubUnit {
        match self {
            Self::Template {
                name,
                template,
                mutation,
            } => {
                let mut unit = template.build(name);
                if let Some(mutation) = mutation {
                    mutation.apply(&mut unit);
                }
                unit
            }
            Self::Unit(unit) => unit.clone(),
        }
    }
}
