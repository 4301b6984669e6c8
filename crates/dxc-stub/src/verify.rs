//! Static verification of stub units.
//!
//! Stub programs are straight-line, so a single abstract pass over the
//! operand stack and locals decides acceptance. Instructions after the first
//! reachable `return` are dead and not inspected.

use crate::{BinaryOp, FailureKind, Instr, StubUnit};
use dxc_value::{Value, ValueKind};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    StackUnderflow {
        pc: usize,
    },
    StackOverflow {
        pc: usize,
        max_stack: u16,
    },
    OperandMismatch {
        pc: usize,
        expected: ValueKind,
        actual: ValueKind,
    },
    IllegalOperandKind {
        pc: usize,
        mnemonic: &'static str,
        kind: ValueKind,
    },
    IllegalConversion {
        pc: usize,
        from: ValueKind,
        to: ValueKind,
    },
    LocalOutOfRange {
        pc: usize,
        index: u16,
        locals: usize,
    },
    UnassignedLocal {
        pc: usize,
        index: u16,
    },
    LocalKindMismatch {
        pc: usize,
        index: u16,
        expected: ValueKind,
        actual: ValueKind,
    },
    ReturnMismatch {
        pc: usize,
        declared: ValueKind,
        actual: ValueKind,
    },
    FallsOffEnd {
        len: usize,
    },
    ConstantIndexOutOfRange {
        pc: usize,
        index: u16,
        len: usize,
    },
    UnloadableConstant {
        pc: usize,
        index: u16,
    },
    ReferenceIndexOutOfRange {
        pc: usize,
        index: u16,
        len: usize,
    },
}

impl VerifyError {
    /// Malformed pool indices are structural defects; everything else is a
    /// type-flow rejection.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ConstantIndexOutOfRange { .. }
            | Self::UnloadableConstant { .. }
            | Self::ReferenceIndexOutOfRange { .. } => FailureKind::ClassFormatError,
            _ => FailureKind::VerificationError,
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::StackUnderflow { .. } => "verify_stack_underflow",
            Self::StackOverflow { .. } => "verify_stack_overflow",
            Self::OperandMismatch { .. } => "verify_operand_mismatch",
            Self::IllegalOperandKind { .. } => "verify_illegal_operand_kind",
            Self::IllegalConversion { .. } => "verify_illegal_conversion",
            Self::LocalOutOfRange { .. } => "verify_local_out_of_range",
            Self::UnassignedLocal { .. } => "verify_unassigned_local",
            Self::LocalKindMismatch { .. } => "verify_local_kind_mismatch",
            Self::ReturnMismatch { .. } => "verify_return_mismatch",
            Self::FallsOffEnd { .. } => "verify_falls_off_end",
            Self::ConstantIndexOutOfRange { .. } => "format_constant_index",
            Self::UnloadableConstant { .. } => "format_unloadable_constant",
            Self::ReferenceIndexOutOfRange { .. } => "format_reference_index",
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow { pc } => write!(f, "pc {pc}: operand stack underflow"),
            Self::StackOverflow { pc, max_stack } => {
                write!(f, "pc {pc}: operand stack exceeds max_stack={max_stack}")
            }
            Self::OperandMismatch {
                pc,
                expected,
                actual,
            } => write!(f, "pc {pc}: expected {expected} operand, found {actual}"),
            Self::IllegalOperandKind { pc, mnemonic, kind } => {
                write!(f, "pc {pc}: {mnemonic} is not defined for {kind}")
            }
            Self::IllegalConversion { pc, from, to } => {
                write!(f, "pc {pc}: no conversion from {from} to {to}")
            }
            Self::LocalOutOfRange { pc, index, locals } => {
                write!(f, "pc {pc}: local {index} out of range (locals={locals})")
            }
            Self::UnassignedLocal { pc, index } => {
                write!(f, "pc {pc}: local {index} read before assignment")
            }
            Self::LocalKindMismatch {
                pc,
                index,
                expected,
                actual,
            } => write!(f, "pc {pc}: local {index} holds {actual}, load expects {expected}"),
            Self::ReturnMismatch {
                pc,
                declared,
                actual,
            } => write!(f, "pc {pc}: returns {actual} but signature declares {declared}"),
            Self::FallsOffEnd { len } => {
                write!(f, "execution falls off the end of code (len={len})")
            }
            Self::ConstantIndexOutOfRange { pc, index, len } => {
                write!(f, "pc {pc}: constant index {index} out of range (pool={len})")
            }
            Self::UnloadableConstant { pc, index } => {
                write!(f, "pc {pc}: constant {index} cannot be pushed")
            }
            Self::ReferenceIndexOutOfRange { pc, index, len } => {
                write!(f, "pc {pc}: reference index {index} out of range (table={len})")
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// A unit that passed [`verify`]. Only verified units can be executed.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedUnit<'a> {
    unit: &'a StubUnit,
}

impl<'a> VerifiedUnit<'a> {
    #[must_use]
    pub fn unit(self) -> &'a StubUnit {
        self.unit
    }
}

struct Frame<'a> {
    unit: &'a StubUnit,
    stack: Vec<ValueKind>,
    locals: Vec<Option<ValueKind>>,
    pc: usize,
}

impl<'a> Frame<'a> {
    fn new(unit: &'a StubUnit) -> Self {
        let mut locals = vec![None; unit.local_count()];
        for (slot, kind) in locals.iter_mut().zip(&unit.params) {
            *slot = Some(*kind);
        }
        Self {
            unit,
            stack: Vec::with_capacity(usize::from(unit.max_stack)),
            locals,
            pc: 0,
        }
    }

    fn push(&mut self, kind: ValueKind) -> Result<(), VerifyError> {
        if self.stack.len() >= usize::from(self.unit.max_stack) {
            return Err(VerifyError::StackOverflow {
                pc: self.pc,
                max_stack: self.unit.max_stack,
            });
        }
        self.stack.push(kind);
        Ok(())
    }

    fn pop_any(&mut self) -> Result<ValueKind, VerifyError> {
        self.stack
            .pop()
            .ok_or(VerifyError::StackUnderflow { pc: self.pc })
    }

    fn pop(&mut self, expected: ValueKind) -> Result<(), VerifyError> {
        let actual = self.pop_any()?;
        if actual != expected {
            return Err(VerifyError::OperandMismatch {
                pc: self.pc,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn local_slot(&self, index: u16) -> Result<usize, VerifyError> {
        let slot = usize::from(index);
        if slot >= self.locals.len() {
            return Err(VerifyError::LocalOutOfRange {
                pc: self.pc,
                index,
                locals: self.locals.len(),
            });
        }
        Ok(slot)
    }

    fn require_value_kind(
        &self,
        mnemonic: &'static str,
        kind: ValueKind,
    ) -> Result<(), VerifyError> {
        if kind == ValueKind::Void {
            return Err(VerifyError::IllegalOperandKind {
                pc: self.pc,
                mnemonic,
                kind,
            });
        }
        Ok(())
    }

    fn require_numeric(&self, mnemonic: &'static str, kind: ValueKind) -> Result<(), VerifyError> {
        if matches!(kind, ValueKind::Void | ValueKind::Ref) {
            return Err(VerifyError::IllegalOperandKind {
                pc: self.pc,
                mnemonic,
                kind,
            });
        }
        Ok(())
    }

    /// Returns `true` once a `return` has been checked.
    fn step(&mut self, instr: Instr) -> Result<bool, VerifyError> {
        match instr {
            Instr::Load { kind, index } => {
                self.require_value_kind(instr.mnemonic(), kind)?;
                let slot = self.local_slot(index)?;
                match self.locals[slot] {
                    None => return Err(VerifyError::UnassignedLocal { pc: self.pc, index }),
                    Some(actual) if actual != kind => {
                        return Err(VerifyError::LocalKindMismatch {
                            pc: self.pc,
                            index,
                            expected: kind,
                            actual,
                        });
                    }
                    Some(_) => {}
                }
                self.push(kind)?;
            }
            Instr::Store { kind, index } => {
                self.require_value_kind(instr.mnemonic(), kind)?;
                self.pop(kind)?;
                let slot = self.local_slot(index)?;
                self.locals[slot] = Some(kind);
            }
            Instr::PushInt { .. } => self.push(ValueKind::Int)?,
            Instr::Const { index } => {
                let kind = self.constant_kind(index)?;
                self.push(kind)?;
            }
            Instr::ConstNull => self.push(ValueKind::Ref)?,
            Instr::Binary { kind, operator } => {
                self.require_numeric(instr.mnemonic(), kind)?;
                if operator.is_integral_only() && kind.is_floating() {
                    return Err(VerifyError::IllegalOperandKind {
                        pc: self.pc,
                        mnemonic: binary_mnemonic(operator),
                        kind,
                    });
                }
                let rhs = if operator.is_shift() {
                    ValueKind::Int
                } else {
                    kind
                };
                self.pop(rhs)?;
                self.pop(kind)?;
                self.push(kind)?;
            }
            Instr::Neg { kind } => {
                self.require_numeric(instr.mnemonic(), kind)?;
                self.pop(kind)?;
                self.push(kind)?;
            }
            Instr::Convert { from, to } => {
                let numeric = |kind: ValueKind| !matches!(kind, ValueKind::Void | ValueKind::Ref);
                if from == to || !numeric(from) || !numeric(to) {
                    return Err(VerifyError::IllegalConversion {
                        pc: self.pc,
                        from,
                        to,
                    });
                }
                self.pop(from)?;
                self.push(to)?;
            }
            Instr::Narrow { .. } => {
                self.pop(ValueKind::Int)?;
                self.push(ValueKind::Int)?;
            }
            Instr::Cmp { kind, .. } => {
                if !matches!(kind, ValueKind::Long | ValueKind::Float | ValueKind::Double) {
                    return Err(VerifyError::IllegalOperandKind {
                        pc: self.pc,
                        mnemonic: instr.mnemonic(),
                        kind,
                    });
                }
                self.pop(kind)?;
                self.pop(kind)?;
                self.push(ValueKind::Int)?;
            }
            Instr::NewArray { elem } => {
                self.require_value_kind(instr.mnemonic(), elem)?;
                self.pop(ValueKind::Int)?;
                self.push(ValueKind::Ref)?;
            }
            Instr::ArrayLoad { elem } => {
                self.require_value_kind(instr.mnemonic(), elem)?;
                self.pop(ValueKind::Int)?;
                self.pop(ValueKind::Ref)?;
                self.push(elem)?;
            }
            Instr::ArrayStore { elem } => {
                self.require_value_kind(instr.mnemonic(), elem)?;
                self.pop(elem)?;
                self.pop(ValueKind::Int)?;
                self.pop(ValueKind::Ref)?;
            }
            Instr::ArrayLength => {
                self.pop(ValueKind::Ref)?;
                self.push(ValueKind::Int)?;
            }
            Instr::Invoke { reference } => {
                let Some(target) = self.unit.references.get(usize::from(reference)) else {
                    return Err(VerifyError::ReferenceIndexOutOfRange {
                        pc: self.pc,
                        index: reference,
                        len: self.unit.references.len(),
                    });
                };
                for kind in target.params.iter().rev() {
                    self.pop(*kind)?;
                }
                if target.returns != ValueKind::Void {
                    self.push(target.returns)?;
                }
            }
            Instr::Pop => {
                self.pop_any()?;
            }
            Instr::Dup => {
                let top = self.pop_any()?;
                self.stack.push(top);
                self.push(top)?;
            }
            Instr::Return { kind } => {
                if kind != self.unit.returns {
                    return Err(VerifyError::ReturnMismatch {
                        pc: self.pc,
                        declared: self.unit.returns,
                        actual: kind,
                    });
                }
                if kind != ValueKind::Void {
                    self.pop(kind)?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn constant_kind(&self, index: u16) -> Result<ValueKind, VerifyError> {
        match self.unit.constants.get(usize::from(index)) {
            None => Err(VerifyError::ConstantIndexOutOfRange {
                pc: self.pc,
                index,
                len: self.unit.constants.len(),
            }),
            Some(Value::Void | Value::Null | Value::Array { .. }) => {
                Err(VerifyError::UnloadableConstant { pc: self.pc, index })
            }
            Some(value) => Ok(value.kind()),
        }
    }
}

fn binary_mnemonic(operator: BinaryOp) -> &'static str {
    match operator {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Rem => "rem",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
        BinaryOp::Ushr => "ushr",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
    }
}

pub fn verify(unit: &StubUnit) -> Result<VerifiedUnit<'_>, VerifyError> {
    let mut frame = Frame::new(unit);
    for (pc, instr) in unit.code.iter().enumerate() {
        frame.pc = pc;
        if frame.step(*instr)? {
            return Ok(VerifiedUnit { unit });
        }
    }
    Err(VerifyError::FallsOffEnd {
        len: unit.code.len(),
    })
}
