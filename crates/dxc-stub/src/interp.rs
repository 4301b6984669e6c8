//! Interpreter for verified stub units.
//!
//! Arithmetic follows JVM/Dalvik rules: two's-complement wrapping, integer
//! division by zero faults, float-to-int conversion saturates with NaN
//! mapping to zero, float remainder truncates toward zero.

use crate::{
    BinaryOp, FailureKind, Fault, Instr, NanBias, NarrowKind, StubReference, StubUnit,
    VerifiedUnit,
};
use dxc_value::{Value, ValueKind};
use std::cmp::Ordering;
use std::fmt;

/// Deepest nesting of stub invocations before `stack_overflow` is raised.
pub const MAX_CALL_DEPTH: usize = 64;

/// Array elements one invocation may allocate before `out_of_memory`.
pub const HEAP_ELEMENT_BUDGET: usize = 1 << 20;

/// Resolves symbolic references on first use.
pub trait Linker {
    fn link(&self, reference: &StubReference) -> Result<VerifiedUnit<'_>, Fault>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentMismatch {
    pub expected: Vec<ValueKind>,
    pub actual: Vec<ValueKind>,
}

impl fmt::Display for ArgumentMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "argument kinds {:?} do not match parameters {:?}",
            self.actual, self.expected
        )
    }
}

impl std::error::Error for ArgumentMismatch {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The caller supplied arguments the entry point cannot accept.
    Arguments(ArgumentMismatch),
    /// The program raised a failure.
    Fault(Fault),
}

impl From<Fault> for ExecError {
    fn from(value: Fault) -> Self {
        Self::Fault(value)
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arguments(err) => write!(f, "{err}"),
            Self::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

impl std::error::Error for ExecError {}

pub fn check_arguments(unit: &StubUnit, args: &[Value]) -> Result<(), ArgumentMismatch> {
    let actual: Vec<ValueKind> = args.iter().map(Value::kind).collect();
    if actual != unit.params {
        return Err(ArgumentMismatch {
            expected: unit.params.clone(),
            actual,
        });
    }
    Ok(())
}

/// Runs `unit` with `args` on a fresh heap.
pub fn execute<'a>(
    unit: VerifiedUnit<'a>,
    args: &[Value],
    linker: &'a dyn Linker,
) -> Result<Value, ExecError> {
    check_arguments(unit.unit(), args).map_err(ExecError::Arguments)?;
    let mut machine = Machine {
        heap: Vec::new(),
        allocated: 0,
        linker,
    };
    let slots = args.iter().map(|arg| machine.allocate(arg)).collect();
    let result = machine.run(unit, slots, 1)?;
    match result {
        Some(slot) => Ok(machine.snapshot(&slot, &mut Vec::new())?),
        None => Ok(Value::Void),
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Str(String),
    Array(usize),
}

impl Slot {
    fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Null | Self::Str(_) | Self::Array(_) => ValueKind::Ref,
        }
    }
}

#[derive(Debug)]
struct HeapArray {
    elem: ValueKind,
    elements: Vec<Slot>,
}

struct Machine<'a> {
    heap: Vec<HeapArray>,
    allocated: usize,
    linker: &'a dyn Linker,
}

fn corrupt(detail: impl Into<String>) -> Fault {
    Fault::new(FailureKind::VerificationError, detail)
}

struct Operands {
    stack: Vec<Slot>,
}

impl Operands {
    fn pop(&mut self) -> Result<Slot, Fault> {
        self.stack
            .pop()
            .ok_or_else(|| corrupt("operand stack underflow"))
    }

    fn pop_kind(&mut self, kind: ValueKind) -> Result<Slot, Fault> {
        let slot = self.pop()?;
        if slot.kind() != kind {
            return Err(corrupt(format!(
                "expected {kind} operand, found {}",
                slot.kind()
            )));
        }
        Ok(slot)
    }

    fn pop_int(&mut self) -> Result<i32, Fault> {
        match self.pop_kind(ValueKind::Int)? {
            Slot::Int(v) => Ok(v),
            other => Err(corrupt(format!("expected int operand, found {}", other.kind()))),
        }
    }
}

impl<'a> Machine<'a> {
    fn allocate(&mut self, value: &Value) -> Slot {
        match value {
            Value::Int(v) => Slot::Int(*v),
            Value::Long(v) => Slot::Long(*v),
            Value::Float(v) => Slot::Float(*v),
            Value::Double(v) => Slot::Double(*v),
            Value::Void | Value::Null => Slot::Null,
            Value::Str(v) => Slot::Str(v.clone()),
            Value::Array { elem, elements } => {
                let elements = elements.iter().map(|e| self.allocate(e)).collect();
                self.heap.push(HeapArray {
                    elem: *elem,
                    elements,
                });
                Slot::Array(self.heap.len() - 1)
            }
        }
    }

    fn snapshot(&self, slot: &Slot, visiting: &mut Vec<usize>) -> Result<Value, Fault> {
        Ok(match slot {
            Slot::Int(v) => Value::Int(*v),
            Slot::Long(v) => Value::Long(*v),
            Slot::Float(v) => Value::Float(*v),
            Slot::Double(v) => Value::Double(*v),
            Slot::Null => Value::Null,
            Slot::Str(v) => Value::Str(v.clone()),
            Slot::Array(id) => {
                if visiting.contains(id) {
                    return Err(Fault::new(
                        FailureKind::StackOverflow,
                        "returned array graph is cyclic",
                    ));
                }
                let array = self.array(*id)?;
                visiting.push(*id);
                let elements = array
                    .elements
                    .iter()
                    .map(|e| self.snapshot(e, visiting))
                    .collect::<Result<Vec<_>, _>>()?;
                visiting.pop();
                Value::Array {
                    elem: array.elem,
                    elements,
                }
            }
        })
    }

    fn array(&self, id: usize) -> Result<&HeapArray, Fault> {
        self.heap
            .get(id)
            .ok_or_else(|| corrupt(format!("dangling array handle {id}")))
    }

    fn array_handle(&self, slot: &Slot, elem: Option<ValueKind>) -> Result<usize, Fault> {
        match slot {
            Slot::Null => Err(Fault::new(
                FailureKind::NullPointer,
                "array operation on null reference",
            )),
            Slot::Array(id) => {
                let array = self.array(*id)?;
                match elem {
                    Some(elem) if elem != array.elem => Err(Fault::new(
                        FailureKind::ClassCast,
                        format!("{}[] cannot be accessed as {elem}[]", array.elem),
                    )),
                    _ => Ok(*id),
                }
            }
            Slot::Str(_) => Err(Fault::new(
                FailureKind::ClassCast,
                "string cannot be accessed as an array",
            )),
            other => Err(corrupt(format!(
                "expected reference operand, found {}",
                other.kind()
            ))),
        }
    }

    fn element_index(&self, id: usize, index: i32) -> Result<usize, Fault> {
        let len = self.array(id)?.elements.len();
        match usize::try_from(index) {
            Ok(idx) if idx < len => Ok(idx),
            _ => Err(Fault::new(
                FailureKind::IndexOutOfBounds,
                format!("index {index} out of bounds for length {len}"),
            )),
        }
    }

    fn run(
        &mut self,
        verified: VerifiedUnit<'a>,
        args: Vec<Slot>,
        depth: usize,
    ) -> Result<Option<Slot>, Fault> {
        let unit = verified.unit();
        let mut locals = vec![Slot::Null; unit.local_count()];
        for (slot, arg) in locals.iter_mut().zip(args) {
            *slot = arg;
        }
        let mut ops = Operands {
            stack: Vec::with_capacity(usize::from(unit.max_stack)),
        };

        for instr in &unit.code {
            match *instr {
                Instr::Load { index, .. } => {
                    let slot = locals
                        .get(usize::from(index))
                        .cloned()
                        .ok_or_else(|| corrupt(format!("local {index} out of range")))?;
                    ops.stack.push(slot);
                }
                Instr::Store { kind, index } => {
                    let value = ops.pop_kind(kind)?;
                    let slot = locals
                        .get_mut(usize::from(index))
                        .ok_or_else(|| corrupt(format!("local {index} out of range")))?;
                    *slot = value;
                }
                Instr::PushInt { value } => ops.stack.push(Slot::Int(value)),
                Instr::Const { index } => {
                    let value = unit
                        .constants
                        .get(usize::from(index))
                        .ok_or_else(|| corrupt(format!("constant {index} out of range")))?;
                    let slot = self.allocate(value);
                    ops.stack.push(slot);
                }
                Instr::ConstNull => ops.stack.push(Slot::Null),
                Instr::Binary { kind, operator } => {
                    let rhs = if operator.is_shift() {
                        ops.pop_kind(ValueKind::Int)?
                    } else {
                        ops.pop_kind(kind)?
                    };
                    let lhs = ops.pop_kind(kind)?;
                    ops.stack.push(binary(operator, lhs, rhs)?);
                }
                Instr::Neg { kind } => {
                    let value = match ops.pop_kind(kind)? {
                        Slot::Int(v) => Slot::Int(v.wrapping_neg()),
                        Slot::Long(v) => Slot::Long(v.wrapping_neg()),
                        Slot::Float(v) => Slot::Float(-v),
                        Slot::Double(v) => Slot::Double(-v),
                        other => return Err(corrupt(format!("neg on {}", other.kind()))),
                    };
                    ops.stack.push(value);
                }
                Instr::Convert { from, to } => {
                    let value = ops.pop_kind(from)?;
                    ops.stack.push(convert(value, to)?);
                }
                Instr::Narrow { to } => {
                    let v = ops.pop_int()?;
                    let narrowed = match to {
                        NarrowKind::Byte => i32::from(v as i8),
                        NarrowKind::Char => i32::from(v as u16),
                        NarrowKind::Short => i32::from(v as i16),
                    };
                    ops.stack.push(Slot::Int(narrowed));
                }
                Instr::Cmp { kind, nan_bias } => {
                    let rhs = ops.pop_kind(kind)?;
                    let lhs = ops.pop_kind(kind)?;
                    let ordering = match (lhs, rhs) {
                        (Slot::Long(l), Slot::Long(r)) => Some(l.cmp(&r)),
                        (Slot::Float(l), Slot::Float(r)) => l.partial_cmp(&r),
                        (Slot::Double(l), Slot::Double(r)) => l.partial_cmp(&r),
                        _ => return Err(corrupt(format!("cmp on {kind}"))),
                    };
                    ops.stack.push(Slot::Int(compare_result(ordering, nan_bias)));
                }
                Instr::NewArray { elem } => {
                    let count = ops.pop_int()?;
                    let Ok(len) = usize::try_from(count) else {
                        return Err(Fault::new(
                            FailureKind::NegativeArraySize,
                            format!("array size {count}"),
                        ));
                    };
                    let remaining = HEAP_ELEMENT_BUDGET.saturating_sub(self.allocated);
                    if len > remaining {
                        return Err(Fault::new(
                            FailureKind::OutOfMemory,
                            format!("array size {count} exceeds heap budget of {remaining}"),
                        ));
                    }
                    self.allocated += len;
                    let elements = vec![self.allocate(&elem.default_value()); len];
                    self.heap.push(HeapArray { elem, elements });
                    ops.stack.push(Slot::Array(self.heap.len() - 1));
                }
                Instr::ArrayLoad { elem } => {
                    let index = ops.pop_int()?;
                    let array = ops.pop_kind(ValueKind::Ref)?;
                    let id = self.array_handle(&array, Some(elem))?;
                    let idx = self.element_index(id, index)?;
                    let value = self.array(id)?.elements[idx].clone();
                    ops.stack.push(value);
                }
                Instr::ArrayStore { elem } => {
                    let value = ops.pop_kind(elem)?;
                    let index = ops.pop_int()?;
                    let array = ops.pop_kind(ValueKind::Ref)?;
                    let id = self.array_handle(&array, Some(elem))?;
                    let idx = self.element_index(id, index)?;
                    self.heap[id].elements[idx] = value;
                }
                Instr::ArrayLength => {
                    let array = ops.pop_kind(ValueKind::Ref)?;
                    let id = self.array_handle(&array, None)?;
                    let len = self.array(id)?.elements.len();
                    let len = i32::try_from(len)
                        .map_err(|_| corrupt(format!("array length {len} exceeds int")))?;
                    ops.stack.push(Slot::Int(len));
                }
                Instr::Invoke { reference } => {
                    let target = unit
                        .references
                        .get(usize::from(reference))
                        .ok_or_else(|| corrupt(format!("reference {reference} out of range")))?;
                    if depth >= MAX_CALL_DEPTH {
                        return Err(Fault::new(
                            FailureKind::StackOverflow,
                            format!("call depth exceeds {MAX_CALL_DEPTH} at {}", target.target),
                        ));
                    }
                    let linker = self.linker;
                    let callee = linker.link(target)?;
                    let argc = target.params.len();
                    let split = ops
                        .stack
                        .len()
                        .checked_sub(argc)
                        .ok_or_else(|| corrupt("operand stack underflow"))?;
                    let args = ops.stack.split_off(split);
                    if let Some(result) = self.run(callee, args, depth + 1)? {
                        ops.stack.push(result);
                    }
                }
                Instr::Pop => {
                    ops.pop()?;
                }
                Instr::Dup => {
                    let top = ops.pop()?;
                    ops.stack.push(top.clone());
                    ops.stack.push(top);
                }
                Instr::Return { kind } => {
                    if kind == ValueKind::Void {
                        return Ok(None);
                    }
                    return ops.pop_kind(kind).map(Some);
                }
            }
        }
        Err(corrupt(format!("{} falls off the end of code", unit.name)))
    }
}

fn compare_result(ordering: Option<Ordering>, nan_bias: NanBias) -> i32 {
    match ordering {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => match nan_bias {
            NanBias::Less => -1,
            NanBias::Greater => 1,
        },
    }
}

fn divide_by_zero() -> Fault {
    Fault::new(FailureKind::ArithmeticFault, "/ by zero")
}

fn int_binary(operator: BinaryOp, lhs: i32, rhs: i32) -> Result<i32, Fault> {
    Ok(match operator {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::Div if rhs == 0 => return Err(divide_by_zero()),
        BinaryOp::Div => lhs.wrapping_div(rhs),
        BinaryOp::Rem if rhs == 0 => return Err(divide_by_zero()),
        BinaryOp::Rem => lhs.wrapping_rem(rhs),
        BinaryOp::Shl => lhs.wrapping_shl(rhs as u32),
        BinaryOp::Shr => lhs.wrapping_shr(rhs as u32),
        BinaryOp::Ushr => ((lhs as u32).wrapping_shr(rhs as u32)) as i32,
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
    })
}

fn long_binary(operator: BinaryOp, lhs: i64, rhs: i64) -> Result<i64, Fault> {
    Ok(match operator {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::Div if rhs == 0 => return Err(divide_by_zero()),
        BinaryOp::Div => lhs.wrapping_div(rhs),
        BinaryOp::Rem if rhs == 0 => return Err(divide_by_zero()),
        BinaryOp::Rem => lhs.wrapping_rem(rhs),
        BinaryOp::Shl => lhs.wrapping_shl(rhs as u32),
        BinaryOp::Shr => lhs.wrapping_shr(rhs as u32),
        BinaryOp::Ushr => ((lhs as u64).wrapping_shr(rhs as u32)) as i64,
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
    })
}

macro_rules! float_binary {
    ($name:ident, $ty:ty) => {
        fn $name(operator: BinaryOp, lhs: $ty, rhs: $ty) -> Result<$ty, Fault> {
            Ok(match operator {
                BinaryOp::Add => lhs + rhs,
                BinaryOp::Sub => lhs - rhs,
                BinaryOp::Mul => lhs * rhs,
                BinaryOp::Div => lhs / rhs,
                BinaryOp::Rem => lhs % rhs,
                other => return Err(corrupt(format!("{other:?} on floating operands"))),
            })
        }
    };
}

float_binary!(float_binary, f32);
float_binary!(double_binary, f64);

fn binary(operator: BinaryOp, lhs: Slot, rhs: Slot) -> Result<Slot, Fault> {
    Ok(match (lhs, rhs) {
        (Slot::Int(l), Slot::Int(r)) => Slot::Int(int_binary(operator, l, r)?),
        (Slot::Long(l), Slot::Long(r)) => Slot::Long(long_binary(operator, l, r)?),
        (Slot::Long(l), Slot::Int(r)) if operator.is_shift() => {
            Slot::Long(long_binary(operator, l, i64::from(r))?)
        }
        (Slot::Float(l), Slot::Float(r)) => Slot::Float(float_binary(operator, l, r)?),
        (Slot::Double(l), Slot::Double(r)) => Slot::Double(double_binary(operator, l, r)?),
        (l, r) => {
            return Err(corrupt(format!(
                "{operator:?} on {} and {}",
                l.kind(),
                r.kind()
            )));
        }
    })
}

fn convert(value: Slot, to: ValueKind) -> Result<Slot, Fault> {
    Ok(match (value, to) {
        (Slot::Int(v), ValueKind::Long) => Slot::Long(i64::from(v)),
        (Slot::Int(v), ValueKind::Float) => Slot::Float(v as f32),
        (Slot::Int(v), ValueKind::Double) => Slot::Double(f64::from(v)),
        (Slot::Long(v), ValueKind::Int) => Slot::Int(v as i32),
        (Slot::Long(v), ValueKind::Float) => Slot::Float(v as f32),
        (Slot::Long(v), ValueKind::Double) => Slot::Double(v as f64),
        (Slot::Float(v), ValueKind::Int) => Slot::Int(v as i32),
        (Slot::Float(v), ValueKind::Long) => Slot::Long(v as i64),
        (Slot::Float(v), ValueKind::Double) => Slot::Double(f64::from(v)),
        (Slot::Double(v), ValueKind::Int) => Slot::Int(v as i32),
        (Slot::Double(v), ValueKind::Long) => Slot::Long(v as i64),
        (Slot::Double(v), ValueKind::Float) => Slot::Float(v as f32),
        (value, to) => {
            return Err(corrupt(format!(
                "no conversion from {} to {to}",
                value.kind()
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{ExecError, HEAP_ELEMENT_BUDGET, Linker, MAX_CALL_DEPTH, execute};
    use crate::{
        BinaryOp, FailureKind, Fault, Instr, NanBias, OperationTemplate, StubBuilder,
        StubReference, StubUnit, VerifiedUnit, verify,
    };
    use dxc_value::{Value, ValueKind};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapLinker {
        units: BTreeMap<String, StubUnit>,
    }

    impl Linker for MapLinker {
        fn link(&self, reference: &StubReference) -> Result<VerifiedUnit<'_>, Fault> {
            let unit = self.units.get(&reference.target).ok_or_else(|| {
                Fault::new(FailureKind::NoClassDefFound, reference.target.clone())
            })?;
            verify(unit).map_err(|err| Fault::new(err.failure_kind(), err.to_string()))
        }
    }

    fn run(unit: &StubUnit, args: &[Value]) -> Result<Value, ExecError> {
        let linker = MapLinker::default();
        let verified = verify(unit).expect("unit verifies");
        execute(verified, args, &linker)
    }

    fn binary_template(kind: ValueKind, operator: BinaryOp) -> StubUnit {
        OperationTemplate {
            params: vec![kind, kind],
            instr: Instr::Binary { kind, operator },
            returns: kind,
        }
        .build("t")
    }

    fn fault_kind(result: Result<Value, ExecError>) -> FailureKind {
        match result {
            Err(ExecError::Fault(fault)) => fault.kind,
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn int_division_edge_cases() {
        let div = binary_template(ValueKind::Int, BinaryOp::Div);
        let rem = binary_template(ValueKind::Int, BinaryOp::Rem);
        assert_eq!(
            run(&div, &[Value::Int(i32::MIN), Value::Int(-1)]),
            Ok(Value::Int(i32::MIN))
        );
        assert_eq!(
            run(&rem, &[Value::Int(i32::MIN), Value::Int(-1)]),
            Ok(Value::Int(0))
        );
        assert_eq!(run(&rem, &[Value::Int(-10), Value::Int(3)]), Ok(Value::Int(-1)));
        assert_eq!(
            fault_kind(run(&rem, &[Value::Int(10), Value::Int(0)])),
            FailureKind::ArithmeticFault
        );
    }

    #[test]
    fn long_division_by_zero_faults() {
        let div = binary_template(ValueKind::Long, BinaryOp::Div);
        assert_eq!(
            fault_kind(run(&div, &[Value::Long(1), Value::Long(0)])),
            FailureKind::ArithmeticFault
        );
    }

    #[test]
    fn double_remainder_follows_truncation() {
        let rem = binary_template(ValueKind::Double, BinaryOp::Rem);
        let nan = run(&rem, &[Value::Double(1.0), Value::Double(0.0)]).expect("no fault");
        assert!(nan.exact_eq(&Value::Double(f64::NAN)));
        assert_eq!(
            run(&rem, &[Value::Double(-5.0), Value::Double(3.0)]),
            Ok(Value::Double(-2.0))
        );
        let neg_zero = run(&rem, &[Value::Double(-0.0), Value::Double(1.0)]).expect("no fault");
        assert!(neg_zero.exact_eq(&Value::Double(-0.0)));
    }

    #[test]
    fn narrowing_and_saturating_conversions() {
        let d2f = OperationTemplate {
            params: vec![ValueKind::Double],
            instr: Instr::Convert {
                from: ValueKind::Double,
                to: ValueKind::Float,
            },
            returns: ValueKind::Float,
        }
        .build("t");
        assert_eq!(
            run(&d2f, &[Value::Double(f64::MAX)]),
            Ok(Value::Float(f32::INFINITY))
        );
        let d2i = OperationTemplate {
            params: vec![ValueKind::Double],
            instr: Instr::Convert {
                from: ValueKind::Double,
                to: ValueKind::Int,
            },
            returns: ValueKind::Int,
        }
        .build("t");
        assert_eq!(run(&d2i, &[Value::Double(f64::NAN)]), Ok(Value::Int(0)));
        assert_eq!(run(&d2i, &[Value::Double(1e20)]), Ok(Value::Int(i32::MAX)));
    }

    #[test]
    fn float_compare_honours_nan_bias() {
        for (bias, expected) in [(NanBias::Less, -1), (NanBias::Greater, 1)] {
            let unit = OperationTemplate {
                params: vec![ValueKind::Double, ValueKind::Double],
                instr: Instr::Cmp {
                    kind: ValueKind::Double,
                    nan_bias: bias,
                },
                returns: ValueKind::Int,
            }
            .build("t");
            assert_eq!(
                run(&unit, &[Value::Double(f64::NAN), Value::Double(1.0)]),
                Ok(Value::Int(expected))
            );
            assert_eq!(
                run(&unit, &[Value::Double(-0.0), Value::Double(0.0)]),
                Ok(Value::Int(0))
            );
        }
    }

    #[test]
    fn array_load_checks_null_and_bounds() {
        let aaload = OperationTemplate {
            params: vec![ValueKind::Ref, ValueKind::Int],
            instr: Instr::ArrayLoad {
                elem: ValueKind::Ref,
            },
            returns: ValueKind::Ref,
        }
        .build("t");
        let arr = Value::array(ValueKind::Ref, vec![Value::str("a"), Value::str("b")]);
        assert_eq!(run(&aaload, &[arr.clone(), Value::Int(1)]), Ok(Value::str("b")));
        assert_eq!(
            fault_kind(run(&aaload, &[Value::Null, Value::Int(0)])),
            FailureKind::NullPointer
        );
        assert_eq!(
            fault_kind(run(&aaload, &[arr.clone(), Value::Int(2)])),
            FailureKind::IndexOutOfBounds
        );
        assert_eq!(
            fault_kind(run(&aaload, &[arr, Value::Int(-1)])),
            FailureKind::IndexOutOfBounds
        );
        let ints = Value::array(ValueKind::Int, vec![Value::Int(1)]);
        assert_eq!(
            fault_kind(run(&aaload, &[ints, Value::Int(0)])),
            FailureKind::ClassCast
        );
    }

    #[test]
    fn new_array_rejects_negative_size_and_stores_round_trip() {
        let unit = StubBuilder::new("t")
            .param(ValueKind::Int)
            .returns(ValueKind::Ref)
            .locals(1)
            .ops([
                Instr::Load {
                    kind: ValueKind::Int,
                    index: 0,
                },
                Instr::NewArray {
                    elem: ValueKind::Long,
                },
                Instr::Store {
                    kind: ValueKind::Ref,
                    index: 1,
                },
                Instr::Load {
                    kind: ValueKind::Ref,
                    index: 1,
                },
                Instr::PushInt { value: 0 },
                Instr::Const { index: 0 },
                Instr::ArrayStore {
                    elem: ValueKind::Long,
                },
                Instr::Load {
                    kind: ValueKind::Ref,
                    index: 1,
                },
                Instr::Return {
                    kind: ValueKind::Ref,
                },
            ])
            .constant(Value::Long(7))
            .build();
        assert_eq!(
            run(&unit, &[Value::Int(2)]),
            Ok(Value::array(
                ValueKind::Long,
                vec![Value::Long(7), Value::Long(0)]
            ))
        );
        assert_eq!(
            fault_kind(run(&unit, &[Value::Int(-1)])),
            FailureKind::NegativeArraySize
        );
    }

    #[test]
    fn new_array_beyond_heap_budget_is_out_of_memory() {
        let unit = OperationTemplate {
            params: vec![ValueKind::Int],
            instr: Instr::NewArray {
                elem: ValueKind::Int,
            },
            returns: ValueKind::Ref,
        }
        .build("t");
        assert_eq!(
            fault_kind(run(&unit, &[Value::Int(i32::MAX)])),
            FailureKind::OutOfMemory
        );
        let over = i32::try_from(HEAP_ELEMENT_BUDGET + 1).expect("budget fits in int");
        assert_eq!(
            fault_kind(run(&unit, &[Value::Int(over)])),
            FailureKind::OutOfMemory
        );
        assert_eq!(
            run(&unit, &[Value::Int(3)]),
            Ok(Value::array(ValueKind::Int, vec![Value::Int(0); 3]))
        );
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let unit = StubBuilder::new("dxc.support.Recurse")
            .returns(ValueKind::Int)
            .reference(StubReference::new(
                "dxc.support.Recurse",
                Vec::new(),
                ValueKind::Int,
            ))
            .ops([
                Instr::Invoke { reference: 0 },
                Instr::Return {
                    kind: ValueKind::Int,
                },
            ])
            .build();
        let mut linker = MapLinker::default();
        linker.units.insert(unit.name.clone(), unit.clone());
        let verified = verify(&unit).expect("verifies");
        let result = execute(verified, &[], &linker);
        assert_eq!(fault_kind(result), FailureKind::StackOverflow);
        assert!(MAX_CALL_DEPTH > 1);
    }

    #[test]
    fn wrong_argument_kinds_are_not_faults() {
        let unit = binary_template(ValueKind::Int, BinaryOp::Add);
        assert!(matches!(
            run(&unit, &[Value::Int(1)]),
            Err(ExecError::Arguments(_))
        ));
    }
}
