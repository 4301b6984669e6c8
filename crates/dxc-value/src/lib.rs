#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operand kinds understood by stub programs.
///
/// Every reference-like runtime value (strings, arrays, null) shares the
/// `Ref` kind; the verifier never distinguishes between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Void,
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ValueKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Ref => "ref",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "void" | "V" => Some(Self::Void),
            "int" | "I" | "i32" => Some(Self::Int),
            "long" | "J" | "i64" => Some(Self::Long),
            "float" | "F" | "f32" => Some(Self::Float),
            "double" | "D" | "f64" => Some(Self::Double),
            "ref" | "object" | "str" | "array" | "null" => Some(Self::Ref),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Zero value a freshly allocated array slot holds.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            Self::Void => Value::Void,
            Self::Int => Value::Int(0),
            Self::Long => Value::Long(0),
            Self::Float => Value::Float(0.0),
            Self::Double => Value::Double(0.0),
            Self::Ref => Value::Null,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value passed into or returned from a stub program.
///
/// The derived `PartialEq` follows IEEE semantics for floats. Scenario
/// verification never uses it directly; see [`Value::matches`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ValueLiteral", into = "ValueLiteral")]
pub enum Value {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Str(String),
    Array { elem: ValueKind, elements: Vec<Value> },
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Void => ValueKind::Void,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Null | Self::Str(_) | Self::Array { .. } => ValueKind::Ref,
        }
    }

    #[must_use]
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    #[must_use]
    pub fn array(elem: ValueKind, elements: Vec<Value>) -> Self {
        Self::Array { elem, elements }
    }

    /// Identity comparison: `-0.0` differs from `0.0`, every NaN equals
    /// every other NaN, infinities compare by sign.
    #[must_use]
    pub fn exact_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(lhs), Self::Float(rhs)) => {
                (lhs.is_nan() && rhs.is_nan()) || lhs.to_bits() == rhs.to_bits()
            }
            (Self::Double(lhs), Self::Double(rhs)) => {
                (lhs.is_nan() && rhs.is_nan()) || lhs.to_bits() == rhs.to_bits()
            }
            (
                Self::Array {
                    elem: lhs_elem,
                    elements: lhs,
                },
                Self::Array {
                    elem: rhs_elem,
                    elements: rhs,
                },
            ) => {
                lhs_elem == rhs_elem
                    && lhs.len() == rhs.len()
                    && lhs.iter().zip(rhs).all(|(l, r)| l.exact_eq(r))
            }
            _ => self == other,
        }
    }

    /// IEEE comparison: NaN never equals anything, `-0.0 == 0.0`.
    #[must_use]
    pub fn numeric_eq(&self, other: &Self) -> bool {
        self == other
    }

    #[must_use]
    pub fn matches(&self, other: &Self, comparison: ValueComparison) -> bool {
        match comparison {
            ValueComparison::Exact => self.exact_eq(other),
            ValueComparison::Numeric => self.numeric_eq(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Int(v) => write!(f, "int({v})"),
            Self::Long(v) => write!(f, "long({v})"),
            Self::Float(v) => write!(f, "float({})", render_f32(*v)),
            Self::Double(v) => write!(f, "double({})", render_f64(*v)),
            Self::Null => f.write_str("null"),
            Self::Str(v) => write!(f, "str({v:?})"),
            Self::Array { elem, elements } => {
                write!(f, "array<{elem}>[")?;
                for (idx, element) in elements.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str("]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueComparison {
    #[default]
    Exact,
    Numeric,
}

impl ValueComparison {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Numeric => "numeric",
        }
    }
}

/// Fixture form of a [`Value`].
///
/// Floats travel as text so that NaN, infinities and signed zero survive
/// JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueLiteral {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elem: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<ValueLiteral>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiteralError {
    UnknownKind(String),
    MissingLiteral { kind: String },
    Unparseable { kind: String, literal: String },
    ElementKindMismatch { elem: ValueKind, actual: ValueKind },
}

impl fmt::Display for LiteralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind(kind) => write!(f, "unknown value kind '{kind}'"),
            Self::MissingLiteral { kind } => write!(f, "{kind} value requires a literal"),
            Self::Unparseable { kind, literal } => {
                write!(f, "cannot parse '{literal}' as {kind}")
            }
            Self::ElementKindMismatch { elem, actual } => {
                write!(f, "array<{elem}> cannot hold a {actual} element")
            }
        }
    }
}

impl std::error::Error for LiteralError {}

impl TryFrom<ValueLiteral> for Value {
    type Error = LiteralError;

    fn try_from(lit: ValueLiteral) -> Result<Self, Self::Error> {
        let kind = lit.kind.trim();
        fn required<'l>(lit: &'l ValueLiteral, kind: &str) -> Result<&'l str, LiteralError> {
            lit.literal
                .as_deref()
                .map(str::trim)
                .ok_or_else(|| LiteralError::MissingLiteral {
                    kind: kind.to_string(),
                })
        }
        let unparseable = |raw: &str| LiteralError::Unparseable {
            kind: kind.to_string(),
            literal: raw.to_string(),
        };

        match kind {
            "void" => Ok(Self::Void),
            "null" => Ok(Self::Null),
            "int" => {
                let raw = required(&lit, kind)?;
                parse_i32_literal(raw)
                    .map(Self::Int)
                    .ok_or_else(|| unparseable(raw))
            }
            "long" => {
                let raw = required(&lit, kind)?;
                parse_i64_literal(raw)
                    .map(Self::Long)
                    .ok_or_else(|| unparseable(raw))
            }
            "float" => {
                let raw = required(&lit, kind)?;
                parse_f32_literal(raw)
                    .map(Self::Float)
                    .ok_or_else(|| unparseable(raw))
            }
            "double" => {
                let raw = required(&lit, kind)?;
                parse_f64_literal(raw)
                    .map(Self::Double)
                    .ok_or_else(|| unparseable(raw))
            }
            // strings keep surrounding whitespace
            "str" => lit
                .literal
                .clone()
                .map(Self::Str)
                .ok_or_else(|| LiteralError::MissingLiteral {
                    kind: kind.to_string(),
                }),
            "array" => {
                let elem_raw = lit.elem.as_deref().unwrap_or("ref");
                let elem = ValueKind::parse(elem_raw)
                    .filter(|elem| *elem != ValueKind::Void)
                    .ok_or_else(|| LiteralError::UnknownKind(elem_raw.to_string()))?;
                let mut elements = Vec::with_capacity(lit.elements.len());
                for element in lit.elements {
                    let value = Self::try_from(element)?;
                    if value.kind() != elem {
                        return Err(LiteralError::ElementKindMismatch {
                            elem,
                            actual: value.kind(),
                        });
                    }
                    elements.push(value);
                }
                Ok(Self::Array { elem, elements })
            }
            other => Err(LiteralError::UnknownKind(other.to_string())),
        }
    }
}

impl From<Value> for ValueLiteral {
    fn from(value: Value) -> Self {
        let scalar = |kind: &str, literal: String| ValueLiteral {
            kind: kind.to_string(),
            literal: Some(literal),
            elem: None,
            elements: Vec::new(),
        };
        match value {
            Value::Void => ValueLiteral {
                kind: "void".to_string(),
                literal: None,
                elem: None,
                elements: Vec::new(),
            },
            Value::Null => ValueLiteral {
                kind: "null".to_string(),
                literal: None,
                elem: None,
                elements: Vec::new(),
            },
            Value::Int(v) => scalar("int", v.to_string()),
            Value::Long(v) => scalar("long", v.to_string()),
            Value::Float(v) => scalar("float", render_f32(v)),
            Value::Double(v) => scalar("double", render_f64(v)),
            Value::Str(v) => scalar("str", v),
            Value::Array { elem, elements } => ValueLiteral {
                kind: "array".to_string(),
                literal: None,
                elem: Some(elem.name().to_string()),
                elements: elements.into_iter().map(ValueLiteral::from).collect(),
            },
        }
    }
}

#[must_use]
pub fn parse_i32_literal(raw: &str) -> Option<i32> {
    match raw {
        "MIN" => Some(i32::MIN),
        "MAX" => Some(i32::MAX),
        other => other.parse().ok(),
    }
}

#[must_use]
pub fn parse_i64_literal(raw: &str) -> Option<i64> {
    match raw {
        "MIN" => Some(i64::MIN),
        "MAX" => Some(i64::MAX),
        other => other.parse().ok(),
    }
}

/// `MIN` is the smallest positive subnormal, not the most negative value.
#[must_use]
pub fn parse_f32_literal(raw: &str) -> Option<f32> {
    match raw {
        "NaN" => Some(f32::NAN),
        "Infinity" | "+Infinity" => Some(f32::INFINITY),
        "-Infinity" => Some(f32::NEG_INFINITY),
        "MAX" => Some(f32::MAX),
        "-MAX" => Some(-f32::MAX),
        "MIN" => Some(f32::from_bits(1)),
        "-MIN" => Some(-f32::from_bits(1)),
        "MIN_NORMAL" => Some(f32::MIN_POSITIVE),
        other => other.parse().ok(),
    }
}

/// `MIN` is the smallest positive subnormal, not the most negative value.
#[must_use]
pub fn parse_f64_literal(raw: &str) -> Option<f64> {
    match raw {
        "NaN" => Some(f64::NAN),
        "Infinity" | "+Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        "MAX" => Some(f64::MAX),
        "-MAX" => Some(-f64::MAX),
        "MIN" => Some(f64::from_bits(1)),
        "-MIN" => Some(-f64::from_bits(1)),
        "MIN_NORMAL" => Some(f64::MIN_POSITIVE),
        other => other.parse().ok(),
    }
}

fn render_f32(v: f32) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{v:?}")
    }
}

fn render_f64(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{v:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::{
        LiteralError, Value, ValueComparison, ValueKind, ValueLiteral, parse_f32_literal,
        parse_f64_literal, parse_i32_literal,
    };

    fn literal(kind: &str, raw: &str) -> ValueLiteral {
        ValueLiteral {
            kind: kind.to_string(),
            literal: Some(raw.to_string()),
            elem: None,
            elements: Vec::new(),
        }
    }

    #[test]
    fn signed_zero_is_distinguished_only_by_exact_comparison() {
        let pos = Value::Double(0.0);
        let neg = Value::Double(-0.0);
        assert!(!pos.exact_eq(&neg));
        assert!(pos.numeric_eq(&neg));

        let pos = Value::Float(0.0);
        let neg = Value::Float(-0.0);
        assert!(!pos.matches(&neg, ValueComparison::Exact));
        assert!(pos.matches(&neg, ValueComparison::Numeric));
    }

    #[test]
    fn nan_equals_itself_only_under_exact_comparison() {
        let nan = Value::Double(f64::NAN);
        let other_nan = Value::Double(f64::from_bits(0x7ff8_0000_0000_0001));
        assert!(nan.exact_eq(&other_nan));
        assert!(!nan.numeric_eq(&nan));
        assert!(!Value::Float(f32::NAN).numeric_eq(&Value::Float(f32::NAN)));
    }

    #[test]
    fn infinities_compare_by_sign() {
        let pos = Value::Double(f64::INFINITY);
        let neg = Value::Double(f64::NEG_INFINITY);
        assert!(pos.exact_eq(&Value::Double(f64::INFINITY)));
        assert!(!pos.exact_eq(&neg));
        assert!(!pos.exact_eq(&Value::Double(f64::MAX)));
    }

    #[test]
    fn float_and_double_never_match_each_other() {
        assert!(!Value::Float(1.0).exact_eq(&Value::Double(1.0)));
        assert!(!Value::Int(1).numeric_eq(&Value::Long(1)));
    }

    #[test]
    fn special_float_literals_parse() {
        assert!(parse_f64_literal("NaN").is_some_and(f64::is_nan));
        assert_eq!(parse_f64_literal("MAX"), Some(f64::MAX));
        assert_eq!(parse_f64_literal("MIN"), Some(f64::from_bits(1)));
        assert_eq!(parse_f32_literal("-Infinity"), Some(f32::NEG_INFINITY));
        let neg_zero = parse_f64_literal("-0.0").expect("negative zero parses");
        assert!(neg_zero == 0.0 && neg_zero.is_sign_negative());
        assert_eq!(parse_i32_literal("MIN"), Some(i32::MIN));
        assert_eq!(parse_i32_literal("12x"), None);
    }

    #[test]
    fn literal_conversion_rejects_bad_input() {
        assert_eq!(
            Value::try_from(literal("int", "3.5")),
            Err(LiteralError::Unparseable {
                kind: "int".to_string(),
                literal: "3.5".to_string(),
            })
        );
        assert_eq!(
            Value::try_from(literal("quad", "1")),
            Err(LiteralError::UnknownKind("quad".to_string()))
        );

        let mixed = ValueLiteral {
            kind: "array".to_string(),
            literal: None,
            elem: Some("int".to_string()),
            elements: vec![literal("int", "1"), literal("double", "2.0")],
        };
        assert_eq!(
            Value::try_from(mixed),
            Err(LiteralError::ElementKindMismatch {
                elem: ValueKind::Int,
                actual: ValueKind::Double,
            })
        );
    }

    #[test]
    fn scalar_literals_are_trimmed_and_required() {
        assert_eq!(
            Value::try_from(literal(" long ", "  MAX ")),
            Ok(Value::Long(i64::MAX))
        );
        for kind in ["int", "long", "float", "double"] {
            let bare = ValueLiteral {
                kind: kind.to_string(),
                literal: None,
                elem: None,
                elements: Vec::new(),
            };
            assert_eq!(
                Value::try_from(bare),
                Err(LiteralError::MissingLiteral {
                    kind: kind.to_string(),
                })
            );
        }
    }

    #[test]
    fn values_deserialize_from_fixture_json() {
        let raw = r#"[
            {"kind":"double","literal":"-0.0"},
            {"kind":"float","literal":"Infinity"},
            {"kind":"array","elem":"ref","elements":[
                {"kind":"str","literal":"a"},
                {"kind":"null"}
            ]}
        ]"#;
        let values: Vec<Value> = serde_json::from_str(raw).expect("fixture values parse");
        assert!(values[0].exact_eq(&Value::Double(-0.0)));
        assert!(values[1].exact_eq(&Value::Float(f32::INFINITY)));
        assert_eq!(
            values[2],
            Value::array(ValueKind::Ref, vec![Value::str("a"), Value::Null])
        );
    }

    #[test]
    fn nan_survives_json_serialization() {
        let raw = serde_json::to_string(&Value::Double(f64::NAN)).expect("serialize");
        assert!(raw.contains("NaN"));
        let back: Value = serde_json::from_str(&raw).expect("deserialize");
        assert!(back.exact_eq(&Value::Double(f64::NAN)));
    }

    #[test]
    fn display_renders_kinds() {
        assert_eq!(Value::Int(-1).to_string(), "int(-1)");
        assert_eq!(Value::Double(f64::NEG_INFINITY).to_string(), "double(-Infinity)");
        assert_eq!(
            Value::array(ValueKind::Ref, vec![Value::str("a")]).to_string(),
            "array<ref>[str(\"a\")]"
        );
    }

    #[test]
    fn kind_aliases_parse() {
        assert_eq!(ValueKind::parse("J"), Some(ValueKind::Long));
        assert_eq!(ValueKind::parse("array"), Some(ValueKind::Ref));
        assert_eq!(ValueKind::parse("bool"), None);
        assert_eq!(ValueKind::Double.default_value(), Value::Double(0.0));
    }
}
