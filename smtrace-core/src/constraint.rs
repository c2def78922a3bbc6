//! Guard constraints and their verdicts.
//!
//! A guard is a conjunction of constraints written as:
//!
//! - `x > 10` - compare a variable (or numeric event field) with a constant
//! - `deadline/t < 10ms` - constants may carry a `ns`, `us`, `ms` or `s` unit
//!   (normalized to nanoseconds) or a `%` suffix
//! - `field/a <= $field/b` - compare with another variable
//! - `latency < ?` - adaptive threshold, learned once the stream has ended
//! - `latency ? 100` / `latency ? ?` - adaptive operator (and threshold)
//! - `a > 1 && b < 2` - several constraints, evaluated in order
//!
//! Static constraints are decided as soon as they are verified. Adaptive
//! ones record a sample in the group's [`AdaptiveRegistry`] and return a
//! deferred verdict whose status is derived from the slot's decision.

use crate::adaptive::{AdaptiveSlot, Decision};
use crate::error::CoreError;
use crate::event::TraceEvent;
use crate::instance::{EvalContext, Instance};
use crate::variable::VariableKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Verdict status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusValue {
    /// Adaptive constraint not decided yet.
    Pending,
    Valid,
    /// Could not be evaluated.
    Uncertain,
    Invalid,
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusValue::Pending => "PENDING",
            StatusValue::Valid => "VALID",
            StatusValue::Uncertain => "UNCERTAIN",
            StatusValue::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Worst of two statuses. `Pending` is the identity.
pub fn worst_status(a: StatusValue, b: StatusValue) -> StatusValue {
    a.max(b)
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Operator to be learned.
    Adaptive,
}

/// Side of the threshold a satisfying value lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Over,
    Under,
    Equal,
    Unknown,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Adaptive => "?",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Operator::Gt | Operator::Ge => Direction::Over,
            Operator::Lt | Operator::Le => Direction::Under,
            Operator::Eq => Direction::Equal,
            Operator::Ne | Operator::Adaptive => Direction::Unknown,
        }
    }

    /// Strict operators exclude the threshold itself.
    pub fn is_strict(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Lt)
    }

    /// Compares `left` with `right`; `None` for the adaptive operator.
    pub fn holds(&self, left: f64, right: f64) -> Option<bool> {
        let eq = approx_eq(left, right);
        let result = match self {
            Operator::Eq => eq,
            Operator::Ne => !eq,
            Operator::Gt => left > right && !eq,
            Operator::Ge => left > right || eq,
            Operator::Lt => left < right && !eq,
            Operator::Le => left < right || eq,
            Operator::Adaptive => return None,
        };
        Some(result)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= f64::EPSILON * scale
}

/// Unit a constant was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    None,
    Nanos,
    Micros,
    Millis,
    Seconds,
    Percent,
}

impl Unit {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "" => Some(Unit::None),
            "ns" => Some(Unit::Nanos),
            "us" => Some(Unit::Micros),
            "ms" => Some(Unit::Millis),
            "s" => Some(Unit::Seconds),
            "%" => Some(Unit::Percent),
            _ => None,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Nanos => "ns",
            Unit::Micros => "us",
            Unit::Millis => "ms",
            Unit::Seconds => "s",
            Unit::Percent => "%",
        }
    }

    /// Multiplier to the normalized value.
    fn factor(&self) -> f64 {
        match self {
            Unit::Micros => 1e3,
            Unit::Millis => 1e6,
            Unit::Seconds => 1e9,
            Unit::None | Unit::Nanos | Unit::Percent => 1.0,
        }
    }
}

/// Right-hand side of a constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Normalized constant and the unit it was declared with.
    Constant { value: f64, unit: Unit },
    /// Current value of another variable.
    Variable(String),
    /// Value to be learned.
    Adaptive,
}

impl Operand {
    pub fn constant(value: f64) -> Self {
        Operand::Constant {
            value,
            unit: Unit::None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Constant { value, unit } => {
                write!(f, "{}{}", value / unit.factor(), unit.suffix())
            }
            Operand::Variable(name) => write!(f, "${}", name),
            Operand::Adaptive => f.write_str("?"),
        }
    }
}

/// Identity of a constraint within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintId(pub u64);

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single guard constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    id: ConstraintId,
    variable: String,
    operator: Operator,
    operand: Operand,
}

impl Constraint {
    pub fn new(variable: impl Into<String>, operator: Operator, operand: Operand) -> Self {
        Self {
            id: ConstraintId(0),
            variable: variable.into(),
            operator,
            operand,
        }
    }

    pub fn with_id(mut self, id: ConstraintId) -> Self {
        self.id = id;
        self
    }

    /// Parses a guard expression into its constraints.
    pub fn parse_guard(s: &str) -> Result<Vec<Constraint>, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        Parser::new(s).parse_conjunction()
    }

    pub fn id(&self) -> ConstraintId {
        self.id
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    pub fn is_adaptive(&self) -> bool {
        self.operator == Operator::Adaptive || self.operand == Operand::Adaptive
    }

    /// Whether the constrained variable only takes integer values.
    pub fn is_discrete(&self) -> bool {
        VariableKind::from_name(&self.variable).is_some_and(|kind| kind.is_counter())
    }

    /// Value an adaptive strategy compares the samples with, if known.
    pub(crate) fn reference_value(&self) -> Option<f64> {
        match &self.operand {
            Operand::Constant { value, .. } => Some(*value),
            // Variable operands are sampled as differences
            Operand::Variable(_) => Some(0.0),
            Operand::Adaptive => None,
        }
    }

    /// Verifies the constraint for `instance` receiving `event`.
    pub fn verify(
        self: &Arc<Self>,
        instance: &Instance,
        event: &TraceEvent,
        ctx: &mut EvalContext<'_>,
    ) -> Verdict {
        let left = instance.value_of(&self.variable, event, ctx.backend);
        let right = match &self.operand {
            Operand::Constant { value, .. } => Some(*value),
            Operand::Variable(name) => instance.value_of(name, event, ctx.backend),
            Operand::Adaptive => None,
        };

        if self.is_adaptive() {
            let slot = ctx.adaptive.slot_for(self);
            let sample = match (&self.operand, left, right) {
                (Operand::Variable(_), Some(l), Some(r)) => Some(l - r),
                (Operand::Variable(_), _, _) => None,
                (_, l, _) => l,
            };
            if let Some(sample) = sample {
                slot.record(sample);
            }
            return Verdict {
                constraint: Arc::clone(self),
                outcome: Outcome::Deferred { sample, slot },
            };
        }

        let status = match (left, right) {
            (Some(l), Some(r)) => match self.operator.holds(l, r) {
                Some(true) => StatusValue::Valid,
                Some(false) => StatusValue::Invalid,
                None => StatusValue::Uncertain,
            },
            _ => StatusValue::Uncertain,
        };

        Verdict {
            constraint: Arc::clone(self),
            outcome: Outcome::Decided {
                status,
                actual: left,
            },
        }
    }

    /// Human-readable form, with the learned operator and threshold when
    /// a decision is available.
    pub fn label(&self, decision: Option<&Decision>) -> String {
        let Some(decision) = decision else {
            return self.to_string();
        };

        let threshold = if self.is_discrete() {
            match decision.operator {
                Operator::Ge | Operator::Lt => decision.threshold.ceil(),
                Operator::Gt | Operator::Le => decision.threshold.floor(),
                _ => decision.threshold,
            }
        } else {
            decision.threshold
        };

        match &self.operand {
            Operand::Variable(name) => format!(
                "{} - ${} {} {}",
                self.variable, name, decision.operator, threshold
            ),
            _ => format!("{} {} {}", self.variable, decision.operator, threshold),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.variable, self.operator, self.operand)
    }
}

/// How a verdict was (or will be) decided.
#[derive(Debug, Clone)]
pub enum Outcome {
    Decided {
        status: StatusValue,
        actual: Option<f64>,
    },
    /// Adaptive verdict; the status follows the slot's decision.
    Deferred {
        sample: Option<f64>,
        slot: Arc<AdaptiveSlot>,
    },
}

/// Result of verifying one constraint at one step.
#[derive(Debug, Clone)]
pub struct Verdict {
    constraint: Arc<Constraint>,
    outcome: Outcome,
}

impl Verdict {
    pub fn decided(constraint: Arc<Constraint>, status: StatusValue, actual: Option<f64>) -> Self {
        Self {
            constraint,
            outcome: Outcome::Decided { status, actual },
        }
    }

    pub fn constraint(&self) -> &Arc<Constraint> {
        &self.constraint
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn status(&self) -> StatusValue {
        match &self.outcome {
            Outcome::Decided { status, .. } => *status,
            Outcome::Deferred {
                sample: Some(sample),
                slot,
            } => slot.status_of(*sample),
            Outcome::Deferred { sample: None, .. } => StatusValue::Uncertain,
        }
    }

    /// Value read for the constrained variable.
    pub fn actual(&self) -> Option<f64> {
        match &self.outcome {
            Outcome::Decided { actual, .. } => *actual,
            Outcome::Deferred { sample, .. } => *sample,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.outcome, Outcome::Deferred { .. })
    }

    pub fn can_be_used(&self) -> bool {
        match &self.outcome {
            Outcome::Decided { .. } => true,
            Outcome::Deferred { slot, .. } => slot.can_be_used(),
        }
    }

    pub fn label(&self) -> String {
        match &self.outcome {
            Outcome::Decided { .. } => self.constraint.to_string(),
            Outcome::Deferred { slot, .. } => self.constraint.label(slot.decision()),
        }
    }
}

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_conjunction(&mut self) -> Result<Vec<Constraint>, CoreError> {
        let mut constraints = vec![self.parse_constraint()?];
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            constraints.push(self.parse_constraint()?);
            self.skip_whitespace();
        }

        if self.pos < self.input.len() {
            return Err(CoreError::InvalidGuard {
                reason: format!("unexpected input at '{}'", &self.input[self.pos..]),
            });
        }

        Ok(constraints)
    }

    fn parse_constraint(&mut self) -> Result<Constraint, CoreError> {
        self.skip_whitespace();
        let variable = self.parse_name()?;
        self.skip_whitespace();
        let operator = self.parse_operator()?;
        self.skip_whitespace();
        let operand = self.parse_operand()?;
        Ok(Constraint::new(variable, operator, operand))
    }

    fn parse_name(&mut self) -> Result<String, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '/' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let name = &self.input[start..self.pos];
        if name.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: format!("expected variable name at '{}'", &self.input[start..]),
            });
        }

        Ok(name.to_string())
    }

    fn parse_operator(&mut self) -> Result<Operator, CoreError> {
        const OPERATORS: [(&str, Operator); 7] = [
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            (">=", Operator::Ge),
            ("<=", Operator::Le),
            (">", Operator::Gt),
            ("<", Operator::Lt),
            ("?", Operator::Adaptive),
        ];

        for (symbol, operator) in OPERATORS {
            if self.peek_str(symbol) {
                self.pos += symbol.len();
                return Ok(operator);
            }
        }

        Err(CoreError::InvalidGuard {
            reason: format!("expected operator at '{}'", &self.input[self.pos..]),
        })
    }

    fn parse_operand(&mut self) -> Result<Operand, CoreError> {
        match self.peek_char() {
            Some('?') => {
                self.pos += 1;
                Ok(Operand::Adaptive)
            }
            Some('$') => {
                self.pos += 1;
                Ok(Operand::Variable(self.parse_name()?))
            }
            _ => {
                let number = self.parse_number()?;
                let unit = self.parse_unit()?;
                Ok(Operand::Constant {
                    value: number * unit.factor(),
                    unit,
                })
            }
        }
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();
        if self.peek_char() == Some('.') {
            self.pos += 1;
            self.skip_digits();
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| CoreError::InvalidGuard {
            reason: format!("invalid number: '{}'", num_str),
        })
    }

    fn parse_unit(&mut self) -> Result<Unit, CoreError> {
        let start = self.pos;
        if self.peek_char() == Some('%') {
            self.pos += 1;
        } else {
            while let Some(c) = self.peek_char() {
                if c.is_ascii_alphabetic() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let suffix = &self.input[start..self.pos];
        Unit::from_suffix(suffix).ok_or_else(|| CoreError::InvalidGuard {
            reason: format!("unknown unit: '{}'", suffix),
        })
    }

    fn skip_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [StatusValue; 4] = [
        StatusValue::Pending,
        StatusValue::Valid,
        StatusValue::Uncertain,
        StatusValue::Invalid,
    ];

    #[test]
    fn test_parse_simple() {
        let constraints = Constraint::parse_guard("x > 10").unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].variable(), "x");
        assert_eq!(constraints[0].operator(), Operator::Gt);
        assert_eq!(constraints[0].operand(), &Operand::constant(10.0));
        assert!(!constraints[0].is_adaptive());
    }

    #[test]
    fn test_parse_units() {
        let constraints = Constraint::parse_guard("deadline/t < 10ms").unwrap();
        match constraints[0].operand() {
            Operand::Constant { value, unit } => {
                assert_eq!(*value, 10_000_000.0);
                assert_eq!(*unit, Unit::Millis);
            }
            other => panic!("unexpected operand {:?}", other),
        }

        let constraints = Constraint::parse_guard("cputime/c >= 50%").unwrap();
        assert_eq!(
            constraints[0].operand(),
            &Operand::Constant {
                value: 50.0,
                unit: Unit::Percent
            }
        );

        assert!(Constraint::parse_guard("deadline/t < 10h").is_err());
    }

    #[test]
    fn test_parse_conjunction() {
        let constraints =
            Constraint::parse_guard("a == 1 && field/b != $field/c&&latency ? ?").unwrap();
        assert_eq!(constraints.len(), 3);
        assert_eq!(
            constraints[1].operand(),
            &Operand::Variable("field/c".to_string())
        );
        assert_eq!(constraints[2].operator(), Operator::Adaptive);
        assert_eq!(constraints[2].operand(), &Operand::Adaptive);
        assert!(constraints[2].is_adaptive());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Constraint::parse_guard("").is_err());
        assert!(Constraint::parse_guard("x").is_err());
        assert!(Constraint::parse_guard("x >").is_err());
        assert!(Constraint::parse_guard("> 3").is_err());
        assert!(Constraint::parse_guard("x > 3 ||").is_err());
        assert!(Constraint::parse_guard("x > 3 &&").is_err());
    }

    #[test]
    fn test_display_reparses() {
        for guard in [
            "x > 10",
            "deadline/t <= 1.5ms",
            "syscalls/n == 3",
            "field/a != $field/b",
            "latency < ?",
            "latency ? 250us",
            "v >= -2",
        ] {
            let parsed = Constraint::parse_guard(guard).unwrap();
            let shown = parsed[0].to_string();
            assert_eq!(shown, guard);
            let again = Constraint::parse_guard(&shown).unwrap();
            assert_eq!(again, parsed);
        }
    }

    #[test]
    fn test_operator_holds() {
        assert_eq!(Operator::Gt.holds(11.0, 10.0), Some(true));
        assert_eq!(Operator::Gt.holds(10.0, 10.0), Some(false));
        assert_eq!(Operator::Ge.holds(10.0, 10.0), Some(true));
        assert_eq!(Operator::Lt.holds(9.0, 10.0), Some(true));
        assert_eq!(Operator::Le.holds(11.0, 10.0), Some(false));
        assert_eq!(Operator::Eq.holds(0.1 + 0.2, 0.3), Some(true));
        assert_eq!(Operator::Ne.holds(1.0, 2.0), Some(true));
        assert_eq!(Operator::Adaptive.holds(1.0, 2.0), None);
    }

    #[test]
    fn test_worst_status_order() {
        assert_eq!(
            worst_status(StatusValue::Valid, StatusValue::Pending),
            StatusValue::Valid
        );
        assert_eq!(
            worst_status(StatusValue::Uncertain, StatusValue::Valid),
            StatusValue::Uncertain
        );
        for s in ALL_STATUSES {
            assert_eq!(worst_status(StatusValue::Invalid, s), StatusValue::Invalid);
            assert_eq!(worst_status(StatusValue::Pending, s), s);
        }
    }

    #[test]
    fn test_label_rounds_counters() {
        let constraint = Constraint::parse_guard("syscalls/n < ?").unwrap().remove(0);
        assert!(constraint.is_discrete());
        let decision = Decision {
            operator: Operator::Lt,
            threshold: 4.2,
        };
        assert_eq!(constraint.label(Some(&decision)), "syscalls/n < 5");
        assert_eq!(constraint.label(None), "syscalls/n < ?");
    }

    #[test]
    fn test_decided_verdict() {
        let constraint = Arc::new(Constraint::parse_guard("x > 10").unwrap().remove(0));
        let verdict = Verdict::decided(Arc::clone(&constraint), StatusValue::Invalid, Some(5.0));
        assert_eq!(verdict.status(), StatusValue::Invalid);
        assert_eq!(verdict.actual(), Some(5.0));
        assert!(verdict.can_be_used());
        assert!(!verdict.is_deferred());
        assert_eq!(verdict.label(), "x > 10");
    }
}
