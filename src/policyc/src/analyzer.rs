// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pre-compilation pass over the policy tree.
//!
//! The lowering stage assumes a policy in which every syscall name resolves,
//! literal-only subtrees are folded, membership tests are expanded into
//! equality chains and every rule body is a boolean condition. This pass
//! establishes those invariants and rejects policies that cannot meet them.

use crate::ast::{ArithOp, CmpOp, Expr, Policy, Rule};
use crate::syscall_table::SyscallTable;

/// Errors raised while validating and normalizing a policy.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum AnalysisError {
    /// Unknown syscall `{0}` for the target architecture
    UnknownSyscall(String),
    /// Division by zero in constant expression
    DivisionByZero,
    /// Shift amount {0} is out of range for 64-bit values
    ShiftOutOfRange(u64),
    /// Expression `{0}` is not a boolean condition
    NotBoolean(String),
    /// Expression `{0}` is not numeric
    NotNumeric(String),
    /// Bitwise complement of non-constant expression `{0}` is not supported
    NonConstantComplement(String),
}

/// Validates `policy` and returns its normalized form.
pub fn analyze(policy: Policy, table: &SyscallTable) -> Result<Policy, AnalysisError> {
    let mut rules = Vec::with_capacity(policy.rules.len());

    for rule in policy.rules {
        if table.lookup(&rule.name).is_none() {
            return Err(AnalysisError::UnknownSyscall(rule.name));
        }
        let body = normalize_condition(rule.body)?;
        rules.push(Rule {
            name: rule.name,
            body,
        });
    }

    Ok(Policy { rules })
}

/// Normalizes an expression in boolean position.
fn normalize_condition(expr: Expr) -> Result<Expr, AnalysisError> {
    match expr {
        Expr::BooleanLiteral(_) => Ok(expr),
        Expr::Comparison { left, op, right } => {
            let left = fold_numeric(*left)?;
            let right = fold_numeric(*right)?;
            if let (Expr::NumericLiteral(l), Expr::NumericLiteral(r)) = (&left, &right) {
                return Ok(Expr::BooleanLiteral(eval_comparison(*l, op, *r)));
            }
            Ok(Expr::Comparison {
                left: Box::new(left),
                op,
                right: Box::new(right),
            })
        }
        Expr::And { left, right } => {
            let left = normalize_condition(*left)?;
            let right = normalize_condition(*right)?;
            Ok(match (left, right) {
                (Expr::BooleanLiteral(false), _) | (_, Expr::BooleanLiteral(false)) => {
                    Expr::BooleanLiteral(false)
                }
                (Expr::BooleanLiteral(true), other) | (other, Expr::BooleanLiteral(true)) => other,
                (left, right) => Expr::And {
                    left: Box::new(left),
                    right: Box::new(right),
                },
            })
        }
        Expr::Or { left, right } => {
            let left = normalize_condition(*left)?;
            let right = normalize_condition(*right)?;
            Ok(match (left, right) {
                (Expr::BooleanLiteral(true), _) | (_, Expr::BooleanLiteral(true)) => {
                    Expr::BooleanLiteral(true)
                }
                (Expr::BooleanLiteral(false), other) | (other, Expr::BooleanLiteral(false)) => {
                    other
                }
                (left, right) => Expr::Or {
                    left: Box::new(left),
                    right: Box::new(right),
                },
            })
        }
        Expr::Not(inner) => {
            let inner = normalize_condition(*inner)?;
            Ok(match inner {
                Expr::BooleanLiteral(value) => Expr::BooleanLiteral(!value),
                inner => Expr::Not(Box::new(inner)),
            })
        }
        Expr::In { needle, members } => expand_membership(*needle, members, CmpOp::Eq),
        Expr::NotIn { needle, members } => expand_membership(*needle, members, CmpOp::Ne),
        // A bitwise intersection in boolean position is the bit-test
        // comparison of the policy language.
        Expr::Arithmetic {
            left,
            op: ArithOp::BinAnd,
            right,
        } => normalize_condition(Expr::Comparison {
            left,
            op: CmpOp::Set,
            right,
        }),
        expr => Err(AnalysisError::NotBoolean(expr.to_string())),
    }
}

/// Expands `in`/`notIn` into a chain of equality comparisons: a disjunction
/// of `==` for membership, a conjunction of `!=` for exclusion.
fn expand_membership(needle: Expr, members: Vec<Expr>, op: CmpOp) -> Result<Expr, AnalysisError> {
    let mut chain: Option<Expr> = None;

    for member in members {
        let comparison = Expr::Comparison {
            left: Box::new(needle.clone()),
            op,
            right: Box::new(member),
        };
        chain = Some(match chain {
            None => comparison,
            Some(previous) => {
                let (left, right) = (Box::new(previous), Box::new(comparison));
                match op {
                    CmpOp::Eq => Expr::Or { left, right },
                    _ => Expr::And { left, right },
                }
            }
        });
    }

    match chain {
        Some(chain) => normalize_condition(chain),
        // `in` over the empty set can never match; `notIn` always does.
        None => Ok(Expr::BooleanLiteral(op != CmpOp::Eq)),
    }
}

/// Folds an expression in numeric position down to literals, arguments and
/// argument-dependent arithmetic.
fn fold_numeric(expr: Expr) -> Result<Expr, AnalysisError> {
    match expr {
        Expr::NumericLiteral(_) | Expr::Argument(_) => Ok(expr),
        Expr::Arithmetic { left, op, right } => {
            let left = fold_numeric(*left)?;
            let right = fold_numeric(*right)?;
            if let (Expr::NumericLiteral(l), Expr::NumericLiteral(r)) = (&left, &right) {
                return Ok(Expr::NumericLiteral(eval_arithmetic(*l, op, *r)?));
            }
            Ok(Expr::Arithmetic {
                left: Box::new(left),
                op,
                right: Box::new(right),
            })
        }
        Expr::BinaryNot(inner) => {
            let inner = fold_numeric(*inner)?;
            match inner {
                Expr::NumericLiteral(value) => Ok(Expr::NumericLiteral(!value)),
                inner => Err(AnalysisError::NonConstantComplement(inner.to_string())),
            }
        }
        expr => Err(AnalysisError::NotNumeric(expr.to_string())),
    }
}

fn eval_comparison(left: u64, op: CmpOp, right: u64) -> bool {
    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::Gt => left > right,
        CmpOp::Ge => left >= right,
        CmpOp::Lt => left < right,
        CmpOp::Le => left <= right,
        CmpOp::Set => left & right != 0,
    }
}

fn eval_arithmetic(left: u64, op: ArithOp, right: u64) -> Result<u64, AnalysisError> {
    match op {
        ArithOp::Plus => Ok(left.wrapping_add(right)),
        ArithOp::Minus => Ok(left.wrapping_sub(right)),
        ArithOp::Mul => Ok(left.wrapping_mul(right)),
        ArithOp::Div => left.checked_div(right).ok_or(AnalysisError::DivisionByZero),
        ArithOp::Mod => left.checked_rem(right).ok_or(AnalysisError::DivisionByZero),
        ArithOp::BinAnd => Ok(left & right),
        ArithOp::BinOr => Ok(left | right),
        ArithOp::BinXor => Ok(left ^ right),
        ArithOp::Lsh | ArithOp::Rsh => {
            let amount =
                u32::try_from(right).map_err(|_| AnalysisError::ShiftOutOfRange(right))?;
            if amount >= 64 {
                return Err(AnalysisError::ShiftOutOfRange(right));
            }
            Ok(match op {
                ArithOp::Lsh => left << amount,
                _ => left >> amount,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_expression, parse_policy};

    fn analyze_body(body: &str) -> Result<Expr, AnalysisError> {
        normalize_condition(parse_expression(body).unwrap())
    }

    #[test]
    fn test_rejects_unknown_syscall() {
        let table = SyscallTable::new();
        let policy = parse_policy("frobnicate: 1").unwrap();
        assert_eq!(
            analyze(policy, &table),
            Err(AnalysisError::UnknownSyscall("frobnicate".to_string()))
        );
    }

    #[test]
    fn test_accepts_known_syscalls() {
        let table = SyscallTable::new();
        let policy = parse_policy("write: arg0 == 42\nvhangup: 1").unwrap();
        let analyzed = analyze(policy, &table).unwrap();
        assert_eq!(analyzed.rules.len(), 2);
    }

    #[test]
    fn test_folds_literal_arithmetic() {
        assert_eq!(analyze_body("arg0 == 12 * 3").unwrap().to_string(), "(eq arg0 36)");
        assert_eq!(
            analyze_body("arg0 == (12 + 3) * 2").unwrap().to_string(),
            "(eq arg0 30)"
        );
        assert_eq!(
            analyze_body("arg0 == 2 << 4").unwrap().to_string(),
            "(eq arg0 32)"
        );
        assert_eq!(
            analyze_body("arg0 == ~0").unwrap().to_string(),
            "(eq arg0 18446744073709551615)"
        );
    }

    #[test]
    fn test_folds_literal_comparisons_and_booleans() {
        assert_eq!(analyze_body("1 == 1").unwrap(), Expr::BooleanLiteral(true));
        assert_eq!(analyze_body("2 < 1").unwrap(), Expr::BooleanLiteral(false));
        assert_eq!(
            analyze_body("1 == 2 || arg0 == 3").unwrap().to_string(),
            "(eq arg0 3)"
        );
        assert_eq!(
            analyze_body("1 == 1 || arg0 == 3").unwrap(),
            Expr::BooleanLiteral(true)
        );
        assert_eq!(
            analyze_body("!(1 == 2) && arg0 == 3").unwrap().to_string(),
            "(eq arg0 3)"
        );
    }

    #[test]
    fn test_expands_membership() {
        assert_eq!(
            analyze_body("in(arg0, 1, 2, 3)").unwrap().to_string(),
            "(or (or (eq arg0 1) (eq arg0 2)) (eq arg0 3))"
        );
        assert_eq!(
            analyze_body("notIn(arg0, 1, 2)").unwrap().to_string(),
            "(and (neq arg0 1) (neq arg0 2))"
        );
    }

    #[test]
    fn test_bitwise_and_in_boolean_position_is_a_bit_test() {
        assert_eq!(analyze_body("arg0 & 42").unwrap().to_string(), "(set arg0 42)");
        assert_eq!(analyze_body("1 & arg0").unwrap().to_string(), "(set 1 arg0)");
    }

    #[test]
    fn test_rejects_constant_errors() {
        assert_eq!(
            analyze_body("arg0 == 1 / 0"),
            Err(AnalysisError::DivisionByZero)
        );
        assert_eq!(
            analyze_body("arg0 == 1 << 64"),
            Err(AnalysisError::ShiftOutOfRange(64))
        );
    }

    #[test]
    fn test_rejects_shape_errors() {
        assert_eq!(
            analyze_body("arg0 + 1"),
            Err(AnalysisError::NotBoolean("(plus arg0 1)".to_string()))
        );
        assert!(matches!(
            analyze_body("(arg0 == 1) + 2"),
            Err(AnalysisError::NotNumeric(_))
        ));
        assert_eq!(
            analyze_body("arg0 == ~arg1"),
            Err(AnalysisError::NonConstantComplement("arg1".to_string()))
        );
    }
}
