// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Intermediate representation for syscall-filter policies.
//!
//! A policy is an ordered list of rules; the first rule whose syscall matches
//! and whose body evaluates to true decides the action. Rule bodies are
//! expression trees over syscall arguments, numeric literals and the
//! comparison, arithmetic and boolean operators of the policy language.

use std::fmt;

/// An ordered syscall-filter policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub rules: Vec<Rule>,
}

/// A single `syscall: body` rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    /// Syscall name, resolved against the target's syscall table.
    pub name: String,
    /// Guard expression; the rule fires only when it evaluates to true.
    pub body: Expr,
}

/// Comparison to perform between two numeric operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    /// Operands are equal.
    Eq,
    /// Operands are not equal.
    Ne,
    /// Left operand is greater than the right one.
    Gt,
    /// Left operand is greater than or equal to the right one.
    Ge,
    /// Left operand is less than the right one.
    Lt,
    /// Left operand is less than or equal to the right one.
    Le,
    /// Bitwise intersection of the operands is non-empty.
    Set,
}

/// Arithmetic and bitwise operators over numeric operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    BinAnd,
    BinOr,
    BinXor,
    Lsh,
    Rsh,
}

/// A policy expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// Constant rule body; `true` always fires, `false` never does.
    BooleanLiteral(bool),
    /// Unsigned 64-bit constant.
    NumericLiteral(u64),
    /// The i-th syscall argument, `0..=5`.
    Argument(u8),
    /// Numeric comparison producing a boolean.
    Comparison {
        left: Box<Expr>,
        op: CmpOp,
        right: Box<Expr>,
    },
    /// Arithmetic or bitwise combination of two numeric operands.
    Arithmetic {
        left: Box<Expr>,
        op: ArithOp,
        right: Box<Expr>,
    },
    /// Short-circuit boolean and.
    And { left: Box<Expr>, right: Box<Expr> },
    /// Short-circuit boolean or.
    Or { left: Box<Expr>, right: Box<Expr> },
    /// Boolean negation.
    Not(Box<Expr>),
    /// Bitwise complement of a numeric operand.
    BinaryNot(Box<Expr>),
    /// Needle is equal to one of the members.
    In {
        needle: Box<Expr>,
        members: Vec<Expr>,
    },
    /// Needle is equal to none of the members.
    NotIn {
        needle: Box<Expr>,
        members: Vec<Expr>,
    },
}

impl CmpOp {
    fn tag(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "neq",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "geq",
            CmpOp::Lt => "lss",
            CmpOp::Le => "leq",
            CmpOp::Set => "set",
        }
    }
}

impl ArithOp {
    fn tag(self) -> &'static str {
        match self {
            ArithOp::Plus => "plus",
            ArithOp::Minus => "minus",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
            ArithOp::BinAnd => "binand",
            ArithOp::BinOr => "binor",
            ArithOp::BinXor => "binxor",
            ArithOp::Lsh => "lsh",
            ArithOp::Rsh => "rsh",
        }
    }
}

fn write_members(f: &mut fmt::Formatter<'_>, members: &[Expr]) -> fmt::Result {
    write!(f, "{{")?;
    for (i, member) in members.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", member)?;
    }
    write!(f, "}}")
}

/// Renders expressions as s-expressions, e.g. `(or (eq arg0 4) (eq arg0 5))`.
/// Used by error reporting, the listing dump and the parser tests.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BooleanLiteral(true) => write!(f, "1"),
            Expr::BooleanLiteral(false) => write!(f, "0"),
            Expr::NumericLiteral(n) => write!(f, "{}", n),
            Expr::Argument(n) => write!(f, "arg{}", n),
            Expr::Comparison { left, op, right } => {
                write!(f, "({} {} {})", op.tag(), left, right)
            }
            Expr::Arithmetic { left, op, right } => {
                write!(f, "({} {} {})", op.tag(), left, right)
            }
            Expr::And { left, right } => write!(f, "(and {} {})", left, right),
            Expr::Or { left, right } => write!(f, "(or {} {})", left, right),
            Expr::Not(inner) => write!(f, "(not {})", inner),
            Expr::BinaryNot(inner) => write!(f, "(bnot {})", inner),
            Expr::In { needle, members } => {
                write!(f, "(in {} ", needle)?;
                write_members(f, members)?;
                write!(f, ")")
            }
            Expr::NotIn { needle, members } => {
                write!(f, "(notIn {} ", needle)?;
                write_members(f, members)?;
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(n: u8) -> Box<Expr> {
        Box::new(Expr::Argument(n))
    }

    fn num(n: u64) -> Box<Expr> {
        Box::new(Expr::NumericLiteral(n))
    }

    #[test]
    fn test_render_comparison() {
        let expr = Expr::Comparison {
            left: arg(0),
            op: CmpOp::Eq,
            right: num(4),
        };
        assert_eq!(expr.to_string(), "(eq arg0 4)");
    }

    #[test]
    fn test_render_nested_boolean() {
        let expr = Expr::Or {
            left: Box::new(Expr::Comparison {
                left: arg(0),
                op: CmpOp::Eq,
                right: num(4),
            }),
            right: Box::new(Expr::Comparison {
                left: arg(0),
                op: CmpOp::Eq,
                right: num(5),
            }),
        };
        assert_eq!(expr.to_string(), "(or (eq arg0 4) (eq arg0 5))");
    }

    #[test]
    fn test_render_membership() {
        let expr = Expr::In {
            needle: arg(0),
            members: vec![Expr::NumericLiteral(1), Expr::NumericLiteral(2)],
        };
        assert_eq!(expr.to_string(), "(in arg0 {1, 2})");
    }

    #[test]
    fn test_render_literals() {
        assert_eq!(Expr::BooleanLiteral(true).to_string(), "1");
        assert_eq!(Expr::BooleanLiteral(false).to_string(), "0");
        assert_eq!(Expr::BinaryNot(num(0)).to_string(), "(bnot 0)");
    }
}
