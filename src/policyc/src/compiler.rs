// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lowers a normalized policy to a seccomp BPF program.
//!
//! Compilation is a single left-to-right pass. Each rule dispatches on the
//! syscall number and lowers its body against a shared pair of labels: the
//! `allow` label in front of the accepting return and the `next` label at
//! the start of the following rule (or the final kill return). Comparisons
//! register their branch targets symbolically and the emitter patches them
//! once the labels are bound, which is all the control flow the strictly
//! forward-jumping program shape needs.
//!
//! Arguments are 64-bit while the accumulator is 32-bit, so argument
//! comparisons run in two steps: the upper words decide where they can, the
//! lower words settle the rest. When the literal side's upper word is zero
//! the upper step collapses to a single equality check that rejects
//! arguments with any high bit set.

use crate::ast::{ArithOp, CmpOp, Expr, Policy, Rule};
use crate::bpf::{
    arg_word_offsets, sock_filter, BpfProgram, BPF_ABS, BPF_ADD, BPF_ALU, BPF_AND, BPF_DIV,
    BPF_IMM, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_K, BPF_LD, BPF_LSH,
    BPF_MISC, BPF_MOD, BPF_MUL, BPF_OR, BPF_RET, BPF_RSH, BPF_SUB, BPF_TAX, BPF_W, BPF_X,
    BPF_XOR, SECCOMP_DATA_NR_OFFSET, SECCOMP_RET_ALLOW, SECCOMP_RET_KILL,
};
use crate::emitter::{Emitter, EmitterError};
use crate::syscall_table::SyscallTable;

const LOAD: u16 = BPF_LD | BPF_W | BPF_ABS;
const LOAD_IMM: u16 = BPF_LD | BPF_IMM;
const TRANSFER: u16 = BPF_MISC | BPF_TAX;
const JEQ_K: u16 = BPF_JMP | BPF_JEQ | BPF_K;
const JGT_K: u16 = BPF_JMP | BPF_JGT | BPF_K;
const JSET_K: u16 = BPF_JMP | BPF_JSET | BPF_K;
const JUMP: u16 = BPF_JMP | BPF_JA;
const RET_K: u16 = BPF_RET | BPF_K;

/// Label in front of the accepting return.
const ALLOW_LABEL: &str = "allow";
/// Label at the start of the next rule, or the final kill return.
const NEXT_LABEL: &str = "next";

/// Errors raised while lowering a policy.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum CompileError {
    /// {0}
    Emitter(#[from] EmitterError),
    /// Syscall `{0}` has no number for the target architecture; names must be resolved before lowering
    UnknownSyscall(String),
    /// Cannot lower expression `{0}`
    UnsupportedExpression(String),
}

/// A pending branch target: fall through, or jump to a label.
type Target<'a> = Option<&'a str>;

/// Compiles a normalized policy into a filter program.
///
/// The program tests rules in order; the first rule whose syscall matches
/// and whose body holds returns `SECCOMP_RET_ALLOW`, everything else falls
/// through to `SECCOMP_RET_KILL`.
pub fn compile(policy: &Policy, syscalls: &SyscallTable) -> Result<BpfProgram, CompileError> {
    let mut compiler = Compiler {
        emitter: Emitter::new(),
        currently_loaded: None,
        label_count: 0,
        syscalls,
    };

    for rule in &policy.rules {
        compiler.compile_rule(rule)?;
    }

    compiler.emitter.bind(ALLOW_LABEL)?;
    compiler.emitter.emit(RET_K, SECCOMP_RET_ALLOW);
    compiler.emitter.bind(NEXT_LABEL)?;
    compiler.emitter.emit(RET_K, SECCOMP_RET_KILL);

    let program = compiler.emitter.finish()?;
    log::debug!(
        "compiled {} rules into {} instructions",
        policy.rules.len(),
        program.len()
    );
    Ok(program)
}

struct Compiler<'a> {
    emitter: Emitter,
    /// Offset of the `seccomp_data` word currently in the accumulator, if
    /// the accumulator holds one at the program point being emitted.
    currently_loaded: Option<u32>,
    label_count: usize,
    syscalls: &'a SyscallTable,
}

impl Compiler<'_> {
    fn compile_rule(&mut self, rule: &Rule) -> Result<(), CompileError> {
        self.emitter.bind(NEXT_LABEL)?;

        let nr = self
            .syscalls
            .lookup(&rule.name)
            .ok_or_else(|| CompileError::UnknownSyscall(rule.name.clone()))?;
        self.load(SECCOMP_DATA_NR_OFFSET);

        match &rule.body {
            Expr::BooleanLiteral(true) => {
                self.conditional(JEQ_K, nr, Some(ALLOW_LABEL), Some(NEXT_LABEL));
            }
            Expr::BooleanLiteral(false) => {
                self.conditional(JEQ_K, nr, None, Some(NEXT_LABEL));
                let index = self.emitter.emit(JUMP, 0);
                self.emitter.jump_unconditional(index, NEXT_LABEL);
            }
            body => {
                self.conditional(JEQ_K, nr, None, Some(NEXT_LABEL));
                self.condition(body, Some(ALLOW_LABEL), Some(NEXT_LABEL))?;
            }
        }

        Ok(())
    }

    /// Lowers a boolean expression; `on_true`/`on_false` name where each
    /// outcome must transfer control, with `None` falling through.
    fn condition(
        &mut self,
        expr: &Expr,
        on_true: Target,
        on_false: Target,
    ) -> Result<(), CompileError> {
        match expr {
            Expr::BooleanLiteral(true) => {
                if let Some(label) = on_true {
                    let index = self.emitter.emit(JUMP, 0);
                    self.emitter.jump_unconditional(index, label);
                }
                Ok(())
            }
            Expr::BooleanLiteral(false) => {
                if let Some(label) = on_false {
                    let index = self.emitter.emit(JUMP, 0);
                    self.emitter.jump_unconditional(index, label);
                }
                Ok(())
            }
            Expr::And { left, right } => {
                let label = self.fresh_label();
                self.condition(left, Some(label.as_str()), on_false)?;
                self.bind_merge(&label)?;
                self.condition(right, on_true, on_false)
            }
            Expr::Or { left, right } => {
                let label = self.fresh_label();
                self.condition(left, on_true, Some(label.as_str()))?;
                self.bind_merge(&label)?;
                self.condition(right, on_true, on_false)
            }
            Expr::Not(inner) => self.condition(inner, on_false, on_true),
            Expr::Comparison { left, op, right } => {
                self.comparison(left, *op, right, on_true, on_false)
            }
            expr => Err(CompileError::UnsupportedExpression(expr.to_string())),
        }
    }

    fn comparison(
        &mut self,
        left: &Expr,
        op: CmpOp,
        right: &Expr,
        on_true: Target,
        on_false: Target,
    ) -> Result<(), CompileError> {
        match (left, right) {
            (Expr::Argument(arg), Expr::NumericLiteral(value)) => {
                self.compare_argument_to_literal(*arg, op, *value, on_true, on_false);
                Ok(())
            }
            (Expr::NumericLiteral(value), Expr::Argument(arg)) => {
                self.compare_literal_to_argument(*value, op, *arg, on_true, on_false);
                Ok(())
            }
            (Expr::Argument(left), Expr::Argument(right)) => {
                self.compare_argument_to_argument(*left, op, *right, on_true, on_false);
                Ok(())
            }
            _ => self.compare_narrowed(left, op, right, on_true, on_false),
        }
    }

    /// Comparison against an immediate: the argument goes through A, the
    /// literal rides in the instruction's `k` field.
    fn compare_argument_to_literal(
        &mut self,
        arg: u8,
        op: CmpOp,
        value: u64,
        on_true: Target,
        on_false: Target,
    ) {
        let (upper_offset, lower_offset) = arg_word_offsets(arg);
        let (msb, lsb) = split_value(value);

        self.load(upper_offset);
        if msb == 0 {
            self.conditional(JEQ_K, 0, None, on_false);
        } else {
            match op {
                CmpOp::Eq => self.conditional(JEQ_K, msb, None, on_false),
                CmpOp::Ne => self.conditional(JEQ_K, msb, None, on_true),
                CmpOp::Gt | CmpOp::Ge => {
                    self.conditional(JGT_K, msb, on_true, None);
                    self.conditional(JEQ_K, msb, None, on_false);
                }
                CmpOp::Lt | CmpOp::Le => {
                    self.conditional(JGT_K, msb, on_false, None);
                    self.conditional(JEQ_K, msb, None, on_true);
                }
                CmpOp::Set => self.conditional(JSET_K, msb, on_true, None),
            }
        }

        self.load(lower_offset);
        self.deciding_compare(BPF_K, op, lsb, on_true, on_false);
    }

    /// Comparison with the literal on the left: the argument is staged into
    /// X so the literal can take its place in A.
    fn compare_literal_to_argument(
        &mut self,
        value: u64,
        op: CmpOp,
        arg: u8,
        on_true: Target,
        on_false: Target,
    ) {
        let (upper_offset, lower_offset) = arg_word_offsets(arg);
        let (msb, lsb) = split_value(value);

        // The upper-word test runs on the argument in A against the
        // literal's upper word in K, so the ordering polarity is mirrored.
        self.load(upper_offset);
        if msb == 0 {
            self.conditional(JEQ_K, 0, None, on_false);
        } else {
            match op {
                CmpOp::Eq => self.conditional(JEQ_K, msb, None, on_false),
                CmpOp::Ne => self.conditional(JEQ_K, msb, None, on_true),
                CmpOp::Gt | CmpOp::Ge => {
                    self.conditional(JGT_K, msb, on_false, None);
                    self.conditional(JEQ_K, msb, None, on_true);
                }
                CmpOp::Lt | CmpOp::Le => {
                    self.conditional(JGT_K, msb, on_true, None);
                    self.conditional(JEQ_K, msb, None, on_false);
                }
                CmpOp::Set => self.conditional(JSET_K, msb, on_true, None),
            }
        }

        self.load(lower_offset);
        self.transfer_to_index();
        self.load_immediate(lsb);
        self.deciding_compare(BPF_X, op, 0, on_true, on_false);
    }

    /// Argument-vs-argument comparison: both word pairs go through the
    /// A-vs-X form, left in A, right in X.
    fn compare_argument_to_argument(
        &mut self,
        left: u8,
        op: CmpOp,
        right: u8,
        on_true: Target,
        on_false: Target,
    ) {
        let (left_upper, left_lower) = arg_word_offsets(left);
        let (right_upper, right_lower) = arg_word_offsets(right);

        self.load(right_upper);
        self.transfer_to_index();
        self.load(left_upper);
        match op {
            CmpOp::Eq => self.conditional(BPF_JMP | BPF_JEQ | BPF_X, 0, None, on_false),
            CmpOp::Ne => self.conditional(BPF_JMP | BPF_JEQ | BPF_X, 0, None, on_true),
            CmpOp::Gt | CmpOp::Ge => {
                self.conditional(BPF_JMP | BPF_JGT | BPF_X, 0, on_true, None);
                self.conditional(BPF_JMP | BPF_JEQ | BPF_X, 0, None, on_false);
            }
            CmpOp::Lt | CmpOp::Le => {
                self.conditional(BPF_JMP | BPF_JGT | BPF_X, 0, on_false, None);
                self.conditional(BPF_JMP | BPF_JEQ | BPF_X, 0, None, on_true);
            }
            CmpOp::Set => self.conditional(BPF_JMP | BPF_JSET | BPF_X, 0, on_true, None),
        }

        self.load(right_lower);
        self.transfer_to_index();
        self.load(left_lower);
        self.deciding_compare(BPF_X, op, 0, on_true, on_false);
    }

    /// Comparison with an arithmetic operand. Arithmetic runs on the 32-bit
    /// ALU, so both sides are narrowed to their lower words.
    fn compare_narrowed(
        &mut self,
        left: &Expr,
        op: CmpOp,
        right: &Expr,
        on_true: Target,
        on_false: Target,
    ) -> Result<(), CompileError> {
        if let Expr::NumericLiteral(value) = right {
            let k = narrow_literal(*value, right)?;
            self.evaluate(left, false)?;
            self.deciding_compare(BPF_K, op, k, on_true, on_false);
            return Ok(());
        }

        self.evaluate(right, false)?;
        self.transfer_to_index();
        self.evaluate(left, true)?;
        self.deciding_compare(BPF_X, op, 0, on_true, on_false);
        Ok(())
    }

    /// Emits the instruction that settles a comparison. Inverted operators
    /// reuse the positive opcode with the branch targets swapped.
    fn deciding_compare(&mut self, source: u16, op: CmpOp, k: u32, on_true: Target, on_false: Target) {
        let (jmp, swap) = match op {
            CmpOp::Eq => (BPF_JEQ, false),
            CmpOp::Ne => (BPF_JEQ, true),
            CmpOp::Gt => (BPF_JGT, false),
            CmpOp::Ge => (BPF_JGE, false),
            CmpOp::Lt => (BPF_JGT, true),
            CmpOp::Le => (BPF_JGE, true),
            CmpOp::Set => (BPF_JSET, false),
        };
        let (on_true, on_false) = if swap {
            (on_false, on_true)
        } else {
            (on_true, on_false)
        };
        self.conditional(BPF_JMP | jmp | source, k, on_true, on_false);

        if source == BPF_X {
            // The accumulator held a transient operand; force the next
            // syscall dispatch to reload.
            self.currently_loaded = None;
        }
    }

    /// Materializes the 32-bit value of a numeric expression in A, using X
    /// for non-immediate right operands. With `x_live` the index register
    /// is already claimed by an enclosing computation.
    fn evaluate(&mut self, expr: &Expr, x_live: bool) -> Result<(), CompileError> {
        match expr {
            Expr::NumericLiteral(value) => {
                let k = narrow_literal(*value, expr)?;
                self.load_immediate(k);
                Ok(())
            }
            Expr::Argument(arg) => {
                let (_, lower_offset) = arg_word_offsets(*arg);
                self.load(lower_offset);
                Ok(())
            }
            Expr::Arithmetic { left, op, right } => match right.as_ref() {
                Expr::NumericLiteral(value) => {
                    let k = narrow_literal(*value, right)?;
                    self.evaluate(left, x_live)?;
                    self.emitter.emit(BPF_ALU | alu_opcode(*op) | BPF_K, k);
                    self.currently_loaded = None;
                    Ok(())
                }
                right_operand => {
                    if x_live {
                        return Err(CompileError::UnsupportedExpression(expr.to_string()));
                    }
                    self.evaluate(right_operand, false)?;
                    self.transfer_to_index();
                    self.evaluate(left, true)?;
                    self.emitter.emit(BPF_ALU | alu_opcode(*op) | BPF_X, 0);
                    self.currently_loaded = None;
                    Ok(())
                }
            },
            expr => Err(CompileError::UnsupportedExpression(expr.to_string())),
        }
    }

    /// Loads a `seccomp_data` word into A unless it is already there.
    fn load(&mut self, offset: u32) {
        if self.currently_loaded != Some(offset) {
            self.emitter.emit(LOAD, offset);
            self.currently_loaded = Some(offset);
        }
    }

    fn load_immediate(&mut self, k: u32) {
        self.emitter.emit(LOAD_IMM, k);
        self.currently_loaded = None;
    }

    /// Copies A into X. A itself is preserved.
    fn transfer_to_index(&mut self) {
        self.emitter.emit(TRANSFER, 0);
    }

    fn conditional(&mut self, code: u16, k: u32, on_true: Target, on_false: Target) {
        let index = self.emitter.emit(code, k);
        if let Some(label) = on_true {
            self.emitter.jump_on_true(index, label);
        }
        if let Some(label) = on_false {
            self.emitter.jump_on_false(index, label);
        }
    }

    fn fresh_label(&mut self) -> String {
        let label = format!(".L{}", self.label_count);
        self.label_count += 1;
        label
    }

    /// Binds a label where several paths join. The paths may have left
    /// different words in A, so the load cache cannot be trusted past it.
    fn bind_merge(&mut self, label: &str) -> Result<(), EmitterError> {
        self.emitter.bind(label)?;
        self.currently_loaded = None;
        Ok(())
    }
}

fn split_value(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

fn alu_opcode(op: ArithOp) -> u16 {
    match op {
        ArithOp::Plus => BPF_ADD,
        ArithOp::Minus => BPF_SUB,
        ArithOp::Mul => BPF_MUL,
        ArithOp::Div => BPF_DIV,
        ArithOp::Mod => BPF_MOD,
        ArithOp::BinAnd => BPF_AND,
        ArithOp::BinOr => BPF_OR,
        ArithOp::BinXor => BPF_XOR,
        ArithOp::Lsh => BPF_LSH,
        ArithOp::Rsh => BPF_RSH,
    }
}

fn narrow_literal(value: u64, expr: &Expr) -> Result<u32, CompileError> {
    u32::try_from(value).map_err(|_| CompileError::UnsupportedExpression(expr.to_string()))
}
