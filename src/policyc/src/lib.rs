// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compiles human-readable syscall-filter policies into seccomp BPF
//! programs.
//!
//! A policy is a list of `name: expression` rules, one per line. Each rule
//! names a syscall and guards it with a boolean expression over the syscall
//! arguments (`arg0`..`arg5`), integer literals and the comparison,
//! arithmetic and boolean operators of the language. The first rule whose
//! syscall matches and whose guard holds allows the call; everything else is
//! killed:
//!
//! ```text
//! # allow stdout and stderr only
//! write: arg0 == 1 || arg0 == 2
//! exit_group: 1
//! ```
//!
//! Compilation goes through three stages: [`parser::parse_policy`] builds
//! the expression tree, [`analyzer::analyze`] validates and normalizes it,
//! and [`compiler::compile`] lowers it to classic BPF instructions.
//! [`compile_policy`] chains the three for the common case:
//!
//! ```
//! let program = policyc::compile_policy("write: arg0 == 1")?;
//! assert_eq!(program.last().unwrap().k, policyc::bpf::SECCOMP_RET_KILL);
//! # Ok::<(), policyc::Error>(())
//! ```
//!
//! The resulting program expects `struct seccomp_data` as input and returns
//! `SECCOMP_RET_ALLOW` or `SECCOMP_RET_KILL`; installing it into the kernel
//! is left to the consumer.

pub mod analyzer;
pub mod ast;
pub mod bpf;
pub mod compiler;
pub mod emitter;
pub mod parser;
pub mod syscall_table;

pub use bpf::{sock_filter, BpfProgram};

/// Errors surfaced by the end-to-end compilation pipeline.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum Error {
    /// {0}
    Parse(#[from] parser::ParseError),
    /// {0}
    Analysis(#[from] analyzer::AnalysisError),
    /// {0}
    Compile(#[from] compiler::CompileError),
}

/// Compiles policy text into a filter program for the host architecture.
pub fn compile_policy(src: &str) -> Result<BpfProgram, Error> {
    let table = syscall_table::SyscallTable::new();
    let policy = parser::parse_policy(src)?;
    let policy = analyzer::analyze(policy, &table)?;
    Ok(compiler::compile(&policy, &table)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{SECCOMP_RET_ALLOW, SECCOMP_RET_KILL};

    #[test]
    fn test_compile_policy_end_to_end() {
        let program = compile_policy("write: arg0 == 42\nvhangup: 1").unwrap();

        assert_eq!(program.len(), 10);
        assert_eq!(program[program.len() - 2].k, SECCOMP_RET_ALLOW);
        assert_eq!(program[program.len() - 1].k, SECCOMP_RET_KILL);
    }

    #[test]
    fn test_normalization_feeds_the_compiler() {
        // `in` expands to the same program as the explicit disjunction.
        let expanded = compile_policy("write: in(arg0, 1, 2)").unwrap();
        let explicit = compile_policy("write: arg0 == 1 || arg0 == 2").unwrap();
        assert_eq!(expanded, explicit);
    }

    #[test]
    fn test_errors_carry_their_stage() {
        assert!(matches!(
            compile_policy("write arg0"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            compile_policy("frobnicate: 1"),
            Err(Error::Analysis(_))
        ));
    }
}
