// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Append-only instruction buffer with symbolic forward-jump fixup.
//!
//! Conditional jumps name their targets symbolically while instructions are
//! being appended; when a label is bound the recorded origins are patched in
//! place with the relative distance `target - origin - 1`. True-branch and
//! false-branch references are tracked separately since one instruction can
//! have both pending against different labels. A third table patches the
//! 32-bit `k` field of unconditional `JMP|JA` instructions.

use std::collections::HashMap;

use crate::bpf::sock_filter;

/// Errors raised while resolving jump targets.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum EmitterError {
    /// Conditional jump at {origin} spans {distance} instructions, more than the 255 the encoding allows
    JumpTooFar { origin: usize, distance: usize },
    /// Label `{0}` was referenced but never bound
    UnboundLabel(String),
}

/// Instruction buffer plus the pending-reference tables for each jump field.
#[derive(Debug, Default)]
pub struct Emitter {
    program: Vec<sock_filter>,
    true_refs: HashMap<String, Vec<usize>>,
    false_refs: HashMap<String, Vec<usize>>,
    unconditional_refs: HashMap<String, Vec<usize>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instruction with clear jump fields, returning its index.
    pub fn emit(&mut self, code: u16, k: u32) -> usize {
        let index = self.program.len();
        self.program.push(sock_filter {
            code,
            jt: 0,
            jf: 0,
            k,
        });
        index
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Records that `index`'s true branch must reach `label` once it is bound.
    pub fn jump_on_true(&mut self, index: usize, label: &str) {
        self.true_refs.entry(label.to_string()).or_default().push(index);
    }

    /// Records that `index`'s false branch must reach `label` once it is bound.
    pub fn jump_on_false(&mut self, index: usize, label: &str) {
        self.false_refs.entry(label.to_string()).or_default().push(index);
    }

    /// Records that the `JMP|JA` at `index` must reach `label` once it is bound.
    pub fn jump_unconditional(&mut self, index: usize, label: &str) {
        self.unconditional_refs
            .entry(label.to_string())
            .or_default()
            .push(index);
    }

    /// Binds `label` to the current tail position and patches every pending
    /// reference to it. Labels are forward-only: origins always precede the
    /// bind point.
    pub fn bind(&mut self, label: &str) -> Result<(), EmitterError> {
        let target = self.program.len();

        for origin in self.true_refs.remove(label).unwrap_or_default() {
            self.program[origin].jt = Self::distance(origin, target)?;
        }
        for origin in self.false_refs.remove(label).unwrap_or_default() {
            self.program[origin].jf = Self::distance(origin, target)?;
        }
        for origin in self.unconditional_refs.remove(label).unwrap_or_default() {
            self.program[origin].k = (target - origin - 1) as u32;
        }

        Ok(())
    }

    fn distance(origin: usize, target: usize) -> Result<u8, EmitterError> {
        let distance = target - origin - 1;
        u8::try_from(distance).map_err(|_| EmitterError::JumpTooFar { origin, distance })
    }

    /// Consumes the emitter, yielding the finished program. Fails if any
    /// referenced label was never bound, since the corresponding jump fields
    /// would silently fall through.
    pub fn finish(self) -> Result<Vec<sock_filter>, EmitterError> {
        let mut unbound: Vec<&String> = self
            .true_refs
            .keys()
            .chain(self.false_refs.keys())
            .chain(self.unconditional_refs.keys())
            .collect();
        unbound.sort();
        if let Some(label) = unbound.first() {
            return Err(EmitterError::UnboundLabel((*label).clone()));
        }

        Ok(self.program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{BPF_ABS, BPF_JA, BPF_JEQ, BPF_JMP, BPF_K, BPF_LD, BPF_RET, BPF_W};

    const JEQ_K: u16 = BPF_JMP | BPF_JEQ | BPF_K;
    const LOAD: u16 = BPF_LD | BPF_W | BPF_ABS;

    #[test]
    fn test_emit_returns_indices() {
        let mut emitter = Emitter::new();
        assert_eq!(emitter.emit(LOAD, 0), 0);
        assert_eq!(emitter.emit(JEQ_K, 1), 1);
        assert_eq!(emitter.len(), 2);
    }

    #[test]
    fn test_bind_patches_both_spaces() {
        let mut emitter = Emitter::new();
        let cond = emitter.emit(JEQ_K, 42);
        emitter.jump_on_true(cond, "yes");
        emitter.jump_on_false(cond, "no");
        emitter.emit(LOAD, 0);
        emitter.bind("yes").unwrap();
        emitter.emit(BPF_RET | BPF_K, 0);
        emitter.bind("no").unwrap();
        emitter.emit(BPF_RET | BPF_K, 1);

        let program = emitter.finish().unwrap();
        assert_eq!(program[cond].jt, 1);
        assert_eq!(program[cond].jf, 2);
    }

    #[test]
    fn test_bind_at_next_instruction_is_fall_through() {
        let mut emitter = Emitter::new();
        let cond = emitter.emit(JEQ_K, 42);
        emitter.jump_on_true(cond, "target");
        emitter.bind("target").unwrap();
        emitter.emit(BPF_RET | BPF_K, 0);

        let program = emitter.finish().unwrap();
        assert_eq!(program[cond].jt, 0);
    }

    #[test]
    fn test_bind_without_references_is_noop() {
        let mut emitter = Emitter::new();
        emitter.bind("nothing").unwrap();
        emitter.emit(LOAD, 0);
        assert_eq!(emitter.finish().unwrap().len(), 1);
    }

    #[test]
    fn test_multiple_references_resolve_to_one_bind() {
        let mut emitter = Emitter::new();
        let first = emitter.emit(JEQ_K, 1);
        emitter.jump_on_false(first, "out");
        let second = emitter.emit(JEQ_K, 2);
        emitter.jump_on_false(second, "out");
        emitter.bind("out").unwrap();
        emitter.emit(BPF_RET | BPF_K, 0);

        let program = emitter.finish().unwrap();
        assert_eq!(program[first].jf, 1);
        assert_eq!(program[second].jf, 0);
    }

    #[test]
    fn test_unconditional_reference_patches_k() {
        let mut emitter = Emitter::new();
        let jump = emitter.emit(BPF_JMP | BPF_JA, 0);
        emitter.jump_unconditional(jump, "far");
        for _ in 0..300 {
            emitter.emit(LOAD, 0);
        }
        emitter.bind("far").unwrap();
        emitter.emit(BPF_RET | BPF_K, 0);

        let program = emitter.finish().unwrap();
        assert_eq!(program[jump].k, 300);
    }

    #[test]
    fn test_jump_too_far() {
        let mut emitter = Emitter::new();
        let cond = emitter.emit(JEQ_K, 42);
        emitter.jump_on_true(cond, "far");
        for _ in 0..256 {
            emitter.emit(LOAD, 0);
        }
        assert_eq!(
            emitter.bind("far"),
            Err(EmitterError::JumpTooFar {
                origin: 0,
                distance: 256,
            })
        );
    }

    #[test]
    fn test_unbound_label() {
        let mut emitter = Emitter::new();
        let cond = emitter.emit(JEQ_K, 42);
        emitter.jump_on_true(cond, "missing");
        assert_eq!(
            emitter.finish(),
            Err(EmitterError::UnboundLabel("missing".to_string()))
        );
    }
}
