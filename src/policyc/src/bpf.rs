// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Classic BPF instruction model for seccomp filter programs.

use serde::{Deserialize, Serialize};

/// BPF instruction classes.
/// See /usr/include/linux/bpf_common.h .
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

/// BPF ld/ldx fields.
/// See /usr/include/linux/bpf_common.h .
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xA0;

/// BPF alu fields.
/// See /usr/include/linux/bpf_common.h .
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xA0;

/// BPF jmp fields.
/// See /usr/include/linux/bpf_common.h .
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

/// BPF operand sources.
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

/// BPF ret source.
pub const BPF_A: u16 = 0x10;

/// BPF misc fields.
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Return words for seccomp BPF programs.
/// See /usr/include/linux/seccomp.h .
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_KILL: u32 = 0x0000_0000;

/// Architecture identifiers, as reported in `seccomp_data.arch`.
/// See /usr/include/linux/audit.h .
#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH: u32 = 62 | 0x8000_0000 | 0x4000_0000;
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH: u32 = 183 | 0x8000_0000 | 0x4000_0000;

/// `struct seccomp_data` offsets and sizes of fields in bytes:
///
/// ```c
/// struct seccomp_data {
///     int nr;
///     __u32 arch;
///     __u64 instruction_pointer;
///     __u64 args[6];
/// };
/// ```
pub const SECCOMP_DATA_NR_OFFSET: u32 = 0;
pub const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
pub const SECCOMP_DATA_ARGS_OFFSET: u32 = 16;
pub const SECCOMP_DATA_ARG_SIZE: u32 = 8;

/// The maximum number of a syscall argument.
/// A syscall can have at most 6 arguments, numbered from 0 to 5.
pub const ARG_NUMBER_MAX: u8 = 5;

/// BPF instruction structure definition.
/// See /usr/include/linux/filter.h .
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct sock_filter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// A compiled filter program, ready to be serialized or handed to a loader.
pub type BpfProgram = Vec<sock_filter>;

/// Builds a "jump" BPF instruction.
#[allow(non_snake_case)]
pub fn BPF_JUMP(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Builds a "statement" BPF instruction.
#[allow(non_snake_case)]
pub fn BPF_STMT(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

/// Byte offsets of the most and least significant 32-bit halves of a syscall
/// argument within `seccomp_data`, in that order.
///
/// Arguments are 64-bit but the BPF accumulator is 32-bit, so every argument
/// is addressed as two words whose order depends on host endianness.
pub fn arg_word_offsets(arg_number: u8) -> (u32, u32) {
    let arg_offset = SECCOMP_DATA_ARGS_OFFSET + u32::from(arg_number) * SECCOMP_DATA_ARG_SIZE;

    #[cfg(target_endian = "little")]
    {
        (arg_offset + SECCOMP_DATA_ARG_SIZE / 2, arg_offset)
    }
    #[cfg(target_endian = "big")]
    {
        (arg_offset, arg_offset + SECCOMP_DATA_ARG_SIZE / 2)
    }
}

/// Builds a sequence of BPF instructions that validate the underlying
/// architecture and kill the process on a mismatch.
///
/// Intended to be prepended to a compiled policy so that a filter built for
/// one syscall numbering cannot be confused by a caller switching ABIs.
pub fn validate_architecture() -> Vec<sock_filter> {
    vec![
        BPF_STMT(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH_OFFSET),
        BPF_JUMP(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH, 1, 0),
        BPF_STMT(BPF_RET | BPF_K, SECCOMP_RET_KILL),
    ]
}
