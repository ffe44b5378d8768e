// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Command-line front end: compiles a policy file and writes the serialized
//! BPF program, or dumps the instruction listing for inspection.

use std::fmt::Write as _;
use std::fs::{read_to_string, File};
use std::path::PathBuf;

use clap::Parser;
use log::info;
use policyc::bpf::validate_architecture;
use policyc::{compile_policy, sock_filter, BpfProgram};

const EXIT_CODE_ERROR: i32 = 1;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Failed to operate file: {0}")]
    FileIo(#[from] std::io::Error),
    #[error("{0}")]
    Policy(#[from] policyc::Error),
    #[error("Failed to serialize the compiled program: {0}")]
    Serialize(#[from] bincode::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Parser)]
#[command(version, about = "Compiles syscall-filter policies into seccomp BPF programs.")]
struct Cli {
    /// Path of the policy file.
    #[arg(short, long, value_name = "PATH")]
    input_file: PathBuf,
    /// Path of the serialized output program.
    #[arg(short, long, value_name = "PATH", default_value = "policy_filter.bpf")]
    output_file: PathBuf,
    /// Do not prepend the architecture validation prologue.
    #[arg(long)]
    skip_arch_check: bool,
    /// Print the instruction listing instead of writing the output file.
    #[arg(long)]
    dump: bool,
}

fn build_program(src: &str, skip_arch_check: bool) -> Result<BpfProgram> {
    let mut program = if skip_arch_check {
        Vec::new()
    } else {
        validate_architecture()
    };
    program.extend(compile_policy(src)?);
    Ok(program)
}

fn render_listing(program: &[sock_filter]) -> String {
    let mut listing = String::new();
    for (index, instruction) in program.iter().enumerate() {
        let _ = writeln!(
            listing,
            "{:4}: code=0x{:04x} jt={:3} jf={:3} k=0x{:08x}",
            index, instruction.code, instruction.jt, instruction.jf, instruction.k
        );
    }
    listing
}

fn run(cli: Cli) -> Result<()> {
    let src = read_to_string(&cli.input_file)?;
    let program = build_program(&src, cli.skip_arch_check)?;
    info!(
        "compiled {} into {} instructions",
        cli.input_file.display(),
        program.len()
    );

    if cli.dump {
        print!("{}", render_listing(&program));
        return Ok(());
    }

    let output = File::create(&cli.output_file)?;
    bincode::serialize_into(output, &program)?;
    info!("wrote {}", cli.output_file.display());

    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_CODE_ERROR);
    }
}
