//! `steelc` binary: CLI front end, test-mode directory walk, and the
//! `nasm`/`ld` subprocess invocations. Everything about the language itself
//! lives in the library (`steelc::compile`); this file only implements the
//! external interface.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use steelc::cli::{self, Args};
use steelc::error::Error;

fn main() {
    if let Err(err) = run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let args = cli::parse()?;
    match &args.test_dir {
        Some(dir) => run_test_mode(dir),
        None => compile_to_binary(&args),
    }
}

/// `-t <dir>`: compile every entry of `<dir>` (excluding `.`, `..`, and
/// `include.sc`) end to end, discarding the emitted assembly; any fatal
/// error aborts the whole run with a non-zero exit, exactly as a single
/// failing file would outside test mode.
fn run_test_mode(dir: &Path) -> Result<(), Error> {
    let entries = fs::read_dir(dir)
        .map_err(|err| Error::Io(err, steelc::error::IoContext::OpenTestDir, dir.to_owned()))?;

    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::Io(err, steelc::error::IoContext::OpenTestDir, dir.to_owned())
        })?;
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some("include.sc") {
            continue;
        }
        if !path.is_file() {
            continue;
        }
        println!("Testing '{}'...", path.display());
        steelc::compile(&path)?;
        println!("Test passed.");
    }
    Ok(())
}

fn compile_to_binary(args: &Args) -> Result<(), Error> {
    let input = args.input.as_ref().expect("validated by cli::parse");
    let asm = steelc::compile(input)?;

    let base = cli::output_base_name(input);
    let asm_path = PathBuf::from(format!("{}.asm", base));
    let obj_path = PathBuf::from(format!("{}.o", base));

    fs::write(&asm_path, asm).map_err(|err| {
        Error::Io(err, steelc::error::IoContext::WriteOutput, asm_path.clone())
    })?;

    if args.stop_after_asm {
        return Ok(());
    }

    run_tool(
        "nasm",
        &["-felf64", &asm_path.to_string_lossy(), "-o", &obj_path.to_string_lossy()],
        "assemble",
    )?;
    let _ = fs::remove_file(&asm_path);

    if args.stop_after_obj {
        return Ok(());
    }

    run_tool(
        "ld",
        &[
            "-emain_",
            &obj_path.to_string_lossy(),
            "-o",
            &args.output.to_string_lossy(),
        ],
        "link",
    )?;
    let _ = fs::remove_file(&obj_path);

    Ok(())
}

/// Runs an external assembler/linker step; a non-zero exit or a failure to
/// even launch the process is a fatal diagnostic.
fn run_tool(program: &str, args: &[&str], step: &'static str) -> Result<(), Error> {
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|_| Error::Tool { tool: step, file: program.to_owned() })?;
    if !status.success() {
        return Err(Error::Tool { tool: step, file: program.to_owned() });
    }
    Ok(())
}
