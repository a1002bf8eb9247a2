//! Command-line argument parsing for the `steelc` binary.
//!
//! Declarative `App`/`Arg` wiring plus manual cross-field validation
//! afterwards — clap 2's `conflicts_with` machinery doesn't express
//! "`-t` forbids the positional `INPUT`" cleanly when both are otherwise
//! optional, so that check is done by hand.

use crate::error::Error;
use clap::Arg;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    /// `None` only when `test_dir` is set — the two are mutually exclusive.
    pub input: Option<PathBuf>,
    pub output: PathBuf,
    pub test_dir: Option<PathBuf>,
    /// `-S`: stop after emitting `<base>.asm`.
    pub stop_after_asm: bool,
    /// `-c`: stop after assembling `<base>.o` (implied by `-S`).
    pub stop_after_obj: bool,
}

pub fn parse() -> Result<Args, Error> {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUT")
                .help("The source file to compile")
                .index(1),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .takes_value(true)
                .value_name("OUTPUT")
                .help("Place the output into <output file> (default: a.out)"),
        )
        .arg(
            Arg::with_name("test_dir")
                .short("t")
                .takes_value(true)
                .value_name("TEST_DIR")
                .help("(Development only) compile every file in <test directory> and discard output"),
        )
        .arg(
            Arg::with_name("S")
                .short("S")
                .help("Output only the assembly file"),
        )
        .arg(
            Arg::with_name("c")
                .short("c")
                .help("Output only the object file"),
        )
        .get_matches();

    let input = matches.value_of("INPUT").map(PathBuf::from);
    let output = matches
        .value_of("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("a.out"));
    let test_dir = matches.value_of("test_dir").map(PathBuf::from);
    let stop_after_asm = matches.is_present("S");
    let stop_after_obj = matches.is_present("c") || stop_after_asm;

    if test_dir.is_some() && input.is_some() {
        return Err(Error::Cli(
            "<input file> is not allowed together with -t <test directory>".to_owned(),
        ));
    }
    if test_dir.is_none() && input.is_none() {
        return Err(Error::Cli("missing argument <input file>".to_owned()));
    }

    Ok(Args {
        input,
        output,
        test_dir,
        stop_after_asm,
        stop_after_obj,
    })
}

/// Strips any directory components from `input`, then drops its extension
/// (if any). The `.asm`/`.o` intermediate files share this base; `-o`'s
/// argument is independent and untouched.
pub fn output_base_name(input: &std::path::Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn output_filename_rule_strips_dirs_and_extension() {
        assert_eq!(output_base_name(Path::new("src/foo.sc")), "foo");
        assert_eq!(output_base_name(Path::new("bar")), "bar");
        assert_eq!(output_base_name(Path::new("./a/b/c.sc")), "c");
    }
}
