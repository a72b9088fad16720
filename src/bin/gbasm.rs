use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{command, Arg, ArgAction};

use gbasm::asm;
use gbasm::diag::WarningConfig;

/// Exit codes: 0 on success, 1 when diagnostics were errors, 64 for
/// usage mistakes.
const EXIT_ERRORS: u8 = 1;
const EXIT_USAGE: u8 = 64;

fn main() -> ExitCode {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("input")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The assembly source file"),
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write the object module to <FILE>"),
            Arg::new("include")
                .short('i')
                .long("include")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Append)
                .help("Add a directory to the INCLUDE/INCBIN search path"),
            Arg::new("dependfile")
                .short('M')
                .long("dependfile")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write a make-style dependency rule to <FILE>"),
            Arg::new("recursion-depth")
                .short('r')
                .long("recursion-depth")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("Limit the include/macro/loop nesting depth"),
            Arg::new("warning")
                .short('W')
                .value_name("NAME")
                .value_parser(clap::value_parser!(String))
                .action(ArgAction::Append)
                .help("Warning control: NAME, no-NAME, error or error=NAME"),
            Arg::new("optimize-loads")
                .short('l')
                .long("optimize-loads")
                .action(ArgAction::SetTrue)
                .help("Rewrite `ld a, [$FFxx]` to the ldh form"),
            Arg::new("pad-value")
                .short('p')
                .long("pad-value")
                .value_name("BYTE")
                .value_parser(clap::value_parser!(String))
                .help("Byte used by DS and ALIGN padding"),
            Arg::new("fix-precision")
                .short('Q')
                .long("fix-precision")
                .value_name("N")
                .value_parser(clap::value_parser!(String))
                .help("Default fixed-point fraction width (1-31)"),
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Print debug logging"),
        ])
        .try_get_matches();
    let matches = match matches {
        Ok(matches) => matches,
        Err(error)
            if matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = error.print();
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if matches.get_flag("verbose") {
        env_logger::builder()
            .format_level(false)
            .format_target(false)
            .filter_module("gbasm", log::LevelFilter::Debug)
            .init();
    }

    let mut opts = asm::Options::default();
    opts.include_paths = matches
        .get_many::<PathBuf>("include")
        .unwrap_or_default()
        .cloned()
        .collect();
    if let Some(&depth) = matches.get_one::<usize>("recursion-depth") {
        opts.max_depth = depth;
    }
    opts.optimize_loads = matches.get_flag("optimize-loads");
    let mut warnings = WarningConfig::default();
    for flag in matches.get_many::<String>("warning").unwrap_or_default() {
        if let Err(error) = warnings.apply_flag(flag) {
            eprintln!("gbasm: {}", error);
            return ExitCode::from(EXIT_USAGE);
        }
    }
    opts.warnings = warnings;
    if let Some(value) = matches.get_one::<String>("pad-value") {
        match parse_byte(value) {
            Some(byte) => opts.pad_byte = byte,
            None => {
                eprintln!("gbasm: `{}` is not a byte value", value);
                return ExitCode::from(EXIT_USAGE);
            }
        }
    }
    if let Some(value) = matches.get_one::<String>("fix-precision") {
        match value.parse::<u8>() {
            Ok(q @ 1..=31) => opts.fix_precision = q,
            _ => {
                eprintln!("gbasm: `{}` is not a precision between 1 and 31", value);
                return ExitCode::from(EXIT_USAGE);
            }
        }
    }

    let input = matches.get_one::<PathBuf>("input").unwrap();
    let output = matches.get_one::<PathBuf>("output");
    let dependfile = matches.get_one::<PathBuf>("dependfile");

    match run(input, output, dependfile, &opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("gbasm: {:#}", error);
            ExitCode::from(EXIT_ERRORS)
        }
    }
}

fn run(
    input: &PathBuf,
    output: Option<&PathBuf>,
    dependfile: Option<&PathBuf>,
    opts: &asm::Options,
) -> Result<()> {
    let result = asm::assemble_file(input, opts)
        .map_err(|error| anyhow::anyhow!("{}", error))
        .with_context(|| format!("Failed to assemble '{}'", input.display()))?;

    if let Some(out_path) = output {
        let file = fs::File::create(out_path)
            .with_context(|| format!("Failed to create output file '{}'", out_path.display()))?;
        let mut writer = BufWriter::new(file);
        gbasm::write::write_object(&mut writer, &result.object)
            .and_then(|()| writer.flush())
            .with_context(|| format!("Failed to write object file '{}'", out_path.display()))?;
    }

    if let Some(dep_path) = dependfile {
        let target = output
            .cloned()
            .unwrap_or_else(|| input.with_extension("o"));
        let mut rule = format!("{}: {}", target.display(), input.display());
        for dep in &result.dependencies {
            rule.push(' ');
            rule.push_str(&dep.display().to_string());
        }
        rule.push('\n');
        fs::write(dep_path, rule).with_context(|| {
            format!("Failed to write dependency file '{}'", dep_path.display())
        })?;
    }
    Ok(())
}

/// Accept `$2F`, `0x2F` or decimal for byte-valued flags.
fn parse_byte(text: &str) -> Option<u8> {
    let value = if let Some(hex) = text.strip_prefix('$') {
        u32::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        text.parse().ok()?
    };
    u8::try_from(value).ok()
}
