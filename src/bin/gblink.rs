use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{command, Arg, ArgAction};

use gbasm::diag::WarningConfig;
use gbasm::link;

const EXIT_ERRORS: u8 = 1;
const EXIT_USAGE: u8 = 64;

fn main() -> ExitCode {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("objects")
                .required(true)
                .num_args(1..)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The object modules to link"),
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write the ROM image to <FILE>"),
            Arg::new("sym")
                .short('s')
                .long("sym")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write a symbol file to <FILE>"),
            Arg::new("map")
                .short('m')
                .long("map")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write a map file to <FILE>"),
            Arg::new("overlay")
                .short('O')
                .long("overlay")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Fill gaps from this image instead of the pad byte"),
            Arg::new("pad")
                .short('p')
                .long("pad")
                .value_name("BYTE")
                .value_parser(clap::value_parser!(String))
                .help("Byte filling the gaps of the ROM image"),
            Arg::new("tiny")
                .short('t')
                .long("tiny")
                .action(ArgAction::SetTrue)
                .help("32 KiB mode: ROM0 spans the whole ROM, no ROMX"),
            Arg::new("dmg")
                .short('d')
                .long("dmg")
                .action(ArgAction::SetTrue)
                .help("Monochrome mode: forbid VRAM bank 1 (implies -w)"),
            Arg::new("wramx")
                .short('w')
                .long("contiguous-wram")
                .action(ArgAction::SetTrue)
                .help("Treat WRAM as one continuous block, no WRAMX"),
            Arg::new("warning")
                .short('W')
                .value_name("NAME")
                .value_parser(clap::value_parser!(String))
                .action(ArgAction::Append)
                .help("Warning control: NAME, no-NAME, error or error=NAME"),
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Print placement logging"),
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

    let mut opts = link::Options::default();
    opts.layout.tiny = matches.get_flag("tiny");
    opts.layout.dmg = matches.get_flag("dmg");
    opts.layout.contiguous_wram = matches.get_flag("wramx") || opts.layout.dmg;
    let mut warnings = WarningConfig::default();
    for flag in matches.get_many::<String>("warning").unwrap_or_default() {
        if let Err(error) = warnings.apply_flag(flag) {
            eprintln!("gblink: {}", error);
            return ExitCode::from(EXIT_USAGE);
        }
    }
    opts.warnings = warnings;
    if let Some(value) = matches.get_one::<String>("pad") {
        match parse_byte(value) {
            Some(byte) => opts.pad = byte,
            None => {
                eprintln!("gblink: `{}` is not a byte value", value);
                return ExitCode::from(EXIT_USAGE);
            }
        }
    }

    let objects: Vec<PathBuf> = matches
        .get_many::<PathBuf>("objects")
        .unwrap()
        .cloned()
        .collect();
    let output = matches.get_one::<PathBuf>("output").cloned();
    let sym = matches.get_one::<PathBuf>("sym").cloned();
    let map = matches.get_one::<PathBuf>("map").cloned();
    let overlay = matches.get_one::<PathBuf>("overlay").cloned();

    match run(&objects, output, sym, map, overlay, opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("gblink: {:#}", error);
            ExitCode::from(EXIT_ERRORS)
        }
    }
}

fn run(
    object_paths: &[PathBuf],
    output: Option<PathBuf>,
    sym: Option<PathBuf>,
    map: Option<PathBuf>,
    overlay: Option<PathBuf>,
    mut opts: link::Options,
) -> Result<()> {
    if let Some(overlay_path) = overlay {
        let bytes = fs::read(&overlay_path)
            .with_context(|| format!("Failed to read overlay '{}'", overlay_path.display()))?;
        opts.overlay = Some(bytes);
    }

    let mut objects = Vec::with_capacity(object_paths.len());
    for path in object_paths {
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open object file '{}'", path.display()))?;
        let data = unsafe { memmap2::Mmap::map(&file) }
            .with_context(|| format!("Failed to map object file '{}'", path.display()))?;
        let object = gbasm::read::parse(&data)
            .map_err(|error| anyhow!("{}", error))
            .with_context(|| format!("Failed to parse object file '{}'", path.display()))?;
        objects.push(object);
    }

    let result = link::link(objects, &opts).map_err(|error| anyhow!("{}", error))?;

    if let Some(out_path) = output {
        let image = result.rom_image(&opts).map_err(|error| anyhow!(error))?;
        fs::write(&out_path, image)
            .with_context(|| format!("Failed to write ROM image '{}'", out_path.display()))?;
    }
    if let Some(sym_path) = sym {
        let file = fs::File::create(&sym_path)
            .with_context(|| format!("Failed to create symbol file '{}'", sym_path.display()))?;
        let mut writer = BufWriter::new(file);
        result
            .write_sym(&mut writer)
            .and_then(|()| writer.flush())
            .with_context(|| format!("Failed to write symbol file '{}'", sym_path.display()))?;
    }
    if let Some(map_path) = map {
        let file = fs::File::create(&map_path)
            .with_context(|| format!("Failed to create map file '{}'", map_path.display()))?;
        let mut writer = BufWriter::new(file);
        result
            .write_map(&mut writer, &opts)
            .and_then(|()| writer.flush())
            .with_context(|| format!("Failed to write map file '{}'", map_path.display()))?;
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
