use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use usbforge::report::LogSink;
use usbforge::run::{Orchestrator, PersistenceRequest, RunOptions};
use usbforge::tools::{HostFormatter, HostMounter};
use usbforge::{config, Error, FsKind, TableKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> &'static str {
    "Usage: usbforge -i <image.iso> -o <device> [OPTIONS]

Options:
  -i <file>      Input ISO image
  -o <device>    Output device (whole disk, e.g. /dev/sdb)
  -p <size>      Add a persistence partition of <size> MiB
  -f <fs>        Persistence filesystem (ext4, ntfs, exfat, fat32, fat64)
  -t <type>      Partition table type (mbr or gpt)
  -m, --fast     Zero-copy burn mode
  --no-verify    Skip the post-burn read-back check
  --dry-run      Report the plan without touching the device
  --force        Skip the confirmation prompt
  -V, --version  Print version
  -h, --help     Print this help

Examples:
  usbforge -i ubuntu.iso -o /dev/sdb
  usbforge -i ubuntu.iso -o /dev/sdb -p 4096 -f ext4
  usbforge -i linux.iso -o /dev/sdc -m -t gpt --force

Note: destructive; the whole device is rewritten. Requires root."
}

struct Args {
    iso_path: Option<PathBuf>,
    device: Option<PathBuf>,
    persistence_mib: Option<u64>,
    persistence_fs: Option<FsKind>,
    table: Option<TableKind>,
    fast_mode: Option<bool>,
    verify: Option<bool>,
    dry_run: bool,
    force: bool,
}

fn parse_args(argv: &[String]) -> Result<Args, Error> {
    let mut args = Args {
        iso_path: None,
        device: None,
        persistence_mib: None,
        persistence_fs: None,
        table: None,
        fast_mode: None,
        verify: None,
        dry_run: false,
        force: false,
    };

    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("{flag} requires a value")))
        };

        match arg.as_str() {
            "-i" => args.iso_path = Some(PathBuf::from(value("-i")?)),
            "-o" => args.device = Some(PathBuf::from(value("-o")?)),
            "-p" => {
                let raw = value("-p")?;
                let size = raw.parse::<u64>().map_err(|_| {
                    Error::InvalidArgument(format!("invalid persistence size '{raw}'"))
                })?;
                args.persistence_mib = Some(size);
            }
            "-f" => args.persistence_fs = Some(FsKind::from_str(&value("-f")?)?),
            "-t" => {
                args.table = Some(match value("-t")?.to_ascii_lowercase().as_str() {
                    "mbr" => TableKind::Mbr,
                    "gpt" => TableKind::Gpt,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "invalid partition table type '{other}' (use 'mbr' or 'gpt')"
                        )))
                    }
                })
            }
            "-m" | "--fast" => args.fast_mode = Some(true),
            "--no-verify" => args.verify = Some(false),
            "--dry-run" => args.dry_run = true,
            "--force" => args.force = true,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unknown option '{other}'\n\n{}",
                    usage()
                )))
            }
        }
    }

    Ok(args)
}

fn confirm(device: &std::path::Path) -> bool {
    print!(
        "\nWARNING: all data on {} will be destroyed!\nContinue? (yes/no): ",
        device.display()
    );
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim() == "yes"
}

fn build_options(args: Args) -> Result<RunOptions, Error> {
    let iso_path = args
        .iso_path
        .ok_or_else(|| Error::InvalidArgument(format!("-i is required\n\n{}", usage())))?;
    let device = args
        .device
        .ok_or_else(|| Error::InvalidArgument(format!("-o is required\n\n{}", usage())))?;

    if args.persistence_mib.is_none() && args.persistence_fs.is_some() {
        return Err(Error::InvalidArgument(
            "-f only makes sense together with -p".into(),
        ));
    }

    let defaults = config::load_default()?.defaults;

    let mut opts = RunOptions::new(iso_path, device);
    opts.dry_run = args.dry_run;
    opts.fast_mode = args
        .fast_mode
        .or(defaults.fast_mode)
        .unwrap_or(false);
    opts.verify = args.verify.or(defaults.verify).unwrap_or(true);
    opts.table = match args.table {
        Some(table) => table,
        None => defaults.partition_table()?.unwrap_or(TableKind::Mbr),
    };
    opts.persistence = match args.persistence_mib {
        None => None,
        Some(size_mib) => {
            let fs = match args.persistence_fs {
                Some(fs) => fs,
                None => defaults.persistence_fs()?.unwrap_or(FsKind::Ext4),
            };
            Some(PersistenceRequest { size_mib, fs })
        }
    };

    Ok(opts)
}

fn run() -> Result<(), Error> {
    let argv: Vec<String> = std::env::args().skip(1).collect();

    if argv.is_empty() || argv.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", usage());
        return Ok(());
    }
    if argv.iter().any(|a| a == "-V" || a == "--version") {
        println!("usbforge {VERSION}");
        return Ok(());
    }

    let args = parse_args(&argv)?;
    let force = args.force;
    let opts = build_options(args)?;

    if !opts.dry_run && !force && !confirm(&opts.device) {
        return Err(Error::Interrupted);
    }

    let mounter = HostMounter;
    let formatter = HostFormatter;
    let sink = LogSink;
    Orchestrator::new(&mounter, &formatter, &sink).run(&opts)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Interrupted) => {
            log::info!("operation cancelled by user");
            ExitCode::SUCCESS
        }
        Err(err @ Error::Permission { .. }) => {
            log::error!("{err}");
            log::error!("re-run with sudo");
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
