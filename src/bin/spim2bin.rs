use std::{
    error::Error,
    fs::{self, File},
    io::{self, BufReader},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use spim2bin::{Config, Converter, Endian, FileSink};
use tracing::Level;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// SPIM memory dump (output of `dump` / "save memory")
    input: Option<PathBuf>,

    /// Config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the section files (default: current directory)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Byte order of the section files: `native`, `little`, or `big`
    #[arg(short, long)]
    endian: Option<Endian>,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = main_real(args) {
        tracing::error!("{e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_real(args: Args) -> Result<(), Box<dyn Error>> {
    // a missing or unreadable dump is reported, but is not a failure
    let Some(input) = args.input else {
        tracing::warn!("not enough arguments");
        return Ok(());
    };

    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("cant open file: {e}"))?;
            Config::from_toml(&text).map_err(|e| format!("in file: {}: {e}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(dir) = args.out_dir {
        config.out_dir = dir;
    }
    if let Some(endian) = args.endian {
        config.endian = endian;
    }
    if config.width == 0 {
        Err("line width must be at least 1")?;
    }

    let file = match File::open(&input) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("failed to open file {}: {e}", input.display());
            return Ok(());
        }
    };

    tracing::trace!(
        "converting {} ({} endian, width {})",
        input.display(),
        config.endian,
        config.width
    );
    let sink = FileSink::new(&input, &config.out_dir, config.endian);
    let mut conv = Converter::new(sink, config.width);
    conv.run(BufReader::new(file))
        .map_err(|e| format!("in file: {}: {e}", input.display()))?;
    let (sink, report) = conv.finish()?;

    for (segment, words) in &report {
        tracing::debug!(
            "{segment}: {} ({words} words)",
            sink.path(*segment).display()
        );
    }
    Ok(())
}
