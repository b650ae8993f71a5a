mod dump;
mod replay;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dump::exec_dump;
use log::LevelFilter;
use logvol::{FileRegistry, LogFile, LogVolOptions, PType};
use logvol_error::LogVolResult;
use logvol_io::{FileStorage, SelfComm};
use replay::exec_replay;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

#[derive(clap::Parser)]
struct Cli {
    /// Log engine activity to stderr, more with each repetition.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Print the summary, datasets and metadata index of a container.
    Dump {
        file: PathBuf,
        /// Load the index in steps of at most this many bytes of records.
        #[clap(long)]
        budget: Option<u64>,
    },
    /// Assemble a dataset from its log and write it out as a dense row-major array.
    Replay {
        file: PathBuf,
        dataset: String,
        out: PathBuf,
        /// Element type of the output, the dataset's own type by default.
        #[clap(long = "type")]
        ptype: Option<PType>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let result = match cli.command {
        Commands::Dump { file, budget } => exec_dump(file, budget),
        Commands::Replay {
            file,
            dataset,
            out,
            ptype,
        } => exec_replay(file, &dataset, out, ptype),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lvx: {err}");
            ExitCode::from(u8::try_from(err.status().unsigned_abs()).unwrap_or(1))
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        filter,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .ok();
}

/// Open a container file as the only rank of its communicator.
fn open(path: PathBuf) -> LogVolResult<LogFile> {
    let storage = FileStorage::open(path)?;
    LogFile::open(
        Arc::new(SelfComm),
        Arc::new(storage),
        &FileRegistry::new(),
        LogVolOptions::new(),
    )
}
