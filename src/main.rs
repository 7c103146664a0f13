use clap::{Parser, Subcommand};
use whisperdb::archive::ArchiveSpec;
use whisperdb::metadata::Aggregation;
use whisperdb::{Mapping, WhisperHandle};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "whisper-dump", version = "1.0.0", about = "Inspect and mutate whisper-format time-series files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print metadata and every archive's stored points, in the same layout
    /// the original whisper-dump tool used
    Dump { file: PathBuf },
    /// Create a new, zeroed whisper file with the given archive geometry
    Create {
        file: PathBuf,
        /// One or more "<seconds_per_point>:<points_count>" pairs, finest first
        #[arg(short, long, required = true, num_args = 1..)]
        archive: Vec<String>,
        #[arg(short = 'g', long, default_value = "average")]
        aggregation: String,
        #[arg(short, long, default_value = "0.5")]
        xff: f32,
    },
    /// Apply one observation, propagating it through coarser archives
    Update { file: PathBuf, timestamp: u32, value: f64 },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError { message, path }) => {
            eprintln!("{message}: {path}", path = path.display());
            ExitCode::FAILURE
        }
    }
}

struct CliError {
    message: String,
    path: PathBuf,
}

impl CliError {
    fn from_whisper(err: whisperdb::WhisperError, path: &std::path::Path) -> Self {
        let strerror = strerror(err.raw_os_error().unwrap_or(0));
        let message = format!("{err}: {strerror}");
        Self { message, path: path.to_path_buf() }
    }
}

/// `strerror(3)`-equivalent text for an errno, including the `errno == 0`
/// case the C reference always prints alongside every error (`"Success"`
/// on glibc) rather than omitting the segment for non-OS error kinds.
fn strerror(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

fn run() -> Result<(), CliError> {
    match Cli::parse().command {
        Commands::Dump { file } => dump(&file),
        Commands::Create { file, archive, aggregation, xff } => create(&file, &archive, &aggregation, xff),
        Commands::Update { file, timestamp, value } => update(&file, timestamp, value),
    }
}

fn dump(file: &PathBuf) -> Result<(), CliError> {
    let mut handle = WhisperHandle::open(file, Mapping::File).map_err(|e| CliError::from_whisper(e, file))?;

    let meta = *handle.metadata();
    println!("Meta data:");
    println!("  aggregation_type = {}", meta.aggregation.as_u32());
    println!("  max_retention = {}", meta.max_retention);
    println!("  xff = {:.6}", meta.x_files_factor);
    println!("  archives_count = {}", meta.archives_count);
    println!();

    let archives = handle.archives().to_vec();
    for (i, ai) in archives.iter().enumerate() {
        println!("Archive #{i} info:");
        println!("  offset = {}", ai.offset);
        println!("  seconds_per_point = {}", ai.seconds_per_point);
        println!("  points = {}", ai.points_count);
        println!("  points_size = {}", ai.points_size());
        println!();

        let points = handle.load_all_points(i).map_err(|e| CliError::from_whisper(e, file))?;
        println!("Archive #{i} data:");
        for (j, point) in points.iter().enumerate() {
            println!("{j}: {}, {:.4}", point.timestamp, point.value);
        }
        println!();
    }

    Ok(())
}

fn create(file: &PathBuf, archive_args: &[String], aggregation: &str, xff: f32) -> Result<(), CliError> {
    let specs: Vec<ArchiveSpec> = archive_args
        .iter()
        .map(|s| parse_archive_spec(s))
        .collect::<Result<_, _>>()
        .map_err(|message| CliError { message, path: file.clone() })?;

    let aggregation = parse_aggregation(aggregation).map_err(|message| CliError { message, path: file.clone() })?;

    WhisperHandle::create(file, Mapping::File, &specs, aggregation, xff).map_err(|e| CliError::from_whisper(e, file))?;
    println!("Created: {}", file.display());
    Ok(())
}

fn update(file: &PathBuf, timestamp: u32, value: f64) -> Result<(), CliError> {
    let mut handle = WhisperHandle::open(file, Mapping::File).map_err(|e| CliError::from_whisper(e, file))?;
    handle.update(timestamp, value).map_err(|e| CliError::from_whisper(e, file))?;
    println!("Updated: {} @ {timestamp} = {value}", file.display());
    Ok(())
}

fn parse_archive_spec(s: &str) -> Result<ArchiveSpec, String> {
    let (spp, count) = s.split_once(':').ok_or_else(|| format!("invalid archive spec '{s}', expected <spp>:<count>"))?;
    let seconds_per_point = spp.parse().map_err(|_| format!("invalid seconds_per_point in '{s}'"))?;
    let points_count = count.parse().map_err(|_| format!("invalid points_count in '{s}'"))?;
    Ok(ArchiveSpec { seconds_per_point, points_count })
}

fn parse_aggregation(s: &str) -> Result<Aggregation, String> {
    match s {
        "average" | "avg" => Ok(Aggregation::Average),
        "sum" => Ok(Aggregation::Sum),
        "last" => Ok(Aggregation::Last),
        "max" => Ok(Aggregation::Max),
        "min" => Ok(Aggregation::Min),
        other => Err(format!("unknown aggregation '{other}'")),
    }
}
