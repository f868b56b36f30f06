//! rejig CLI - reconstruct a disc image from a jigdo manifest.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use rejig::assemble::{AssembleConfig, AssembleReport, Assembler, ProgressFn};
use rejig::fetch::HttpFetcher;
use rejig::image::ImageFile;
use rejig::jigdo::Manifest;
use rejig::{mirror, template};

#[derive(Parser)]
#[command(name = "rejig")]
#[command(about = "Reconstruct a disc image from a jigdo manifest", long_about = None)]
struct Args {
    /// Path to the .jigdo manifest (plain or gzipped)
    jigdo: PathBuf,

    /// Output image path (default: the manifest's Filename)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Template path (default: the manifest's Template, next to the manifest)
    #[arg(long, short)]
    template: Option<PathBuf>,

    /// Number of concurrent download workers
    #[arg(long, short = 'j', default_value_t = 16)]
    threads: usize,

    /// Add a mirror as NAME=URL_or_path (repeatable)
    #[arg(long, short)]
    mirror: Vec<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(report) => {
            println!(
                "Image complete: {} files ({} resumed, {} local), md5 {}",
                report.files_total, report.files_resumed, report.files_local, report.md5
            );
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "rejig=warn",
        1 => "rejig=info",
        _ => "rejig=debug",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // Logs go to stderr so the progress line owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args) -> Result<AssembleReport, Box<dyn std::error::Error>> {
    let mut manifest = Manifest::load(&args.jigdo)?;

    for definition in &args.mirror {
        manifest.add_mirror(definition)?;
    }

    let local_files = mirror::resolve_local_matches(&mut manifest);
    if local_files > 0 {
        println!(
            "{} files were found locally and do not need to be fetched.",
            local_files
        );
    }

    let template_path = resolve_template_path(args, &manifest);
    let mut template_file = File::open(&template_path)
        .map_err(|e| format!("unable to open template {}: {}", template_path.display(), e))?;

    let table = template::read_desc_table(&mut template_file)?;
    println!(
        "Template: {} data regions, {} component files, image size {} bytes",
        table.data_blocks.len(),
        table.files.len(),
        table.image_info.size
    );

    let image_path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&manifest.image_name));

    let image = Arc::new(ImageFile::create(&image_path, table.image_info.size)?);
    template::write_data_blocks(&mut template_file, &image, &table)?;

    let config = AssembleConfig::default().with_workers(args.threads);
    let report = Assembler::new(config).run(
        image,
        Arc::new(manifest),
        &table,
        Arc::new(HttpFetcher::new()?),
        Some(progress_line()),
    )?;
    println!();

    Ok(report)
}

/// The template named on the command line, or the manifest's template
/// resolved next to the manifest file.
fn resolve_template_path(args: &Args, manifest: &Manifest) -> PathBuf {
    if let Some(path) = &args.template {
        return path.clone();
    }

    let named = PathBuf::from(&manifest.template_name);
    if named.is_absolute() {
        return named;
    }

    match args.jigdo.parent() {
        Some(dir) => dir.join(named),
        None => named,
    }
}

/// An in-place progress line, rewritten as completion counts change.
fn progress_line() -> ProgressFn {
    Box::new(|snapshot| {
        print!(
            "\r{} of {} files ({}/{} kB) done",
            snapshot.files_done,
            snapshot.files_total,
            snapshot.bytes_done / 1024,
            snapshot.bytes_total / 1024
        );
        std::io::stdout().flush().ok();
    })
}
