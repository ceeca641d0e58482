// ============================================
// RTA Builder - main.rs
// ============================================
// Command line front-end for the image builder.
//
//   rtabuilder build --iso kali.iso --tool Nmap --tool "Burp Suite" --vhd
//   rtabuilder probe
//   rtabuilder tools
//   rtabuilder download [URL] [--dest FILE]
//
// The build runs on its own worker thread (BuildPipeline::spawn); this thread
// just prints the event stream and waits for the outcome.
// ============================================

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rtabuilder::catalog;
use rtabuilder::config::{app_data_dir, ensure_app_dirs, BuilderConfig, DEFAULT_ISO_URL};
use rtabuilder::create::creation_plan;
use rtabuilder::download::{download_file, format_size};
use rtabuilder::extract::extraction_plan;
use rtabuilder::progress::Reporter;
use rtabuilder::{
    probe, validate_job, BuildJob, BuildOutcome, BuildPipeline, DefaultMutation, OutputFormat, StopFlag,
};

/// RTA Builder - rebuild a customised bootable image from a source ISO
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less log output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Settings file (default: ./rtabuilder.toml if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a customised image
    Build {
        /// Source ISO
        #[arg(long, value_name = "FILE")]
        iso: PathBuf,

        /// Where the image (and the build workspace) go
        #[arg(short, long, value_name = "DIR")]
        output_folder: Option<PathBuf>,

        /// Folder holding one sub-folder per tool, plus branding/
        #[arg(long, value_name = "DIR")]
        tools_folder: Option<PathBuf>,

        /// Tool to add (repeatable). Defaults to the catalog's selection.
        #[arg(short, long = "tool", value_name = "NAME")]
        tools: Vec<String>,

        #[arg(long)]
        hostname: Option<String>,

        /// Volume label of the new image
        #[arg(long, value_name = "LABEL")]
        label: Option<String>,

        /// Copy branding assets into the image
        #[arg(long)]
        branding: bool,

        /// Also write a fixed-size VHD
        #[arg(long)]
        vhd: bool,

        /// Also write a raw disk image for cloud (AMI) import
        #[arg(long)]
        ami: bool,

        /// Leave the extracted tree in place after the build
        #[arg(long)]
        keep_workspace: bool,
    },

    /// Show which external tools were found and the strategy order
    Probe,

    /// List the tool catalog
    Tools,

    /// Download a source ISO
    Download {
        #[arg(default_value = DEFAULT_ISO_URL)]
        url: String,

        /// Destination file (default: ~/RTA_Builder/downloads/<name>)
        #[arg(long, value_name = "FILE")]
        dest: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = BuilderConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Build {
            iso,
            output_folder,
            tools_folder,
            tools,
            hostname,
            label,
            branding,
            vhd,
            ami,
            keep_workspace,
        } => {
            let mut config = config;
            config.keep_workspace |= keep_workspace;
            if let Some(folder) = output_folder {
                config.output_folder = folder;
            }
            if tools_folder.is_some() {
                config.tools_folder = tools_folder;
            }

            let mut job = new_job(&config, iso)?;
            job.content_items = if tools.is_empty() {
                catalog::selected_names(&catalog::load_or_create(&config.catalog_path)?)
            } else {
                tools
            };
            job.hostname = hostname.unwrap_or_else(|| config.default_hostname.clone());
            job.volume_label = label.unwrap_or_else(|| config.default_volume_label.clone());
            job.branding = branding;
            if vhd {
                job.extra_formats.push(OutputFormat::Vhd);
            }
            if ami {
                job.extra_formats.push(OutputFormat::RawDisk);
            }
            build(&config, job)
        }
        Commands::Probe => {
            print_capabilities(&config);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tools => {
            list_tools(&config.catalog_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Download { url, dest } => {
            let dest = match dest {
                Some(dest) => dest,
                None => default_download_path(&url)?,
            };
            let mut reporter = Reporter::new(print_event);
            let written = download_file(&url, &dest, &StopFlag::new(), &mut reporter)?;
            println!("Saved {} ({})", dest.display(), format_size(written));
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ============================================
// BUILD
// ============================================

/// Output and workspace names are timestamped so repeated builds never collide
fn new_job(config: &BuilderConfig, iso: PathBuf) -> Result<BuildJob> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let output_folder = &config.output_folder;
    std::fs::create_dir_all(output_folder)
        .with_context(|| format!("Failed to create output folder {}", output_folder.display()))?;

    Ok(BuildJob::new(
        iso,
        output_folder.join(format!("kali-rta-custom_{}.iso", timestamp)),
        output_folder.join(format!("build_{}", timestamp)),
    ))
}

fn build(config: &BuilderConfig, job: BuildJob) -> Result<ExitCode> {
    for warning in validate_job(&job)? {
        println!("Warning: {}", warning);
    }

    println!("Source:    {}", job.source_image.display());
    println!("Output:    {}", job.output_image.display());
    println!("Workspace: {}", job.workspace.display());
    println!("Tools:     {}", display_list(&job.content_items));
    println!();

    let mutation = DefaultMutation::new(config.tools_folder.clone());
    let handle = BuildPipeline::new(probe(config), config).spawn(job, Box::new(mutation), print_event);

    let code = match handle.join() {
        BuildOutcome::Done(report) => {
            println!();
            println!("Image:     {}", report.output.display());
            println!("Extracted: {}", report.extraction);
            println!("Created:   {:?} ({})", report.tier, report.artifact.describe());
            for extra in &report.extra_outputs {
                println!("Also:      {}", extra.display());
            }
            if report.degraded {
                println!("Warning: the output is not a bootable image (degraded build)");
            }
            ExitCode::SUCCESS
        }
        BuildOutcome::Cancelled => {
            println!("Build cancelled");
            ExitCode::from(2)
        }
        BuildOutcome::Failed { stage, detail } => {
            eprintln!("Build failed during {}: {}", stage, detail);
            ExitCode::FAILURE
        }
    };
    Ok(code)
}

fn print_event(message: &str, percent: Option<u8>) {
    match percent {
        Some(percent) => println!("[{:>3}%] {}", percent, message),
        None => println!("       {}", message),
    }
}

fn display_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

// ============================================
// PROBE / TOOLS / DOWNLOAD
// ============================================

fn print_capabilities(config: &BuilderConfig) {
    let caps = probe(config);
    let show = |name: &str, path: &Option<PathBuf>| match path {
        Some(path) => println!("  {:<12} {}", name, path.display()),
        None => println!("  {:<12} not found", name),
    };

    println!("External tools:");
    show("7-Zip", &caps.archiver);
    show("oscdimg", &caps.masterer);
    show("PowerShell", &caps.script_host);

    println!();
    println!("Extraction order:");
    for (index, strategy) in extraction_plan(&caps).iter().enumerate() {
        println!("  {}. {}", index + 1, strategy.name());
    }
    println!("Creation order:");
    for (index, strategy) in creation_plan(&caps).iter().enumerate() {
        let note = if strategy.tier().is_degraded() { " (not bootable)" } else { "" };
        println!("  {}. {}{}", index + 1, strategy.name(), note);
    }
}

fn list_tools(catalog_path: &Path) -> Result<()> {
    let catalog = catalog::load_or_create(catalog_path)?;
    for (category, entries) in catalog::by_category(&catalog) {
        println!("{}", category);
        for entry in entries {
            let mark = if entry.selected { "x" } else { " " };
            println!("  [{}] {:<18} {}", mark, entry.name, entry.description);
        }
    }
    Ok(())
}

fn default_download_path(url: &str) -> Result<PathBuf> {
    let root = app_data_dir();
    ensure_app_dirs(&root)?;

    let name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("source.iso");
    Ok(root.join("downloads").join(name))
}
