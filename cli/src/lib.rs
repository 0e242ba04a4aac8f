use std::cmp::Ordering;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;

use daqifi::firmware::releases::{ReleaseChannel, ReleaseClient, ReleaseClientOptions};
use daqifi::firmware::version::compare_version_strings;
use daqifi::sd::{SdParserOptions, open_log, parse_file_listing};

#[derive(Parser, Debug)]
#[command(version, about = "Operator tooling for DAQiFi data-acquisition devices")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert an SD-card log file to newline-delimited JSON on stdout.
    Convert(ConvertArgs),
    /// Parse a saved `SYSTem:STORage:SD:LIST?` response.
    FileList(FileListArgs),
    /// Compare two firmware version strings.
    VersionCompare(VersionCompareArgs),
    /// Query or download released firmware.
    Releases(ReleasesArgs),
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Path to a log_YYYYMMDD_HHMMSS.{bin,json,dat,csv} file.
    path: PathBuf,

    /// Tick frequency to assume when the file does not state one.
    #[arg(long)]
    fallback_frequency: Option<u32>,
}

#[derive(Parser, Debug)]
struct FileListArgs {
    /// Path to a file holding the listing, one entry per line.
    path: PathBuf,
}

#[derive(Parser, Debug)]
struct VersionCompareArgs {
    first: String,
    second: String,
}

#[derive(Parser, Debug)]
struct ReleasesArgs {
    /// Check the WiFi radio module channel instead of the main firmware.
    #[arg(long)]
    wifi: bool,

    /// Include pre-releases.
    #[arg(long)]
    prerelease: bool,

    /// Asset file-name extension to surface.
    #[arg(long, default_value = ".hex")]
    asset_extension: String,

    /// Download the selected asset into this directory.
    #[arg(long)]
    download_to: Option<PathBuf>,
}

pub async fn main_cli() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match args.command {
        Command::Convert(args) => convert(args).await,
        Command::FileList(args) => file_list(args).await,
        Command::VersionCompare(args) => version_compare(args),
        Command::Releases(args) => releases(args).await,
    }
}

async fn convert(args: ConvertArgs) -> Result<()> {
    let file_name = args
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .context("log path has no usable file name")?
        .to_string();
    let file = tokio::fs::File::open(&args.path)
        .await
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let mut reader = open_log(
        &file_name,
        file,
        SdParserOptions {
            fallback_timestamp_frequency: args.fallback_frequency,
            ..Default::default()
        },
    )?;

    let mut count = 0usize;
    while let Some(sample) = reader.next_sample().await? {
        println!("{}", serde_json::to_string(&sample)?);
        count += 1;
    }
    if let Some(config) = reader.config() {
        log::info!("device configuration: {}", serde_json::to_string(config)?);
    }
    log::info!("wrote {count} samples from {file_name}");
    Ok(())
}

async fn file_list(args: FileListArgs) -> Result<()> {
    let listing = tokio::fs::read_to_string(&args.path)
        .await
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    for entry in parse_file_listing(&listing) {
        match entry.created_date {
            Some(date) => println!("{}\t{date}", entry.file_name),
            None => println!("{}", entry.file_name),
        }
    }
    Ok(())
}

fn version_compare(args: VersionCompareArgs) -> Result<()> {
    let relation = match compare_version_strings(&args.first, &args.second) {
        Ordering::Less => "<",
        Ordering::Equal => "==",
        Ordering::Greater => ">",
    };
    println!("{} {relation} {}", args.first, args.second);
    Ok(())
}

async fn releases(args: ReleasesArgs) -> Result<()> {
    let channel = if args.wifi {
        ReleaseChannel::WifiModule
    } else {
        ReleaseChannel::Firmware
    };
    let client = ReleaseClient::new(ReleaseClientOptions::default())?;
    let Some(release) = client
        .latest(channel, args.prerelease, &args.asset_extension)
        .await?
    else {
        bail!("no matching release found");
    };

    println!("latest release: {} ({})", release.tag_name, release.version);
    if let Some(published) = release.published_at {
        println!("published: {published}");
    }
    match &release.asset {
        Some(asset) => println!("asset: {} ({} bytes)", asset.file_name, asset.size),
        None => println!("asset: none with extension {}", args.asset_extension),
    }

    if let Some(dir) = args.download_to {
        let asset = release
            .asset
            .as_ref()
            .context("selected release has no matching asset to download")?;
        let path = client
            .download_to(&dir, &asset.download_url, Some(asset.size))
            .await?;
        println!("downloaded to {}", path.display());
    }
    Ok(())
}
