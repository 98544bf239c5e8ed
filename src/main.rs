mod assembler;
mod cli;
mod error;
mod frame;
mod importer;
mod presentation;
mod session;
mod shutdown;
#[cfg(test)]
mod testing;
#[cfg(target_os = "linux")]
mod wayland;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.mirror_config() {
        Some(config) => {
            run_mirror(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            list(cli.json)?;
            // listing is the usage path, not a successful mirror
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(target_os = "linux")]
fn list(json: bool) -> Result<()> {
    let outputs = wayland::list_outputs()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
        return Ok(());
    }

    if outputs.is_empty() {
        println!("No outputs found.");
    }
    for output in outputs {
        println!(
            "Mirrorable output: {} Model: {}: ID: {}",
            output.make, output.model, output.id
        );
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_mirror(config: &cli::MirrorConfig) -> Result<()> {
    let stop = shutdown::StopFlag::new();
    stop.install_ctrlc_handler()?;

    let stats = wayland::mirror(config, stop)?;
    tracing::info!(
        presented = stats.presented,
        captured = stats.captured,
        "mirroring finished"
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn list(_json: bool) -> Result<()> {
    anyhow::bail!("Output mirroring requires a Wayland compositor on Linux")
}

#[cfg(not(target_os = "linux"))]
fn run_mirror(_config: &cli::MirrorConfig) -> Result<()> {
    anyhow::bail!("Output mirroring requires a Wayland compositor on Linux")
}
