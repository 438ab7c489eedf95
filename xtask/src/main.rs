use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run every test in the workspace
    Test,
    /// Run a simulated update with the CLI
    Simulate {
        /// Firmware image to flash
        image: String,
        /// Declared version of the image
        version: String,
        /// Declared MD5 of the image
        md5: String,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    println!("{what}...");
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => cargo(&["build", "--workspace"], "Building workspace"),
        Commands::Test => cargo(&["test", "--workspace"], "Running tests"),
        Commands::Simulate {
            image,
            version,
            md5,
        } => cargo(
            &[
                "run",
                "-p",
                "xvf-dfu-cli",
                "--",
                "simulate",
                "--image",
                image,
                "--fw-version",
                version,
                "--md5",
                md5,
            ],
            "Running simulated update",
        ),
    }
}
