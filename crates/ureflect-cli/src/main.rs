//! ureflect command-line tool
//!
//! Offline checks for layout profiles: validate and summarise a profile, and
//! run its named scan patterns against a module image on disk.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ureflect")]
#[command(about = "Layout profile and pattern checker for ureflect", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a layout profile and print a summary
    Profile {
        /// Profile file (TOML)
        file: PathBuf,
        /// Also require the profile to match this machine
        #[arg(long)]
        native: bool,
        /// Print the normalized profile instead of a summary
        #[arg(long)]
        dump: bool,
    },

    /// Run a profile's patterns against a module image
    Scan {
        /// Profile file (TOML)
        profile: PathBuf,
        /// Raw module image (as mapped in memory)
        image: PathBuf,
        /// Address the image is loaded at (decimal or 0x-prefixed hex)
        #[arg(long, default_value = "0", value_parser = commands::parse_address)]
        base: usize,
        /// Only run the named pattern
        #[arg(short, long)]
        pattern: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Profile { file, native, dump } => {
            commands::profile::execute(&file, native, dump)
        }
        Commands::Scan {
            profile,
            image,
            base,
            pattern,
        } => commands::scan::execute(&profile, &image, base, pattern.as_deref()),
    }
}
