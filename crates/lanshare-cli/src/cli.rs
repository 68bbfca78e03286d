// SPDX-License-Identifier: AGPL-3.0
// LanShare CLI - Command-line arguments

use clap::{ArgAction, Parser};
use lanshare_core::AppSettings;
use std::path::PathBuf;

/// LanShare - share files and folders with devices on your local network
#[derive(Debug, Parser)]
#[command(name = "lanshare", version, about)]
pub struct Cli {
    /// Port to serve on and to contact peers on
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Directory to share
    #[arg(short = 'd', long = "shared-dir", value_name = "DIR")]
    pub shared_dir: Option<PathBuf>,

    /// Start in Private mode
    #[arg(long = "private", conflicts_with = "public")]
    pub private: bool,

    /// Start in Public mode
    #[arg(long = "public")]
    pub public: bool,

    /// Settings file to use instead of the platform default
    #[arg(long = "settings", value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Overlay command-line flags on persisted settings
    pub fn apply(&self, settings: &mut AppSettings) {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(dir) = &self.shared_dir {
            settings.shared_dir = dir.clone();
        }
        if self.private {
            settings.public_mode = false;
        } else if self.public {
            settings.public_mode = true;
        }
    }

    /// Default level for this workspace's crates
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
