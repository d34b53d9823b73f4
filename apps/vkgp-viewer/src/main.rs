//! vkgp viewer
//!
//! Orbits a sphere whose vertices are displaced by the `wiggle` compute
//! kernel before every frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vkgp-viewer -- [OPTIONS]
//! ```
//!
//! ## Controls
//!
//! - Middle mouse drag: orbit
//! - Scroll: zoom
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use std::path::PathBuf;

use anyhow::bail;
use vkgp_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;

/// Command line options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerOptions {
    pub vsync: bool,
    pub no_validation: bool,
    /// SPIR-V file replacing the embedded wiggle kernel.
    pub kernel: Option<PathBuf>,
    pub help: bool,
}

impl ViewerOptions {
    /// Parse the process arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vsync" => options.vsync = true,
                "--no-validation" => options.no_validation = true,
                "--kernel" => match args.next() {
                    Some(path) => options.kernel = Some(PathBuf::from(path)),
                    None => bail!("--kernel needs a path"),
                },
                "-h" | "--help" => options.help = true,
                other => bail!("unknown option {other}"),
            }
        }
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    let options = match ViewerOptions::from_args() {
        Ok(options) => options,
        Err(e) => {
            print_help();
            return Err(e);
        }
    };
    if options.help {
        print_help();
        return Ok(());
    }

    let mut config = AppConfig::new("vkgp viewer")
        .with_size(WIDTH, HEIGHT)
        .with_vsync(options.vsync);
    if options.no_validation {
        config = config.with_validation(false);
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "vkgp viewer

USAGE:
    cargo run -p vkgp-viewer -- [OPTIONS]

OPTIONS:
    --vsync             Prefer FIFO presentation
    --no-validation     Disable the Vulkan validation layer
    --kernel <PATH>     Load the wiggle kernel from a SPIR-V file
    -h, --help          Print this help message

CONTROLS:
    Middle mouse drag   Orbit
    Scroll              Zoom

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ViewerOptions> {
        ViewerOptions::parse(args.iter().map(|s| (*s).to_owned()))
    }

    #[test]
    fn flags_are_parsed() {
        let options = parse(&["--vsync", "--kernel", "k.spv", "--no-validation"]).unwrap();
        assert!(options.vsync);
        assert!(options.no_validation);
        assert_eq!(options.kernel, Some(PathBuf::from("k.spv")));
        assert_eq!(parse(&[]).unwrap(), ViewerOptions::default());
    }

    #[test]
    fn bad_arguments_fail() {
        assert!(parse(&["--kernel"]).is_err());
        assert!(parse(&["--fast"]).is_err());
    }
}
