// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fiptools::{BuildOptions, FipLayout, FipSources, NullCipher, Toc};
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

#[derive(Parser, Debug)]
#[clap(name = "mkfip", max_term_width = 80)]
pub struct Args {
    /// Increase log verbosity (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Packs bootloader stages into a FIP boot image.
    ///
    /// BL2 is placed verbatim at the start of the image; BL30, BL31, the
    /// optional BL32 and BL33 are described by the TOC and follow at 16 KiB
    /// aligned offsets. The TOC is stored unencrypted.
    Create {
        #[clap(long)]
        bl2: PathBuf,

        #[clap(long)]
        bl30: PathBuf,

        #[clap(long)]
        bl31: PathBuf,

        #[clap(long)]
        bl32: Option<PathBuf>,

        #[clap(long)]
        bl33: PathBuf,

        /// Directory for scratch files
        #[clap(long, env = "MKFIP_TMPDIR")]
        scratch_dir: Option<PathBuf>,

        /// Path where the image should be deposited
        #[clap(env = "MKFIP_OUTPUT")]
        output: PathBuf,
    },
    /// Prints the TOC of an image built by `create`
    Toc {
        image: PathBuf,
    },
}

/// Maps the number of `-v` flags to a level; warnings are always shown
fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    TermLogger::init(
        log_level(args.verbose),
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("failed to install logger")?;

    let layout = FipLayout::GXL;
    match args.cmd {
        Command::Create {
            bl2,
            bl30,
            bl31,
            bl32,
            bl33,
            scratch_dir,
            output,
        } => {
            let sources = FipSources {
                bl2,
                bl30,
                bl31,
                bl32,
                bl33,
            };
            let options = BuildOptions {
                layout,
                scratch_dir,
            };
            let summary =
                fiptools::build(&sources, &output, &mut NullCipher, &options)
                    .with_context(|| {
                        format!("failed to build {}", output.display())
                    })?;
            for entry in &summary.entries {
                println!("{entry}");
            }
        }
        Command::Toc { image } => {
            let data = std::fs::read(&image).with_context(|| {
                format!("reading image file {}", image.display())
            })?;
            let Some(region) = data.get(layout.primary_reserved as usize..)
            else {
                bail!(
                    "{} is too short to hold a TOC ({:#x} bytes)",
                    image.display(),
                    data.len()
                );
            };
            let toc = Toc::parse(region, &layout)
                .context("could not decode TOC (is it encrypted?)")?;

            println!(
                "serial {:#010x}, {} entries",
                toc.header.serial_number.get(),
                toc.records.len()
            );
            for record in &toc.records {
                let header = if record.entry_header.is_some() {
                    " (entry header)"
                } else {
                    ""
                };
                println!("{}{header}", record.entry);
            }
            if let Some(marker) = toc.entry_marker {
                println!(
                    "entry-point marker {:#010x}, count {}",
                    marker.magic.get(),
                    marker.count.get()
                );
            }
        }
    }

    Ok(())
}
