// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod blkio;
mod builder;
mod container;
mod encrypt;
mod layout;
mod toc;

pub use builder::FipBuilder;
pub use container::{build, BuildOptions, BuildSummary, FipSources};
pub use encrypt::{EncryptionStage, EncryptionStep, NullCipher, StageError};
pub use layout::{FipLayout, ImageKind};
pub use toc::{EntryMarker, Toc, TocEntry, TocHeader, TocRecord};

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not create scratch file: {0}")]
    Scratch(#[source] io::Error),

    #[error("could not open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("TOC is full ({max} entries)")]
    TocFull { max: usize },

    #[error(
        "primary image is {size:#x} bytes, \
         larger than its {reserved:#x} byte region"
    )]
    PrimaryTooLarge { size: u64, reserved: u64 },

    #[error(
        "encrypted TOC is {len:#x} bytes, \
         but only {room:#x} bytes precede the first image"
    )]
    EncryptedTooLarge { len: u64, room: u64 },

    #[error("encryption stage failed during {step}: {source}")]
    Encryption {
        step: EncryptionStep,
        #[source]
        source: StageError,
    },

    #[error("bad TOC magic: expected {expected:#x}, got {got:#x}")]
    BadTocMagic { expected: u32, got: u32 },

    #[error("TOC truncated at offset {offset:#x} ({len:#x} bytes available)")]
    TocTruncated { offset: u64, len: usize },
}

/// Tags a bare `io::Error` with what we were doing at the time
pub(crate) trait IoContext<T> {
    fn io_context(self, action: &'static str) -> Result<T, Error>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, action: &'static str) -> Result<T, Error> {
        self.map_err(|source| Error::Io { action, source })
    }
}
