// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::fs::File;
use std::io::{Seek, SeekFrom};

use log::warn;

use crate::blkio;

/// Error type returned by an [`EncryptionStage`]
pub type StageError = Box<dyn std::error::Error + Send + Sync>;

/// The step of the encryption sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionStep {
    Init,
    Encrypt,
    DumpHeader,
}

impl fmt::Display for EncryptionStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncryptionStep::Init => write!(f, "init"),
            EncryptionStep::Encrypt => write!(f, "encrypt"),
            EncryptionStep::DumpHeader => write!(f, "dump header"),
        }
    }
}

/// The engine that turns the finished TOC scratch into the encrypted region
/// of the container.
///
/// The builder calls `init`, `encrypt` and `dump_header` in that order, once
/// per build, and treats the result as opaque bytes. `toc` is positioned at
/// an arbitrary offset on entry; `dest` is an empty file positioned at 0.
pub trait EncryptionStage {
    type Context;

    /// Derives key material and parameters from the TOC scratch
    fn init(&mut self, toc: &mut File) -> Result<Self::Context, StageError>;

    /// Writes the transformed TOC scratch into `dest`
    fn encrypt(
        &mut self,
        ctx: &mut Self::Context,
        dest: &mut File,
        toc: &mut File,
    ) -> Result<(), StageError>;

    /// Appends the header describing the transform to `dest`
    fn dump_header(
        &mut self,
        ctx: &Self::Context,
        dest: &mut File,
    ) -> Result<(), StageError>;
}

/// Pass-through stage: copies the TOC unchanged and emits no header.
///
/// Containers produced with it will not boot on parts that expect an
/// encrypted TOC, but are handy for development and for inspecting the TOC
/// with [`crate::Toc::parse`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl EncryptionStage for NullCipher {
    /// Length of the TOC scratch
    type Context = u64;

    fn init(&mut self, toc: &mut File) -> Result<u64, StageError> {
        warn!("TOC will be stored unencrypted");
        Ok(toc.metadata()?.len())
    }

    fn encrypt(
        &mut self,
        len: &mut u64,
        dest: &mut File,
        toc: &mut File,
    ) -> Result<(), StageError> {
        toc.seek(SeekFrom::Start(0))?;
        let copied = blkio::copy_image(toc, dest, 0)?;
        if copied != *len {
            return Err(format!(
                "TOC changed size while copying ({copied:#x} != {len:#x})"
            )
            .into());
        }
        Ok(())
    }

    fn dump_header(
        &mut self,
        _len: &u64,
        _dest: &mut File,
    ) -> Result<(), StageError> {
        Ok(())
    }
}
