// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;
use zerocopy::AsBytes;

use crate::blkio::{copy_image, read_full, write_full};
use crate::toc::{EntryMarker, Toc, TocEntry, TocHeader};
use crate::{Error, FipLayout, ImageKind, IoContext};

/// Creates a uniquely named scratch file, in `dir` if given and in the system
/// temporary directory otherwise. The file is removed when dropped.
pub(crate) fn scratch_file(
    dir: Option<&Path>,
    prefix: &str,
) -> Result<NamedTempFile, Error> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(Error::Scratch)
}

/// Accumulates the table of contents of a container.
///
/// The TOC lives in a scratch file that is later handed to the encryption
/// stage, while image payloads go straight to the output. Dropping the
/// builder deletes the scratch file.
#[derive(Debug)]
pub struct FipBuilder {
    layout: FipLayout,
    scratch: NamedTempFile,
    current_offset: u64,
    entry_count: usize,
}

impl FipBuilder {
    /// Creates the TOC scratch with its header and end-of-TOC terminator in
    /// place.
    pub fn new(
        layout: FipLayout,
        scratch_dir: Option<&Path>,
    ) -> Result<Self, Error> {
        let mut scratch = scratch_file(scratch_dir, "fip.bin.")?;
        let file = scratch.as_file_mut();

        file.set_len(layout.scratch_size)
            .io_context("sizing TOC scratch")?;

        file.seek(SeekFrom::Start(0))
            .and_then(|_| write_full(file, TocHeader::new(&layout).as_bytes()))
            .io_context("writing TOC header")?;

        let terminator = vec![0xffu8; layout.terminator_len as usize];
        file.seek(SeekFrom::Start(layout.terminator_offset))
            .and_then(|_| write_full(file, &terminator))
            .io_context("writing TOC terminator")?;

        debug!("TOC scratch at {}", scratch.path().display());
        Ok(Self {
            layout,
            scratch,
            current_offset: layout.container_base,
            entry_count: 0,
        })
    }

    pub fn layout(&self) -> &FipLayout {
        &self.layout
    }

    /// Offset (from the container base) the next image will be placed at
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut File {
        self.scratch.as_file_mut()
    }

    /// Records `image` in the TOC and copies it into `output`.
    ///
    /// If the image carries an entry header (magic at the probe offset), the
    /// entry-point marker and a copy of the header are stored in the TOC as
    /// well. The payload goes to `output` at
    /// `primary_reserved + entry.offset`.
    ///
    /// On error the entry count and offset are unchanged, but whatever part
    /// of the entry already reached the scratch TOC stays there. Drop the
    /// builder after an error rather than adding more images to it.
    pub fn add_image<R, W>(
        &mut self,
        kind: ImageKind,
        image: &mut R,
        output: &mut W,
    ) -> Result<TocEntry, Error>
    where
        R: Read + Seek + ?Sized,
        W: Write + Seek + ?Sized,
    {
        let max = self.layout.max_entries();
        if self.entry_count >= max {
            return Err(Error::TocFull { max });
        }
        let index = self.entry_count;
        let layout = self.layout;

        let size = image
            .seek(SeekFrom::End(0))
            .io_context("measuring image")?;
        let entry = TocEntry::new(kind, self.current_offset, size);

        let toc = self.scratch.as_file_mut();
        toc.seek(SeekFrom::Start(layout.entry_offset(index)))
            .and_then(|_| write_full(toc, entry.as_bytes()))
            .io_context("writing TOC entry")?;

        let mut header = vec![0u8; layout.entry_header_len];
        let n = image
            .seek(SeekFrom::Start(layout.entry_header_probe))
            .and_then(|_| read_full(image, &mut header))
            .io_context("probing entry header")?;

        if n < 4 {
            debug!("{kind}: too short to carry an entry header");
        } else if header.starts_with(&layout.entry_header_magic.to_le_bytes())
        {
            debug!("{kind}: found entry header, slot {index}");
            toc.seek(SeekFrom::Start(layout.entry_marker_offset))
                .and_then(|_| {
                    write_full(toc, EntryMarker::new(&layout).as_bytes())
                })
                .io_context("writing entry-point marker")?;
            toc.seek(SeekFrom::Start(layout.entry_header_offset(index)))
                .and_then(|_| write_full(toc, &header))
                .io_context("writing entry header")?;
        }

        let dest = layout.primary_reserved + self.current_offset;
        image
            .seek(SeekFrom::Start(0))
            .and_then(|_| copy_image(image, output, dest))
            .io_context("copying image payload")?;

        debug!(
            "{kind}: offset {:#x}, size {size:#x}, output {dest:#x}",
            self.current_offset
        );
        self.current_offset += layout.align(size);
        self.entry_count += 1;
        Ok(entry)
    }

    /// Reads the TOC back from the scratch file
    pub fn toc(&mut self) -> Result<Toc, Error> {
        let mut data = vec![];
        let file = self.scratch.as_file_mut();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut data))
            .io_context("reading TOC scratch")?;
        Toc::parse(&data, &self.layout)
    }
}
