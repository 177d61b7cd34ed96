// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk table of contents structures.
//!
//! These structures are laid out exactly as they appear in the scratch TOC,
//! little-endian and unaligned, so they can be written with
//! [`AsBytes::as_bytes`] and read back with [`FromBytes::read_from_prefix`].

use std::fmt;

use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::{Error, FipLayout, ImageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C)]
pub struct TocHeader {
    pub name: U32<LittleEndian>,
    pub serial_number: U32<LittleEndian>,
    pub flags: U64<LittleEndian>,
}

impl TocHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(layout: &FipLayout) -> Self {
        Self {
            name: U32::new(layout.toc_magic),
            serial_number: U32::new(layout.toc_serial),
            flags: U64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C)]
pub struct TocEntry {
    pub uuid: [u8; 16],
    /// Offset from the container base
    pub offset: U64<LittleEndian>,
    pub size: U64<LittleEndian>,
    pub flags: U64<LittleEndian>,
}

impl TocEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(kind: ImageKind, offset: u64, size: u64) -> Self {
        Self {
            uuid: kind.uuid(),
            offset: U64::new(offset),
            size: U64::new(size),
            flags: U64::new(0),
        }
    }

    pub fn kind(&self) -> Option<ImageKind> {
        ImageKind::from_uuid(&self.uuid)
    }

    /// Unused slots are either never written (zero) or part of the all-ones
    /// terminator
    fn is_empty(&self) -> bool {
        self.uuid.iter().all(|&b| b == 0)
            || self.uuid.iter().all(|&b| b == 0xff)
    }
}

/// The entry-point marker written when an image carries an entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C)]
pub struct EntryMarker {
    pub magic: U32<LittleEndian>,
    pub count: U32<LittleEndian>,
}

impl EntryMarker {
    pub fn new(layout: &FipLayout) -> Self {
        Self {
            magic: U32::new(layout.entry_marker_magic),
            count: U32::new(1),
        }
    }
}

/// One decoded TOC slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocRecord {
    pub entry: TocEntry,
    /// Copy of the image's entry header, if one was stored for this slot
    pub entry_header: Option<Vec<u8>>,
}

/// A table of contents read back from an unencrypted TOC region
#[derive(Debug, Clone)]
pub struct Toc {
    pub header: TocHeader,
    pub records: Vec<TocRecord>,
    pub entry_marker: Option<EntryMarker>,
}

impl Toc {
    /// Decodes a TOC from the start of `data`.
    ///
    /// Slots are read until the first empty one or until the layout runs out
    /// of room.
    pub fn parse(data: &[u8], layout: &FipLayout) -> Result<Self, Error> {
        let header = TocHeader::read_from_prefix(data).ok_or(
            Error::TocTruncated {
                offset: 0,
                len: data.len(),
            },
        )?;
        if header.name.get() != layout.toc_magic {
            return Err(Error::BadTocMagic {
                expected: layout.toc_magic,
                got: header.name.get(),
            });
        }

        let marker: Option<EntryMarker> =
            read_at(data, layout.entry_marker_offset)?;
        let entry_marker =
            marker.filter(|m| m.magic.get() == layout.entry_marker_magic);

        let mut records = vec![];
        for index in 0..layout.max_entries() {
            let Some(entry) =
                read_at::<TocEntry>(data, layout.entry_offset(index))?
            else {
                break;
            };
            if entry.is_empty() {
                break;
            }

            let start = layout.entry_header_offset(index) as usize;
            let entry_header = data
                .get(start..start + layout.entry_header_len)
                .filter(|h| {
                    h.starts_with(&layout.entry_header_magic.to_le_bytes())
                })
                .map(<[u8]>::to_vec);

            records.push(TocRecord {
                entry,
                entry_header,
            });
        }

        Ok(Self {
            header,
            records,
            entry_marker,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &TocEntry> {
        self.records.iter().map(|r| &r.entry)
    }
}

/// Reads a `T` at `offset`, returning `None` past the end of `data`
fn read_at<T: FromBytes>(data: &[u8], offset: u64) -> Result<Option<T>, Error> {
    let offset = offset as usize;
    match data.get(offset..) {
        None | Some([]) => Ok(None),
        Some(rest) => T::read_from_prefix(rest).map(Some).ok_or(
            Error::TocTruncated {
                offset: offset as u64,
                len: data.len(),
            },
        ),
    }
}

impl fmt::Display for TocEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind() {
            Some(k) => k.to_string(),
            None => "unknown".to_string(),
        };
        write!(
            f,
            "{:<7} {} offset={:#08x} size={:#x}",
            kind,
            hex::encode(self.uuid),
            self.offset.get(),
            self.size.get()
        )
    }
}
