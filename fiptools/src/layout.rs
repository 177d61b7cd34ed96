// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use crate::toc::{TocEntry, TocHeader};

/// Every offset, size and magic number that defines one flavour of the
/// container.
///
/// The builder never uses a literal directly; it asks the layout, so a new
/// SoC variant is a new constant rather than a new code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FipLayout {
    /// `name` field of the TOC header
    pub toc_magic: u32,
    /// `serial_number` field of the TOC header
    pub toc_serial: u32,

    /// Size of the region reserved for the primary (BL2) stage at the start
    /// of the output. The encrypted TOC lands right after it.
    pub primary_reserved: u64,

    /// Offset recorded for the first TOC entry; later entries follow at
    /// `alignment` boundaries
    pub container_base: u64,
    /// Size of the TOC scratch that is handed to the encryption stage
    pub scratch_size: u64,
    pub alignment: u64,

    /// Start and length of the all-ones run marking the end of the TOC
    pub terminator_offset: u64,
    pub terminator_len: u64,

    /// Where in an image the entry header is probed for, and how much of it
    /// is kept
    pub entry_header_probe: u64,
    pub entry_header_len: usize,
    /// Magic expected at the start of the probed entry header
    pub entry_header_magic: u32,
    /// Scratch offset of the first copied entry header; one slot per entry
    pub entry_header_base: u64,

    /// Scratch offset of the entry-point marker
    pub entry_marker_offset: u64,
    pub entry_marker_magic: u32,
}

impl FipLayout {
    /// Amlogic GXL/GXBB boot image layout
    pub const GXL: FipLayout = FipLayout {
        toc_magic: 0xaa64_0001,
        toc_serial: 0x1234_5678,
        primary_reserved: 0xc000,
        container_base: 0x4000,
        scratch_size: 0x4000 - 0x200,
        alignment: 0x4000,
        terminator_offset: 0xc00,
        terminator_len: 0x80,
        entry_header_probe: 256,
        entry_header_len: 0x50,
        entry_header_magic: 0x1234_8765,
        entry_header_base: 0x430,
        entry_marker_offset: 0x400,
        entry_marker_magic: 0x8765_4321,
    };

    /// Scratch offset of TOC entry slot `index`
    pub fn entry_offset(&self, index: usize) -> u64 {
        (TocHeader::SIZE + index * TocEntry::SIZE) as u64
    }

    /// Scratch offset of the copied entry header for slot `index`
    pub fn entry_header_offset(&self, index: usize) -> u64 {
        self.entry_header_base + (self.entry_header_len * index) as u64
    }

    /// Number of images the TOC can describe.
    ///
    /// Entry slots stop at the entry-point marker and entry header slots stop
    /// at the terminator; whichever runs out first wins.
    pub fn max_entries(&self) -> usize {
        let entry_room =
            (self.entry_marker_offset as usize).saturating_sub(TocHeader::SIZE);
        let header_room = self
            .terminator_offset
            .saturating_sub(self.entry_header_base) as usize;
        let header_slots = header_room
            .checked_div(self.entry_header_len)
            .unwrap_or(0);
        (entry_room / TocEntry::SIZE).min(header_slots)
    }

    /// Rounds `size` up to the payload alignment
    pub fn align(&self, size: u64) -> u64 {
        round_up(size, self.alignment)
    }
}

impl Default for FipLayout {
    fn default() -> Self {
        Self::GXL
    }
}

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    match value % align {
        0 => value,
        rem => value + (align - rem),
    }
}

/// The bootloader stages that can be packed into a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// First stage; written verbatim in front of the container, never
    /// addressed by the TOC
    Bl2,
    /// System control processor firmware
    Bl30,
    /// Secure monitor; carries the entry-point header
    Bl31,
    /// Secure payload (optional)
    Bl32,
    /// Non-trusted bootloader
    Bl33,
}

impl ImageKind {
    pub const ALL: [ImageKind; 5] = [
        ImageKind::Bl2,
        ImageKind::Bl30,
        ImageKind::Bl31,
        ImageKind::Bl32,
        ImageKind::Bl33,
    ];

    /// The TOC type identifier for this kind of image
    pub fn uuid(self) -> [u8; 16] {
        match self {
            ImageKind::Bl2 => [
                0x5f, 0xf9, 0xec, 0x0b, 0x4d, 0x22, 0x3e, 0x4d, 0xa5, 0x44,
                0xc3, 0x9d, 0x81, 0xc7, 0x3f, 0x0a,
            ],
            ImageKind::Bl30 => [
                0x97, 0x66, 0xfd, 0x3d, 0x89, 0xbe, 0xe8, 0x49, 0xae, 0x5d,
                0x78, 0xa1, 0x40, 0x60, 0x82, 0x13,
            ],
            ImageKind::Bl31 => [
                0x47, 0xd4, 0x08, 0x6d, 0x4c, 0xfe, 0x98, 0x46, 0x9b, 0x95,
                0x29, 0x50, 0xcb, 0xbd, 0x5a, 0x00,
            ],
            ImageKind::Bl32 => [
                0x05, 0xd0, 0xe1, 0x89, 0x53, 0xdc, 0x13, 0x47, 0x8d, 0x2b,
                0x50, 0x0a, 0x4b, 0x7a, 0x3e, 0x38,
            ],
            ImageKind::Bl33 => [
                0xd6, 0xd0, 0xee, 0xa7, 0xfc, 0xea, 0xd5, 0x4b, 0x97, 0x82,
                0x99, 0x34, 0xf2, 0x34, 0xb6, 0xe4,
            ],
        }
    }

    /// Reverse lookup, used when reading a TOC back
    pub fn from_uuid(uuid: &[u8; 16]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| &k.uuid() == uuid)
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageKind::Bl2 => write!(f, "bl2"),
            ImageKind::Bl30 => write!(f, "bl30"),
            ImageKind::Bl31 => write!(f, "bl31"),
            ImageKind::Bl32 => write!(f, "bl32"),
            ImageKind::Bl33 => write!(f, "bl33"),
        }
    }
}
