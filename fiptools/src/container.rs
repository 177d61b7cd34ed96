// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::info;

use crate::blkio::copy_image;
use crate::builder::{scratch_file, FipBuilder};
use crate::{
    EncryptionStage, EncryptionStep, Error, FipLayout, ImageKind, IoContext,
    TocEntry,
};

/// Input images for one container
#[derive(Debug, Clone)]
pub struct FipSources {
    pub bl2: PathBuf,
    pub bl30: PathBuf,
    pub bl31: PathBuf,
    pub bl32: Option<PathBuf>,
    pub bl33: PathBuf,
}

impl FipSources {
    /// The TOC-addressed images, in the order they are packed
    pub fn secondaries(&self) -> impl Iterator<Item = (ImageKind, &Path)> {
        [
            Some((ImageKind::Bl30, self.bl30.as_path())),
            Some((ImageKind::Bl31, self.bl31.as_path())),
            self.bl32.as_deref().map(|p| (ImageKind::Bl32, p)),
            Some((ImageKind::Bl33, self.bl33.as_path())),
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub layout: FipLayout,
    /// Where scratch files are created; the system temporary directory if
    /// unset
    pub scratch_dir: Option<PathBuf>,
}

/// What ended up where in a successfully built container
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub entries: Vec<TocEntry>,
    /// Size of the encrypted TOC region, header included
    pub encrypted_len: u64,
    pub output_len: u64,
}

fn open(path: &Path) -> Result<File, Error> {
    File::open(path).map_err(|source| Error::Open {
        path: path.into(),
        source,
    })
}

/// Assembles a boot container at `output`.
///
/// The output is laid out as the primary image, then the encrypted TOC at
/// `primary_reserved`, then each secondary payload at
/// `primary_reserved + entry.offset`. On error the output file is left in an
/// unspecified state; scratch files are always removed.
pub fn build<S: EncryptionStage>(
    sources: &FipSources,
    output: &Path,
    stage: &mut S,
    options: &BuildOptions,
) -> Result<BuildSummary, Error> {
    let layout = options.layout;
    let scratch_dir = options.scratch_dir.as_deref();
    info!("creating FIP image {}", output.display());

    let mut fip = FipBuilder::new(layout, scratch_dir)?;

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|source| Error::Open {
            path: output.into(),
            source,
        })?;

    let mut bl2 = open(&sources.bl2)?;
    let size = bl2
        .metadata()
        .map(|m| m.len())
        .io_context("measuring primary image")?;
    if size > layout.primary_reserved {
        return Err(Error::PrimaryTooLarge {
            size,
            reserved: layout.primary_reserved,
        });
    }
    copy_image(&mut bl2, &mut out, 0).io_context("copying primary image")?;
    drop(bl2);

    let mut entries = vec![];
    for (kind, path) in sources.secondaries() {
        info!("adding {kind} from {}", path.display());
        let mut image = open(path)?;
        entries.push(fip.add_image(kind, &mut image, &mut out)?);
    }

    let mut enc = scratch_file(scratch_dir, "fip.enc.")?;
    let dest = enc.as_file_mut();
    let mut ctx = stage
        .init(fip.scratch_mut())
        .map_err(|source| Error::Encryption {
            step: EncryptionStep::Init,
            source,
        })?;
    stage
        .encrypt(&mut ctx, dest, fip.scratch_mut())
        .map_err(|source| Error::Encryption {
            step: EncryptionStep::Encrypt,
            source,
        })?;
    stage
        .dump_header(&ctx, dest)
        .map_err(|source| Error::Encryption {
            step: EncryptionStep::DumpHeader,
            source,
        })?;

    let encrypted_len = dest
        .seek(SeekFrom::End(0))
        .io_context("measuring encrypted TOC")?;
    if encrypted_len > layout.container_base {
        return Err(Error::EncryptedTooLarge {
            len: encrypted_len,
            room: layout.container_base,
        });
    }
    dest.seek(SeekFrom::Start(0))
        .and_then(|_| copy_image(dest, &mut out, layout.primary_reserved))
        .io_context("copying encrypted TOC")?;

    // The last payload gets a full slot, like every other one
    let end = layout.primary_reserved + fip.current_offset();
    let mut output_len = out
        .metadata()
        .map(|m| m.len())
        .io_context("measuring output")?;
    if output_len < end {
        out.set_len(end).io_context("padding output")?;
        output_len = end;
    }

    info!(
        "wrote {} images, {output_len:#x} bytes, to {}",
        entries.len(),
        output.display()
    );
    Ok(BuildSummary {
        entries,
        encrypted_len,
        output_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullCipher, StageError, Toc};
    use std::io::{Read, Write};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        scratch: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                scratch: tempfile::tempdir().unwrap(),
            }
        }

        fn file(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            path
        }

        fn sources(&self, bl31: &[u8]) -> FipSources {
            FipSources {
                bl2: self.file("bl2.bin", &[0u8; 0xc000]),
                bl30: self.file("bl30.bin", &[0x30u8; 0x1000]),
                bl31: self.file("bl31.bin", bl31),
                bl32: None,
                bl33: self.file("bl33.bin", &[0x33u8; 0x800]),
            }
        }

        fn options(&self) -> BuildOptions {
            BuildOptions {
                layout: FipLayout::GXL,
                scratch_dir: Some(self.scratch.path().into()),
            }
        }

        fn scratch_is_empty(&self) -> bool {
            std::fs::read_dir(self.scratch.path()).unwrap().count() == 0
        }
    }

    fn bl31_with_magic(magic: bool) -> Vec<u8> {
        let mut data = vec![0x31u8; 0x2000];
        if magic {
            data[256..260].copy_from_slice(&0x1234_8765u32.to_le_bytes());
        }
        data
    }

    #[test]
    fn three_image_container() {
        let fx = Fixture::new();
        let out = fx.dir.path().join("fip.bin");
        let summary = build(
            &fx.sources(&bl31_with_magic(false)),
            &out,
            &mut NullCipher,
            &fx.options(),
        )
        .unwrap();

        let data = std::fs::read(&out).unwrap();
        assert!(data.len() as u64 >= 0xc000 + 0x4000 + 3 * 0x4000);
        assert_eq!(summary.output_len, data.len() as u64);
        assert_eq!(summary.encrypted_len, 0x3e00);

        let toc = Toc::parse(&data[0xc000..], &FipLayout::GXL).unwrap();
        let relative: Vec<u64> =
            toc.entries().map(|e| e.offset.get() - 0x4000).collect();
        assert_eq!(relative, vec![0, 0x4000, 0x8000]);
        let kinds: Vec<_> = toc.entries().map(TocEntry::kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(ImageKind::Bl30),
                Some(ImageKind::Bl31),
                Some(ImageKind::Bl33)
            ]
        );

        assert!(data[0x10000..0x11000].iter().all(|&b| b == 0x30));
        assert!(data[0x14000..0x16000].iter().all(|&b| b == 0x31));
        assert!(data[0x18000..0x18800].iter().all(|&b| b == 0x33));
        assert!(data[0x18800..].iter().all(|&b| b == 0));
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn entry_header_marker_follows_magic() {
        for magic in [true, false] {
            let fx = Fixture::new();
            let out = fx.dir.path().join("fip.bin");
            build(
                &fx.sources(&bl31_with_magic(magic)),
                &out,
                &mut NullCipher,
                &fx.options(),
            )
            .unwrap();

            let data = std::fs::read(&out).unwrap();
            let marker = &data[0xc000 + 0x400..0xc000 + 0x408];
            if magic {
                assert_eq!(&marker[..4], &0x8765_4321u32.to_le_bytes());
                assert_eq!(&marker[4..], &1u32.to_le_bytes());
            } else {
                assert_eq!(marker, &[0; 8]);
            }
            let toc = Toc::parse(&data[0xc000..], &FipLayout::GXL).unwrap();
            assert_eq!(toc.records[1].entry_header.is_some(), magic);
        }
    }

    #[test]
    fn builds_are_reproducible() {
        let fx = Fixture::new();
        let sources = fx.sources(&bl31_with_magic(true));
        let a = fx.dir.path().join("a.bin");
        let b = fx.dir.path().join("b.bin");
        build(&sources, &a, &mut NullCipher, &fx.options()).unwrap();
        build(&sources, &b, &mut NullCipher, &fx.options()).unwrap();
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }

    #[test]
    fn optional_bl32_goes_between_bl31_and_bl33() {
        let fx = Fixture::new();
        let mut sources = fx.sources(&bl31_with_magic(false));
        sources.bl32 = Some(fx.file("bl32.bin", &[0x32u8; 0x4000]));
        let out = fx.dir.path().join("fip.bin");
        let summary =
            build(&sources, &out, &mut NullCipher, &fx.options()).unwrap();

        let kinds: Vec<_> =
            summary.entries.iter().map(TocEntry::kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(ImageKind::Bl30),
                Some(ImageKind::Bl31),
                Some(ImageKind::Bl32),
                Some(ImageKind::Bl33)
            ]
        );
        assert_eq!(summary.entries[3].offset.get(), 0x10000);
        assert_eq!(summary.output_len, 0xc000 + 0x14000);
    }

    /// XORs the TOC and appends a recognizable header
    struct XorStage;

    impl EncryptionStage for XorStage {
        type Context = u8;

        fn init(&mut self, _toc: &mut File) -> Result<u8, StageError> {
            Ok(0x5a)
        }

        fn encrypt(
            &mut self,
            key: &mut u8,
            dest: &mut File,
            toc: &mut File,
        ) -> Result<(), StageError> {
            let mut data = vec![];
            toc.seek(SeekFrom::Start(0))?;
            toc.read_to_end(&mut data)?;
            data.iter_mut().for_each(|b| *b ^= *key);
            dest.write_all(&data)?;
            Ok(())
        }

        fn dump_header(
            &mut self,
            _key: &u8,
            dest: &mut File,
        ) -> Result<(), StageError> {
            dest.write_all(b"XORHDR00")?;
            Ok(())
        }
    }

    #[test]
    fn encrypted_region_is_spliced_after_primary() {
        let fx = Fixture::new();
        let out = fx.dir.path().join("fip.bin");
        let summary = build(
            &fx.sources(&bl31_with_magic(false)),
            &out,
            &mut XorStage,
            &fx.options(),
        )
        .unwrap();
        assert_eq!(summary.encrypted_len, 0x3e00 + 8);

        let data = std::fs::read(&out).unwrap();
        let magic: Vec<u8> =
            data[0xc000..0xc004].iter().map(|b| b ^ 0x5a).collect();
        assert_eq!(magic, 0xaa64_0001u32.to_le_bytes());
        assert_eq!(&data[0xfe00..0xfe08], b"XORHDR00");
        // Payloads are not part of the encrypted region
        assert!(data[0x10000..0x11000].iter().all(|&b| b == 0x30));
    }

    struct FailingStage;

    impl EncryptionStage for FailingStage {
        type Context = ();

        fn init(&mut self, _toc: &mut File) -> Result<(), StageError> {
            Ok(())
        }

        fn encrypt(
            &mut self,
            _ctx: &mut (),
            _dest: &mut File,
            _toc: &mut File,
        ) -> Result<(), StageError> {
            Err("no key slot available".into())
        }

        fn dump_header(
            &mut self,
            _ctx: &(),
            _dest: &mut File,
        ) -> Result<(), StageError> {
            unreachable!()
        }
    }

    #[test]
    fn stage_failure_is_reported_and_cleaned_up() {
        let fx = Fixture::new();
        let out = fx.dir.path().join("fip.bin");
        let err = build(
            &fx.sources(&bl31_with_magic(false)),
            &out,
            &mut FailingStage,
            &fx.options(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Encryption {
                step: EncryptionStep::Encrypt,
                ..
            }
        ));
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn unwritable_output_fails_before_images_are_read() {
        let fx = Fixture::new();
        let mut sources = fx.sources(&bl31_with_magic(false));
        // Would fail to open if the build ever got that far
        sources.bl30 = fx.dir.path().join("missing.bin");
        let out = fx.dir.path().join("no/such/dir/fip.bin");

        let err =
            build(&sources, &out, &mut NullCipher, &fx.options()).unwrap_err();
        match err {
            Error::Open { path, .. } => assert_eq!(path, out),
            e => panic!("unexpected error {e}"),
        }
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn oversized_primary_is_rejected() {
        let fx = Fixture::new();
        let mut sources = fx.sources(&bl31_with_magic(false));
        sources.bl2 = fx.file("big.bin", &[1u8; 0xc001]);
        let out = fx.dir.path().join("fip.bin");
        assert!(matches!(
            build(&sources, &out, &mut NullCipher, &fx.options()),
            Err(Error::PrimaryTooLarge {
                size: 0xc001,
                reserved: 0xc000
            })
        ));
        assert!(fx.scratch_is_empty());
    }
}
