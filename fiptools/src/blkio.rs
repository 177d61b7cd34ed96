// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-buffer reads and writes, and block-wise image copies built on them.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Size of the blocks moved by [`copy_image`]
pub const BLOCK_SIZE: usize = 512;

/// Reads until `buf` is full or `source` hits end-of-stream.
///
/// Returns the number of bytes read, which is only less than `buf.len()` at
/// end-of-stream.
pub fn read_full<R: Read + ?Sized>(
    source: &mut R,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match source.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Writes all of `buf`, however many calls to `dest` that takes.
///
/// A write that makes no progress is reported as
/// [`io::ErrorKind::WriteZero`].
pub fn write_full<W: Write + ?Sized>(
    dest: &mut W,
    buf: &[u8],
) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match dest.write(&buf[done..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write after {done} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Copies everything left in `source` into `dest`, starting at `offset`.
///
/// Returns the number of bytes copied. On error the position of `dest` is
/// unspecified.
pub fn copy_image<R, W>(
    source: &mut R,
    dest: &mut W,
    offset: u64,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + Seek + ?Sized,
{
    dest.seek(SeekFrom::Start(offset))?;

    let mut block = [0u8; BLOCK_SIZE];
    let mut total = 0;
    loop {
        let n = read_full(source, &mut block)?;
        write_full(dest, &block[..n])?;
        total += n as u64;
        if n < block.len() {
            break;
        }
    }
    Ok(total)
}
