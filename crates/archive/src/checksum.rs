//! MD5 stream wrappers.
//!
//! [`Md5Writer`] and [`Md5Reader`] hash every byte they pass through, so a
//! checksum can be bound to a transfer without buffering it. [`Checksum::sum`]
//! may be called at any point: mid-stream it yields the digest of the bytes
//! seen so far.

use std::io::{self, Read, Write};

use md5::{Digest, Md5};

/// Length of an MD5 digest in bytes.
pub const MD5_LEN: usize = 16;

/// A stream that keeps a running digest of the bytes it has seen.
pub trait Checksum {
    /// Digest of every byte passed through so far.
    fn sum(&self) -> [u8; MD5_LEN];

    /// [`sum`](Self::sum) as a lowercase hex string.
    fn hex_sum(&self) -> String {
        hex::encode(self.sum())
    }
}

fn digest_of(hasher: &Md5) -> [u8; MD5_LEN] {
    let mut out = [0u8; MD5_LEN];
    out.copy_from_slice(&hasher.clone().finalize());
    out
}

/// Writer that hashes what it writes before handing it to `dest`.
pub struct Md5Writer<W> {
    dest: W,
    hasher: Md5,
}

impl<W> Md5Writer<W> {
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            hasher: Md5::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.dest
    }

    pub fn into_inner(self) -> W {
        self.dest
    }
}

impl<W: Write> Write for Md5Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Only the accepted prefix is hashed, so a short write stays consistent.
        let n = self.dest.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dest.flush()
    }
}

impl<W> Checksum for Md5Writer<W> {
    fn sum(&self) -> [u8; MD5_LEN] {
        digest_of(&self.hasher)
    }
}

/// Reader that hashes what it reads from `source`.
pub struct Md5Reader<R> {
    source: R,
    hasher: Md5,
}

impl<R> Md5Reader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            hasher: Md5::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: Read> Read for Md5Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

impl<R> Checksum for Md5Reader<R> {
    fn sum(&self) -> [u8; MD5_LEN] {
        digest_of(&self.hasher)
    }
}
