//! Binary snapshot format for `SeenSet`.
//!
//! ```text
//! magic   "CDSF"            4 bytes
//! version u8                currently 1
//! growth  u8                0 = scale, 1 = fixed
//! reserved u16
//! capacity_exceeded u64
//! generation count  u32
//! per generation:
//!     capacity u64, fp_rate f64, num_hashes u32, num_bits u64,
//!     len u64, word count u64, words [u64]
//! sha256 of everything above   32 bytes
//! ```
//!
//! All integers are little-endian.

use sha2::{Digest, Sha256};

use super::bloom::MAX_HASHES;
use super::{BloomFilter, SeenSet};
use crate::error::{AppError, Result};
use crate::models::GrowthPolicy;

const MAGIC: &[u8; 4] = b"CDSF";
const VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 32;

pub(super) fn encode(set: &SeenSet) -> Vec<u8> {
    let words: usize = set.generations.iter().map(|g| g.words.len()).sum();
    let mut out = Vec::with_capacity(20 + set.generations.len() * 44 + words * 8 + CHECKSUM_LEN);

    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(match set.growth {
        GrowthPolicy::Scale => 0,
        GrowthPolicy::Fixed => 1,
    });
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&set.capacity_exceeded.to_le_bytes());
    out.extend_from_slice(&(set.generations.len() as u32).to_le_bytes());

    for g in &set.generations {
        out.extend_from_slice(&g.capacity.to_le_bytes());
        out.extend_from_slice(&g.fp_rate.to_bits().to_le_bytes());
        out.extend_from_slice(&g.num_hashes.to_le_bytes());
        out.extend_from_slice(&g.num_bits.to_le_bytes());
        out.extend_from_slice(&g.len.to_le_bytes());
        out.extend_from_slice(&(g.words.len() as u64).to_le_bytes());
        for word in &g.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    let checksum = Sha256::digest(&out);
    out.extend_from_slice(&checksum);
    out
}

pub(super) fn decode(bytes: &[u8], path: &str) -> Result<SeenSet> {
    if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
        return Err(AppError::corrupt(path, "snapshot truncated"));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(AppError::corrupt(path, "checksum mismatch"));
    }

    let mut r = Reader { buf: body, pos: 0, path };
    if r.take(4)? != MAGIC {
        return Err(AppError::corrupt(path, "bad magic"));
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(AppError::corrupt(
            path,
            format!("unsupported snapshot version {version}"),
        ));
    }
    let growth = match r.u8()? {
        0 => GrowthPolicy::Scale,
        1 => GrowthPolicy::Fixed,
        other => return Err(AppError::corrupt(path, format!("unknown growth tag {other}"))),
    };
    r.take(2)?;
    let capacity_exceeded = r.u64()?;
    let count = r.u32()?;
    if count == 0 {
        return Err(AppError::corrupt(path, "no generations"));
    }

    let mut generations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let capacity = r.u64()?;
        let fp_rate = f64::from_bits(r.u64()?);
        let num_hashes = r.u32()?;
        let num_bits = r.u64()?;
        let len = r.u64()?;
        let word_count = r.u64()?;

        if num_bits == 0 || word_count != num_bits.div_ceil(64) {
            return Err(AppError::corrupt(path, "bitset size mismatch"));
        }
        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(AppError::corrupt(path, format!("bad hash count {num_hashes}")));
        }
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(AppError::corrupt(path, format!("bad error rate {fp_rate}")));
        }
        if word_count as usize > r.remaining() / 8 {
            return Err(AppError::corrupt(path, "bitset extends past end"));
        }

        let mut words = Vec::with_capacity(word_count as usize);
        for _ in 0..word_count {
            words.push(r.u64()?);
        }
        generations.push(BloomFilter {
            words,
            num_bits,
            num_hashes,
            capacity,
            fp_rate,
            len,
        });
    }

    if r.remaining() != 0 {
        return Err(AppError::corrupt(path, "trailing bytes"));
    }

    Ok(SeenSet {
        generations,
        growth,
        capacity_exceeded,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a str,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(AppError::corrupt(self.path, "unexpected end of snapshot"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }
}
