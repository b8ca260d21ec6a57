//! Binary deltas between subsummary versions.
//!
//! A delta is the `xadf` magic followed by a gzip-compressed `(a(ytt)aay)`:
//! a list of operations and a list of literal chunks. `COPY` appends
//! `len` bytes of the old blob starting at `offset`; `DATA` appends the
//! literal chunk at `index`.

use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use refdeploy_domain::{Variant, VariantType};

pub const DELTA_MAGIC: &[u8; 4] = b"xadf";
const DELTA_TYPE: &str = "(a(ytt)aay)";

const OP_COPY: u8 = 0;
const OP_DATA: u8 = 1;

/// Matches shorter than this are emitted as literal data.
const BLOCK: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Copy { offset: u64, len: u64 },
    Data { index: u64 },
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .context("failed to decompress")?;
    Ok(out)
}

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("failed to compress")?;
    encoder.finish().context("failed to compress")
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    gunzip(data)
}

/// Rebuild the new blob from `old` and `delta`.
pub fn apply_delta(old: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let body = delta
        .strip_prefix(DELTA_MAGIC.as_slice())
        .ok_or_else(|| anyhow!("not a summary delta (bad magic)"))?;
    let raw = gunzip(body)?;
    let value = Variant::parse(DELTA_TYPE, &raw).context("malformed summary delta")?;
    let ops = value
        .child(0)
        .and_then(Variant::as_array)
        .ok_or_else(|| anyhow!("summary delta has no operations"))?;
    let chunks: Vec<Vec<u8>> = value
        .child(1)
        .and_then(Variant::as_array)
        .ok_or_else(|| anyhow!("summary delta has no data chunks"))?
        .iter()
        .map(|chunk| chunk.as_bytes().unwrap_or_default())
        .collect();

    let mut out = Vec::new();
    for op in ops {
        let kind = op.child(0).and_then(|v| match v {
            Variant::Byte(b) => Some(*b),
            _ => None,
        });
        let first = op.child(1).and_then(Variant::as_u64).unwrap_or(0);
        let second = op.child(2).and_then(Variant::as_u64).unwrap_or(0);
        match kind {
            Some(OP_COPY) => {
                let start = usize::try_from(first).context("delta offset overflow")?;
                let len = usize::try_from(second).context("delta length overflow")?;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= old.len())
                    .ok_or_else(|| anyhow!("delta copies past the end of the old summary"))?;
                out.extend_from_slice(&old[start..end]);
            }
            Some(OP_DATA) => {
                let index = usize::try_from(first).context("delta index overflow")?;
                let chunk = chunks
                    .get(index)
                    .ok_or_else(|| anyhow!("delta references missing chunk {index}"))?;
                out.extend_from_slice(chunk);
            }
            other => bail!("unknown delta operation {other:?}"),
        }
    }
    Ok(out)
}

/// Encode `new` as a delta against `old`.
pub fn create_delta(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let (ops, chunks) = diff(old, new);
    let op_type = VariantType::Tuple(vec![
        VariantType::Byte,
        VariantType::Uint64,
        VariantType::Uint64,
    ]);
    let ops = Variant::Array(
        op_type,
        ops.iter()
            .map(|op| match *op {
                Op::Copy { offset, len } => Variant::tuple(vec![
                    Variant::Byte(OP_COPY),
                    Variant::Uint64(offset),
                    Variant::Uint64(len),
                ]),
                Op::Data { index } => Variant::tuple(vec![
                    Variant::Byte(OP_DATA),
                    Variant::Uint64(index),
                    Variant::Uint64(0),
                ]),
            })
            .collect(),
    );
    let chunks = Variant::Array(
        VariantType::Array(Box::new(VariantType::Byte)),
        chunks.iter().map(|chunk| Variant::bytes(chunk)).collect(),
    );
    let mut out = DELTA_MAGIC.to_vec();
    out.extend(gzip(&Variant::tuple(vec![ops, chunks]).to_bytes())?);
    Ok(out)
}

/// Greedy block matching: index every aligned block of `old`, then walk `new`
/// extending matches byte by byte.
fn diff(old: &[u8], new: &[u8]) -> (Vec<Op>, Vec<Vec<u8>>) {
    let mut blocks: HashMap<&[u8], usize> = HashMap::new();
    for start in (0..old.len().saturating_sub(BLOCK - 1)).step_by(BLOCK) {
        blocks.entry(&old[start..start + BLOCK]).or_insert(start);
    }

    let mut ops = Vec::new();
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut literal = Vec::new();

    let mut pos = 0;
    while pos < new.len() {
        let found = new
            .get(pos..pos + BLOCK)
            .and_then(|window| blocks.get(window).copied());
        if let Some(start) = found {
            let mut len = BLOCK;
            while start + len < old.len() && pos + len < new.len() && old[start + len] == new[pos + len]
            {
                len += 1;
            }
            flush_literal(&mut literal, &mut ops, &mut chunks);
            ops.push(Op::Copy {
                offset: start as u64,
                len: len as u64,
            });
            pos += len;
        } else {
            literal.push(new[pos]);
            pos += 1;
        }
    }
    flush_literal(&mut literal, &mut ops, &mut chunks);
    (ops, chunks)
}

fn flush_literal(literal: &mut Vec<u8>, ops: &mut Vec<Op>, chunks: &mut Vec<Vec<u8>>) {
    if !literal.is_empty() {
        ops.push(Op::Data {
            index: chunks.len() as u64,
        });
        chunks.push(std::mem::take(literal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u8, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn delta_reproduces_edited_blob() -> Result<()> {
        let old = sample(1, 4000);
        let mut new = old.clone();
        new.splice(1000..1010, b"replacement bytes".iter().copied());
        new.extend_from_slice(b"appended tail");
        let delta = create_delta(&old, &new)?;
        assert!(delta.starts_with(DELTA_MAGIC));
        assert!(delta.len() < new.len());
        assert_eq!(apply_delta(&old, &delta)?, new);
        Ok(())
    }

    #[test]
    fn unrelated_and_empty_inputs_still_apply() -> Result<()> {
        let old = sample(1, 300);
        let new = sample(7, 10);
        assert_eq!(apply_delta(&old, &create_delta(&old, &new)?)?, new);
        assert_eq!(apply_delta(&[], &create_delta(&[], &new)?)?, new);
        assert!(apply_delta(&old, &create_delta(&old, &[])?)?.is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_deltas_are_rejected() -> Result<()> {
        let old = sample(1, 300);
        assert!(apply_delta(&old, b"nope").is_err());
        let delta = create_delta(&old, &old)?;
        assert!(apply_delta(&old[..10], &delta).is_err());
        Ok(())
    }
}
