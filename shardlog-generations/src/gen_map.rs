//! Generation entries, the ordered entries map, and its wire codec.
//!
//! The entries map is the authoritative record of which generations exist
//! and what backs them. Its keys are dense: after setup they always form a
//! contiguous range, the lowest run may be marked empty, and the last entry
//! never is. The map is persisted on the metadata object as a fixed binary
//! record format, length prefixed so it round-trips exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Physical backing of one generation's shards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingKind {
    /// Structured log keyed in the object's key-value map.
    Omap,
    /// Segmented part log.
    Fifo,
}

impl BackingKind {
    fn to_wire(self) -> u8 {
        match self {
            BackingKind::Omap => 0,
            BackingKind::Fifo => 1,
        }
    }

    fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(BackingKind::Omap),
            1 => Ok(BackingKind::Fifo),
            _ => Err(Error::decode(format!("unknown backing kind: {b}"))),
        }
    }
}

impl fmt::Display for BackingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingKind::Omap => write!(f, "omap"),
            BackingKind::Fifo => write!(f, "fifo"),
        }
    }
}

/// One generation of the log.
///
/// Shards of this generation exist in the object store with the given
/// backing; `empty` means the consumer has drained it and the shards may be
/// physically removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub gen_id: u64,
    pub backing: BackingKind,
    pub empty: bool,
}

impl Generation {
    /// A new, non-empty generation.
    pub fn new(gen_id: u64, backing: BackingKind) -> Self {
        Self {
            gen_id,
            backing,
            empty: false,
        }
    }
}

/// The authoritative ordered map `gen_id -> generation`.
pub type Generations = BTreeMap<u64, Generation>;

/// Lowest generation not marked empty, i.e. the first one the consumer
/// still has data in.
pub fn lowest_nonempty(entries: &Generations) -> Option<u64> {
    entries.values().find(|g| !g.empty).map(|g| g.gen_id)
}

const RECORD_LEN: usize = 10;

/// Serialize the entries map for the metadata object body.
pub fn encode_generations(entries: &Generations) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + entries.len() * RECORD_LEN);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for g in entries.values() {
        buf.extend_from_slice(&g.gen_id.to_le_bytes());
        buf.push(g.backing.to_wire());
        buf.push(g.empty as u8);
    }
    buf
}

/// Decode a metadata object body back into the entries map.
pub fn decode_generations(body: &[u8]) -> Result<Generations> {
    if body.len() < 4 {
        return Err(Error::decode("truncated entries map: missing count"));
    }
    let mut count_bytes = [0u8; 4];
    count_bytes.copy_from_slice(&body[..4]);
    let count = u32::from_le_bytes(count_bytes) as usize;

    let records = &body[4..];
    if records.len() != count * RECORD_LEN {
        return Err(Error::decode(format!(
            "entries map body is {} bytes, expected {} records of {RECORD_LEN}",
            records.len(),
            count
        )));
    }

    let mut entries = Generations::new();
    for record in records.chunks_exact(RECORD_LEN) {
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&record[..8]);
        let gen_id = u64::from_le_bytes(id_bytes);
        let backing = BackingKind::from_wire(record[8])?;
        let empty = match record[9] {
            0 => false,
            1 => true,
            b => return Err(Error::decode(format!("invalid empty flag: {b}"))),
        };
        entries.insert(
            gen_id,
            Generation {
                gen_id,
                backing,
                empty,
            },
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Generations {
        let mut entries = Generations::new();
        entries.insert(
            0,
            Generation {
                gen_id: 0,
                backing: BackingKind::Fifo,
                empty: true,
            },
        );
        entries.insert(1, Generation::new(1, BackingKind::Omap));
        entries.insert(2, Generation::new(2, BackingKind::Fifo));
        entries
    }

    #[test]
    fn round_trip() {
        let entries = sample();
        assert_eq!(decode_generations(&encode_generations(&entries)).unwrap(), entries);

        let empty = Generations::new();
        assert_eq!(decode_generations(&encode_generations(&empty)).unwrap(), empty);
    }

    #[test]
    fn decode_rejects_truncation() {
        let body = encode_generations(&sample());
        assert!(decode_generations(&body[..2]).is_err());
        assert!(decode_generations(&body[..body.len() - 1]).is_err());

        let mut extra = body.clone();
        extra.push(0);
        assert!(decode_generations(&extra).is_err());
    }

    #[test]
    fn decode_rejects_bad_fields() {
        let mut body = encode_generations(&sample());
        let kind_off = 4 + 8;
        body[kind_off] = 7;
        assert!(matches!(
            decode_generations(&body).unwrap_err(),
            Error::Decode(_)
        ));

        let mut body = encode_generations(&sample());
        let empty_off = 4 + 9;
        body[empty_off] = 2;
        assert!(matches!(
            decode_generations(&body).unwrap_err(),
            Error::Decode(_)
        ));
    }

    #[test]
    fn lowest_nonempty_skips_the_drained_prefix() {
        assert_eq!(lowest_nonempty(&sample()), Some(1));
        assert_eq!(lowest_nonempty(&Generations::new()), None);

        let mut all_empty = Generations::new();
        all_empty.insert(
            0,
            Generation {
                gen_id: 0,
                backing: BackingKind::Omap,
                empty: true,
            },
        );
        assert_eq!(lowest_nonempty(&all_empty), None);
    }
}
