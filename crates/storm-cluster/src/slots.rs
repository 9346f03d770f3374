//! Key-to-slot hashing and the slot ownership table.
//!
//! Keys hash onto 16384 slots with CRC16 (XMODEM, polynomial 0x1021). A
//! `{tag}` inside the key narrows hashing to the tag so related keys land on
//! the same slot.

use std::collections::HashMap;

use crate::{ClusterError, NodeId};

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Lookup table for CRC16 with polynomial 0x1021, built at compile time.
static CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) ^ byte as u16) & 0xff) as usize]
    })
}

/// Returns the bytes that participate in hashing.
///
/// The tag is everything between the first `{` and the first `}` after it.
/// A missing or empty tag means the whole key is hashed, so `a{}b` and
/// `a{b` both hash verbatim.
fn hash_input(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

/// Computes the hash slot for a key, in `0..16384`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_input(key)) % SLOT_COUNT
}

/// An inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a validated range. Both bounds are inclusive.
    pub fn new(start: u16, end: u16) -> Result<Self, ClusterError> {
        if start > end || end >= SLOT_COUNT {
            return Err(ClusterError::InvalidRange {
                start: start as u32,
                end: end as u32,
            });
        }
        Ok(Self { start, end })
    }

    /// A range holding one slot. Callers guarantee `slot < SLOT_COUNT`.
    pub(crate) fn single(slot: u16) -> Self {
        Self {
            start: slot,
            end: slot,
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    /// Collapses a list of slots into sorted, coalesced ranges.
    ///
    /// Duplicates are ignored. Slots beyond the table are dropped.
    pub fn from_slots(slots: impl IntoIterator<Item = u16>) -> Vec<SlotRange> {
        let mut sorted: Vec<u16> = slots.into_iter().filter(|&s| s < SLOT_COUNT).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut ranges: Vec<SlotRange> = Vec::new();
        for slot in sorted {
            match ranges.last_mut() {
                Some(last) if last.end + 1 == slot => last.end = slot,
                _ => ranges.push(SlotRange::single(slot)),
            }
        }
        ranges
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Parses `"100"` or `"0-5460"`.
impl std::str::FromStr for SlotRange {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| ClusterError::Configuration(format!("invalid slot '{part}'")))
        };
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let slot = parse(s)?;
                (slot, slot)
            }
        };
        if start > end || end >= SLOT_COUNT as u32 {
            return Err(ClusterError::InvalidRange { start, end });
        }
        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }
}

/// The 16384-entry ownership table.
///
/// Entries hold node IDs, never node records; resolving an ID goes through
/// the registry's node map. An ID that no longer resolves is a dangling
/// entry and is reported separately by health checks.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: Box<[Option<NodeId>]>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    /// Returns the node ID recorded for `slot`, if any.
    pub fn owner(&self, slot: u16) -> Option<&NodeId> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn assign(&mut self, slot: u16, node: &NodeId) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = Some(node.clone());
        }
    }

    pub fn assign_range(&mut self, range: SlotRange, node: &NodeId) {
        for slot in range.iter() {
            self.assign(slot, node);
        }
    }

    pub fn unassign(&mut self, slot: u16) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = None;
        }
    }

    /// Empties every entry.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Clears every entry that points at `node`.
    pub fn release(&mut self, node: &NodeId) {
        for entry in self.slots.iter_mut() {
            if entry.as_ref() == Some(node) {
                *entry = None;
            }
        }
    }

    /// Number of entries holding any node ID.
    pub fn assigned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// All slots owned by `node`, merged into sorted ranges.
    pub fn slots_for_node(&self, node: &NodeId) -> Vec<SlotRange> {
        SlotRange::from_slots(
            self.slots
                .iter()
                .enumerate()
                .filter(|(_, owner)| owner.as_ref() == Some(node))
                .map(|(slot, _)| slot as u16),
        )
    }

    /// Slot count per recorded owner.
    pub fn slot_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for owner in self.slots.iter().flatten() {
            *counts.entry(owner.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Iterates `(slot, owner)` over every entry.
    pub fn iter(&self) -> impl Iterator<Item = (u16, Option<&NodeId>)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(slot, owner)| (slot as u16, owner.as_ref()))
    }
}
