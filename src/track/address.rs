//! Device address remapping
//!
//! Buffers captured with device-address usage land at different addresses on
//! replay. This module keeps the set of known address ranges from the
//! capture, translates old addresses into new ones, and scans freshly
//! written memory for words that look like device addresses.

use {
    super::{BufferRecord, ChangeSource},
    log::trace,
};

/// One known interval `[base, base + size)` with its replay-side base and
/// the dense index of the backing record. Intervals may overlap; a buffer
/// and an acceleration structure placed inside it both own ranges.
#[derive(Clone, Copy, Debug)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
    pub new_base: u64,
    pub index: u32,
}

impl AddressRange {
    fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.size
    }
}

/// Overlapping address-range set with smallest-enclosing-range lookup.
#[derive(Debug, Default)]
pub struct AddressRemapper {
    /// Sorted by base address.
    ranges: Vec<AddressRange>,
}

impl AddressRemapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, base: u64, size: u64, new_base: u64, index: u32) {
        assert!(size > 0);
        let at = self.ranges.partition_point(|r| r.base < base);
        self.ranges.insert(
            at,
            AddressRange {
                base,
                size,
                new_base,
                index,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// The range containing `address` with the smallest size among all
    /// matches.
    pub fn get_by_address(&self, address: u64) -> Option<&AddressRange> {
        let end = self.ranges.partition_point(|r| r.base <= address);
        self.ranges[..end]
            .iter()
            .filter(|r| r.contains(address))
            .min_by_key(|r| r.size)
    }

    /// Translate a captured address into its replay equivalent, or 0 when
    /// the address is not inside any known range.
    pub fn translate_address(&self, address: u64) -> u64 {
        match self.get_by_address(address) {
            Some(range) => range.new_base + (address - range.base),
            None => 0,
        }
    }

    /// All ranges overlapping `[address, address + len)`.
    pub fn get_by_range(&self, address: u64, len: u64) -> Vec<&AddressRange> {
        self.ranges
            .iter()
            .filter(|r| r.base < address + len && address < r.base + r.size)
            .collect()
    }

    /// Fast rejection test: true only when some interval contains `address`.
    pub fn is_candidate(&self, address: u64) -> bool {
        self.get_by_address(address).is_some()
    }
}

/// A word in a buffer that looked like a device address when it was written.
#[derive(Clone, Copy, Debug)]
pub struct AddressCandidate {
    /// The value found.
    pub address: u64,

    /// Last write to the memory area the value came from.
    pub source: ChangeSource,
}

/// Scan a freshly written segment of a buffer for device-address candidates.
///
/// Positions are probed on 4-byte alignment, reading the full 64-bit word at
/// each. `base_offset` is where `bytes` starts inside the buffer. Known
/// candidates whose value changed are updated if still plausible and removed
/// otherwise; new plausible words are added. Returns the number of newly
/// found candidates.
#[profiling::function]
pub fn find_address_candidates(
    remappers: &[&AddressRemapper],
    buffer: &mut BufferRecord,
    bytes: &[u8],
    base_offset: u64,
    source: ChangeSource,
) -> u32 {
    let mut found = 0;

    // Search on a 4-byte aligned boundary
    let misalign = (base_offset % 4) as usize;
    let start = if misalign == 0 { 0 } else { 4 - misalign };

    let mut at = start;
    while at + 8 <= bytes.len() {
        let offset = base_offset + at as u64;
        let candidate = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        at += 4;

        let plausible = remappers.iter().any(|r| r.is_candidate(candidate));

        if let Some(existing) = buffer.candidates.get_mut(&offset) {
            if existing.address != candidate {
                if plausible {
                    existing.address = candidate;
                    existing.source = source;
                } else {
                    buffer.candidates.remove(&offset);
                }
            }
            continue;
        }

        if plausible {
            trace!(
                "address candidate {candidate:#x} at offset {offset} of buffer {}",
                buffer.base.index
            );
            buffer.candidates.insert(offset, AddressCandidate { address: candidate, source });
            found += 1;
        }
    }

    found
}
