//! Single-entry Address Translation Cache (spec.md §3, §4.5, §4.6).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtcPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtcLookup {
    pub output_addr: u64,
}

#[derive(Debug, Default)]
pub struct Atc {
    valid: bool,
    input_addr: u64,
    output_addr: u64,
    range_size: u32,
    permissions: AtcPermissions,
    pasid_valid: bool,
    pasid_val: u32,
}

impl Atc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Atc::default();
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn store(
        &mut self,
        input_addr: u64,
        output_addr: u64,
        range_size: u32,
        permissions: AtcPermissions,
        pasid_valid: bool,
        pasid_val: u32,
    ) {
        self.valid = true;
        self.input_addr = input_addr;
        self.output_addr = output_addr;
        self.range_size = range_size;
        self.permissions = permissions;
        self.pasid_valid = pasid_valid;
        self.pasid_val = pasid_val;
    }

    fn contains(&self, addr: u64) -> bool {
        self.valid
            && addr >= self.input_addr
            && addr < self.input_addr.wrapping_add(self.range_size as u64)
    }

    /// spec.md §4.4 effective-address lookup: hits iff the ATC is
    /// valid, `addr` falls in `[input, input+range)`, and the PASID
    /// state matches (no PASID on either side, or a matching PASID).
    pub fn lookup(&self, addr: u64, pasid_en: bool, pasid_val: u32) -> Option<AtcLookup> {
        if !self.contains(addr) {
            return None;
        }
        let pasid_matches = (!pasid_en && !self.pasid_valid)
            || (pasid_en && self.pasid_valid && pasid_val == self.pasid_val);
        if !pasid_matches {
            return None;
        }
        Some(AtcLookup {
            output_addr: self.output_addr + (addr - self.input_addr),
        })
    }

    /// Whether `[range_start, range_start+range_len)` overlaps the
    /// cached translation, used by the invalidation handler (spec.md §4.6).
    pub fn overlaps(&self, range_start: u64, range_len: u64) -> bool {
        if !self.valid {
            return false;
        }
        let a_end = self.input_addr.saturating_add(self.range_size as u64);
        let b_end = range_start.saturating_add(range_len);
        self.input_addr < b_end && range_start < a_end
    }

    pub fn pasid_valid(&self) -> bool {
        self.pasid_valid
    }

    pub fn pasid_val(&self) -> u32 {
        self.pasid_val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_when_invalid() {
        let atc = Atc::new();
        assert!(atc.lookup(0x1000, false, 0).is_none());
    }

    #[test]
    fn hit_without_pasid() {
        let mut atc = Atc::new();
        atc.store(0x1000, 0x9000, 0x1000, AtcPermissions::default(), false, 0);
        let hit = atc.lookup(0x1500, false, 0).unwrap();
        assert_eq!(hit.output_addr, 0x9500);
    }

    #[test]
    fn pasid_mismatch_misses() {
        let mut atc = Atc::new();
        atc.store(0x1000, 0x9000, 0x1000, AtcPermissions::default(), true, 7);
        assert!(atc.lookup(0x1500, true, 8).is_none());
        assert!(atc.lookup(0x1500, true, 7).is_some());
    }

    #[test]
    fn overlap_detection() {
        let mut atc = Atc::new();
        atc.store(0x10000, 0x0, 0x1000, AtcPermissions::default(), false, 0);
        assert!(atc.overlaps(0x10800, 0x100));
        assert!(!atc.overlaps(0x20000, 0x100));
    }

    #[test]
    fn clear_invalidates() {
        let mut atc = Atc::new();
        atc.store(0x1000, 0x9000, 0x1000, AtcPermissions::default(), false, 0);
        atc.clear();
        assert!(!atc.is_valid());
        assert!(atc.lookup(0x1500, false, 0).is_none());
    }
}
