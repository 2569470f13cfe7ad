//! Grouping of memory addresses into load regions.
//!
//! Loaded parts that share a common base address (their address minus
//! their file offset) belong to the same mapped region. The map
//! collects those bases, weeds out the ones unlikely to be real
//! mappings, and gives each survivor a unique uppercase name derived
//! from its largest member.

/// One inferred load region.
pub struct Region {
    base: u64,
    lo: u64,
    hi: u64,
    refs: u32,
    name: String,
    largest: u64,
}

impl Region {
    fn new(base: u64, addr: u64) -> Self {
        Self {
            base,
            lo: addr,
            hi: addr,
            refs: 0,
            name: String::new(),
            largest: 0,
        }
    }

    /// Presumed start address of the mapping.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Lowest address recorded in the region.
    pub fn lo(&self) -> u64 {
        self.lo
    }

    /// One past the highest address recorded in the region.
    pub fn hi(&self) -> u64 {
        self.hi
    }

    /// How many addresses were recorded in the region.
    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The collection of regions seen in one file.
#[derive(Default)]
pub struct AddressMap {
    regions: Vec<Region>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Records an address with its presumed offset inside the region,
    /// the size of the chunk that starts there, and the chunk's name.
    /// The largest chunk recorded against a region names it.
    pub fn record(&mut self, addr: u64, offset: u64, size: u64, name: &str) {
        let base = addr.wrapping_sub(offset);
        let index = match self.regions.iter().position(|r| r.base == base) {
            Some(index) => index,
            None => {
                self.regions.push(Region::new(base, addr));
                self.regions.len() - 1
            }
        };
        let region = &mut self.regions[index];
        region.refs += 1;
        if region.name.is_empty() || region.largest < size {
            region.name = name.to_string();
            region.largest = size;
        }
        region.lo = region.lo.min(addr);
        region.hi = region.hi.max(addr + size);
    }

    /// Weeds out regions unlikely to be real mappings and assigns the
    /// rest unique names. A region referenced once whose base is not
    /// page-aligned is discarded; the others get their largest
    /// member's name uppercased under an `ADDR_` prefix, with a
    /// numeric suffix wherever that collides.
    pub fn assign_names(&mut self) {
        let mut i = 0;
        while i < self.regions.len() {
            if self.regions[i].refs == 1 && self.regions[i].base & 0xfff != 0 {
                self.regions.swap_remove(i);
            } else {
                i += 1;
            }
        }

        for region in &mut self.regions {
            let stem: String = region
                .name
                .chars()
                .skip_while(|c| !c.is_ascii_alphanumeric())
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            region.name = format!("ADDR_{stem}");
        }

        for i in 0..self.regions.len().saturating_sub(1) {
            let stem = self.regions[i].name.clone();
            let mut n = 1;
            for j in i + 1..self.regions.len() {
                if self.regions[j].name == stem {
                    n += 1;
                    self.regions[j].name = format!("{stem}{n}");
                }
            }
            if n > 1 {
                self.regions[i].name.push('1');
            }
        }
    }

    /// The region an address falls in. Of the regions containing the
    /// address, the one with the highest base wins; an address just
    /// past a region's end matches that region as a fallback.
    pub fn find(&self, addr: u64) -> Option<&Region> {
        let mut best: Option<&Region> = None;
        for region in &self.regions {
            if addr >= region.lo
                && addr < region.hi
                && best.map_or(true, |b| region.base > b.base)
            {
                best = Some(region);
            }
        }
        best.or_else(|| self.regions.iter().find(|r| r.hi == addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_with_a_common_base_share_a_region() {
        let mut map = AddressMap::new();
        map.record(0x400078, 0x78, 0x40, ".text");
        map.record(0x4000b8, 0xb8, 0x10, ".comment");
        map.record(0x4000c8, 0xc8, 0x200, ".data");
        let region = map.regions().next().unwrap();
        assert_eq!(map.regions().count(), 1);
        assert_eq!(region.base(), 0x400000);
        assert_eq!(region.refs(), 3);
        assert_eq!(region.lo(), 0x400078);
        assert_eq!(region.hi(), 0x4002c8);
        // the largest member names the region
        assert_eq!(region.name(), ".data");
    }

    #[test]
    fn weeding_keeps_aligned_or_shared_bases() {
        let mut map = AddressMap::new();
        map.record(0x401000, 0, 0x10, ".text");
        map.record(0x7777, 0x7, 0x10, ".junk");
        map.record(0x5020, 0x20, 0x10, ".data");
        map.record(0x5040, 0x40, 0x10, ".got");
        map.assign_names();
        let names: Vec<&str> = map.regions().map(Region::name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"ADDR_TEXT"));
        assert!(names.contains(&"ADDR_DATA"));
    }

    #[test]
    fn names_are_uppercased_and_deduplicated() {
        let mut map = AddressMap::new();
        map.record(0x1000, 0, 8, ".rodata-1");
        map.record(0x2000, 0, 8, ".rodata-1");
        map.assign_names();
        let names: Vec<&str> = map.regions().map(Region::name).collect();
        assert_eq!(names, ["ADDR_RODATA_11", "ADDR_RODATA_12"]);
    }

    #[test]
    fn lookup_prefers_the_highest_containing_base() {
        let mut map = AddressMap::new();
        map.record(0x1000, 0, 0x3000, "low");
        map.record(0x2000, 0, 0x100, "high");
        map.assign_names();
        let region = map.find(0x2050).unwrap();
        assert_eq!(region.base(), 0x2000);
        // one past the end still resolves, anything further does not
        assert_eq!(map.find(0x4000).unwrap().base(), 0x1000);
        assert!(map.find(0x5000).is_none());
    }
}
