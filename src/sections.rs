//! Per-section byte ranges covering the tracked globals.

use crate::symbols::GlobalVariable;
use indexmap::IndexMap;

/// The smallest window of one section that contains every tracked global in
/// it.
///
/// Offsets are relative to the start of the section, so a variable at the
/// very beginning of `.data` has offset 0 regardless of where `.data` is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionRange {
    pub section_name: String,
    pub base_address: u64,
    /// Offset of the first tracked byte.
    pub data_start_offset: u64,
    /// Offset one past the last tracked byte.
    pub data_end_offset: u64,
}

impl SectionRange {
    fn seed(g: &GlobalVariable) -> Self {
        let start = g.section_offset();
        Self {
            section_name: g.section_name.clone(),
            base_address: g.section_base_address,
            data_start_offset: start,
            data_end_offset: start.saturating_add(g.size),
        }
    }

    fn cover(&mut self, g: &GlobalVariable) {
        let start = g.section_offset();
        self.data_start_offset = self.data_start_offset.min(start);
        self.data_end_offset =
            self.data_end_offset.max(start.saturating_add(g.size));
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Static address of the first tracked byte.
    pub fn data_start_address(&self) -> u64 {
        self.base_address + self.data_start_offset
    }

    pub fn size(&self) -> u64 {
        self.data_end_offset - self.data_start_offset
    }
}

/// Computes, for each section holding at least one global, the range that
/// covers all of them.
pub fn required_sections(
    globals: &IndexMap<String, GlobalVariable>,
) -> IndexMap<String, SectionRange> {
    let mut ranges: IndexMap<String, SectionRange> = IndexMap::new();
    for g in globals.values() {
        match ranges.get_mut(&g.section_name) {
            Some(r) => r.cover(g),
            None => {
                ranges.insert(g.section_name.clone(), SectionRange::seed(g));
            }
        }
    }
    ranges
}

#[cfg(test)]
mod test {
    use super::*;

    fn global(name: &str, address: u64, size: u64, section: &str, base: u64) -> GlobalVariable {
        GlobalVariable {
            name: name.to_string(),
            address,
            size,
            section_name: section.to_string(),
            section_base_address: base,
        }
    }

    fn globals(list: Vec<GlobalVariable>) -> IndexMap<String, GlobalVariable> {
        list.into_iter().map(|g| (g.name.clone(), g)).collect()
    }

    #[test]
    fn ranges_are_section_relative_and_tight() {
        let g = globals(vec![
            global("b", 0x4020, 8, ".data", 0x4000),
            global("a", 0x4010, 4, ".data", 0x4000),
            global("big", 0x5000, 0x100, ".bss", 0x4ff0),
            global("c", 0x4030, 2, ".data", 0x4000),
        ]);
        let r = required_sections(&g);

        assert_eq!(r.keys().collect::<Vec<_>>(), [".data", ".bss"]);
        let data = &r[".data"];
        assert_eq!(data.data_start_offset, 0x10);
        assert_eq!(data.data_end_offset, 0x32);
        assert_eq!(data.data_start_address(), 0x4010);
        assert_eq!(data.size(), 0x22);
        let bss = &r[".bss"];
        assert_eq!((bss.data_start_offset, bss.data_end_offset), (0x10, 0x110));
        assert_eq!(bss.base_address(), 0x4ff0);
    }

    #[test]
    fn every_global_is_covered() {
        let g = globals(vec![
            global("x", 0x600, 8, ".data", 0x600),
            global("y", 0x6f0, 16, ".data", 0x600),
            global("z", 0x640, 0, ".data", 0x600),
            global("w", 0x900, 4, ".bss", 0x800),
        ]);
        let r = required_sections(&g);
        for v in g.values() {
            let range = &r[&v.section_name];
            assert!(range.data_start_offset <= range.data_end_offset);
            assert!(v.section_offset() >= range.data_start_offset);
            assert!(v.section_offset() + v.size <= range.data_end_offset);
        }
    }

    #[test]
    fn single_global_seeds_both_bounds() {
        let g = globals(vec![global("only", 0x1008, 4, ".data", 0x1000)]);
        let r = required_sections(&g);
        assert_eq!(r[".data"], SectionRange {
            section_name: ".data".to_string(),
            base_address: 0x1000,
            data_start_offset: 8,
            data_end_offset: 12,
        });
    }
}
