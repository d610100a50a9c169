//! Global variable extraction from the ELF symbol table.
//!
//! This works purely from the symbol table and section headers. Debug info is
//! not consulted, so it still works on binaries whose DWARF is missing or
//! unhelpful.

use crate::{Error, Result};
use indexmap::IndexMap;
use object::elf::{STB_GLOBAL, STT_OBJECT};
use object::{
    Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, SymbolFlags,
    SymbolSection,
};
use std::collections::BTreeMap;

/// Sections a global has to live in for us to track it.
pub const WRITABLE_SECTIONS: [&str; 2] = [".data", ".bss"];

/// Section name used for symbols whose section index doesn't resolve.
pub const UNKNOWN_SECTION: &str = "unknown";

/// Which symbol table a `SymbolTable` was read from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolSource {
    /// `.symtab`, the full static symbol table.
    Static,
    /// `.dynsym`, used when the binary has been stripped of `.symtab`.
    Dynamic,
}

/// One ELF symbol, reduced to the fields global extraction looks at.
#[derive(Clone, Debug)]
pub struct ElfSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    /// `STT_*` type from `st_info`.
    pub kind: u8,
    /// `STB_*` binding from `st_info`.
    pub binding: u8,
    /// Index of the owning section, for symbols that have one.
    pub section_index: Option<usize>,
}

impl ElfSymbol {
    pub fn from_info(
        name: impl Into<String>,
        value: u64,
        size: u64,
        st_info: u8,
        section_index: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            size,
            kind: st_info & 0xf,
            binding: st_info >> 4,
            section_index,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SectionHeader {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// Symbols and section headers of a binary.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    pub source: SymbolSource,
    pub symbols: Vec<ElfSymbol>,
    /// Section headers by index.
    pub sections: BTreeMap<usize, SectionHeader>,
}

impl SymbolTable {
    /// Reads the symbol table of an ELF file, preferring `.symtab` and falling
    /// back to `.dynsym`.
    pub fn from_object(object: &object::File) -> Result<Self> {
        if object.format() != object::BinaryFormat::Elf {
            return Err(Error::Format(format!(
                "{:?} is not supported, only ELF",
                object.format()
            )));
        }

        let (source, table) = match object.symbol_table() {
            Some(t) => (SymbolSource::Static, t),
            None => match object.dynamic_symbol_table() {
                Some(t) => {
                    tracing::info!("no .symtab, falling back to .dynsym");
                    (SymbolSource::Dynamic, t)
                }
                None => return Err(Error::SymbolTableUnavailable),
            },
        };

        let mut symbols = vec![];
        for sym in table.symbols() {
            let name = match sym.name() {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(index = sym.index().0, %e, "unreadable symbol name");
                    continue;
                }
            };
            let st_info = match sym.flags() {
                SymbolFlags::Elf { st_info, .. } => st_info,
                _ => continue,
            };
            let section_index = match sym.section() {
                SymbolSection::Section(i) => Some(i.0),
                _ => None,
            };
            symbols.push(ElfSymbol::from_info(
                name,
                sym.address(),
                sym.size(),
                st_info,
                section_index,
            ));
        }

        let mut sections = BTreeMap::new();
        for s in object.sections() {
            sections.insert(s.index().0, SectionHeader {
                name: s.name().unwrap_or_default().to_string(),
                address: s.address(),
                size: s.size(),
            });
        }

        tracing::debug!(
            ?source,
            symbols = symbols.len(),
            sections = sections.len(),
            "read symbol table"
        );
        Ok(Self {
            source,
            symbols,
            sections,
        })
    }

    /// Resolves a section index, yielding `None` when it's out of bounds.
    pub fn section(&self, index: usize) -> Option<&SectionHeader> {
        self.sections.get(&index)
    }

    fn section_name(&self, index: Option<usize>) -> &str {
        index
            .and_then(|i| self.section(i))
            .map(|s| s.name.as_str())
            .unwrap_or(UNKNOWN_SECTION)
    }
}

/// A global, writable data object, as recorded in the binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalVariable {
    pub name: String,
    /// Static virtual address. Not a live-process address; see
    /// `ProcessImageLocation::live_address`.
    pub address: u64,
    pub size: u64,
    pub section_name: String,
    pub section_base_address: u64,
}

impl GlobalVariable {
    /// Offset of the variable from the start of its section.
    pub fn section_offset(&self) -> u64 {
        self.address - self.section_base_address
    }
}

/// Picks the symbols that name global data objects in `.data` or `.bss`.
///
/// Local and weak symbols, anything that isn't `STT_OBJECT`, and names
/// starting with `__` are left out. Symbol names are expected to be unique;
/// if one repeats, the first occurrence is kept.
pub fn extract_globals(table: &SymbolTable) -> IndexMap<String, GlobalVariable> {
    let mut globals = IndexMap::new();
    for sym in &table.symbols {
        if sym.kind != STT_OBJECT
            || sym.binding != STB_GLOBAL
            || sym.name.starts_with("__")
        {
            continue;
        }
        let section_name = table.section_name(sym.section_index);
        if !WRITABLE_SECTIONS.contains(&section_name) {
            continue;
        }
        // Passed the name test, so the index resolved.
        let Some(section) = sym.section_index.and_then(|i| table.section(i))
        else {
            continue;
        };
        if sym.value < section.address {
            tracing::warn!(
                symbol = %sym.name,
                address = sym.value,
                section = %section.name,
                "symbol lies before the start of its section"
            );
            continue;
        }
        if globals.contains_key(&sym.name) {
            tracing::warn!(symbol = %sym.name, "duplicate global symbol ignored");
            continue;
        }
        globals.insert(sym.name.clone(), GlobalVariable {
            name: sym.name.clone(),
            address: sym.value,
            size: sym.size,
            section_name: section_name.to_string(),
            section_base_address: section.address,
        });
    }
    globals
}

#[cfg(test)]
mod test {
    use super::*;
    use object::elf::{STB_LOCAL, STB_WEAK, STT_FUNC, STT_SECTION};

    fn info(binding: u8, kind: u8) -> u8 {
        (binding << 4) | kind
    }

    fn table(symbols: Vec<ElfSymbol>) -> SymbolTable {
        let mut sections = BTreeMap::new();
        for (i, name, address, size) in [
            (0, "", 0, 0),
            (1, ".text", 0x1000, 0x800),
            (2, ".rodata", 0x2000, 0x100),
            (3, ".data", 0x4000, 0x40),
            (4, ".bss", 0x4040, 0x100),
        ] {
            sections.insert(i, SectionHeader {
                name: name.to_string(),
                address,
                size,
            });
        }
        SymbolTable {
            source: SymbolSource::Static,
            symbols,
            sections,
        }
    }

    #[test]
    fn selects_global_data_objects() {
        let obj = info(STB_GLOBAL, STT_OBJECT);
        let t = table(vec![
            ElfSymbol::from_info("counter", 0x4010, 4, obj, Some(3)),
            ElfSymbol::from_info("buffer", 0x4080, 64, obj, Some(4)),
            ElfSymbol::from_info("table", 0x2000, 16, obj, Some(2)),
            ElfSymbol::from_info("main", 0x1000, 32, info(STB_GLOBAL, STT_FUNC), Some(1)),
            ElfSymbol::from_info("hidden", 0x4014, 4, info(STB_LOCAL, STT_OBJECT), Some(3)),
            ElfSymbol::from_info("maybe", 0x4018, 4, info(STB_WEAK, STT_OBJECT), Some(3)),
            ElfSymbol::from_info(".data", 0x4000, 0, info(STB_LOCAL, STT_SECTION), Some(3)),
            ElfSymbol::from_info("__dso_handle", 0x4008, 8, obj, Some(3)),
            ElfSymbol::from_info("stray", 0x4020, 4, obj, Some(99)),
            ElfSymbol::from_info("abs", 0x10, 4, obj, None),
        ]);

        let globals = extract_globals(&t);
        assert_eq!(globals.keys().collect::<Vec<_>>(), ["counter", "buffer"]);
        assert_eq!(globals["counter"], GlobalVariable {
            name: "counter".to_string(),
            address: 0x4010,
            size: 4,
            section_name: ".data".to_string(),
            section_base_address: 0x4000,
        });
        assert_eq!(globals["counter"].section_offset(), 0x10);
        assert_eq!(globals["buffer"].section_name, ".bss");
        assert_eq!(globals["buffer"].section_offset(), 0x40);
    }

    #[test]
    fn short_names_are_fine() {
        let obj = info(STB_GLOBAL, STT_OBJECT);
        let t = table(vec![
            ElfSymbol::from_info("_", 0x4000, 1, obj, Some(3)),
            ElfSymbol::from_info("", 0x4001, 1, obj, Some(3)),
        ]);
        let globals = extract_globals(&t);
        assert!(globals.contains_key("_"));
    }

    #[test]
    fn first_duplicate_wins() {
        let obj = info(STB_GLOBAL, STT_OBJECT);
        let t = table(vec![
            ElfSymbol::from_info("twice", 0x4000, 4, obj, Some(3)),
            ElfSymbol::from_info("twice", 0x4060, 8, obj, Some(4)),
        ]);
        let globals = extract_globals(&t);
        assert_eq!(globals.len(), 1);
        assert_eq!(globals["twice"].address, 0x4000);
        assert_eq!(globals["twice"].section_name, ".data");
    }

    #[test]
    fn st_info_is_split() {
        let s = ElfSymbol::from_info("x", 0, 0, 0x11, None);
        assert_eq!(s.binding, STB_GLOBAL);
        assert_eq!(s.kind, STT_OBJECT);
    }

    #[test]
    fn reads_own_symbol_table() {
        let exe = std::env::current_exe().unwrap();
        let buffer = std::fs::read(exe).unwrap();
        let object = object::File::parse(&*buffer).unwrap();
        let t = SymbolTable::from_object(&object).unwrap();
        assert!(!t.symbols.is_empty());
        assert!(t.sections.values().any(|s| s.name == ".text"));
    }

    #[test]
    fn no_symbol_tables_is_unavailable() {
        let buffer = crate::test::bare_elf(object::elf::ET_EXEC);
        let object = object::File::parse(&*buffer).unwrap();
        assert!(matches!(
            SymbolTable::from_object(&object),
            Err(Error::SymbolTableUnavailable)
        ));
    }
}
