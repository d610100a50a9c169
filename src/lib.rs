//! Inspect and modify the global variables of a running process, using only
//! the debug information in its binary.
//!
//! The static half of the crate reads an ELF file: `parse_file` builds a
//! [`TypeDb`] from its DWARF, [`layout`] flattens structured variables into
//! leaf fields with byte offsets, [`symbols`] pulls writable globals out of the
//! symbol table, and [`sections`] works out which parts of `.data` and `.bss`
//! those globals occupy.
//!
//! The live half finds the binary's image in a running process
//! ([`procmaps`]) and reads or writes its memory ([`access`]), either through a
//! shared mapping of `/proc/<pid>/mem` or through `process_vm_readv` and
//! friends.

pub mod access;
pub mod dwarf_parser;
pub mod error;
pub mod layout;
pub mod procmaps;
pub mod sections;
pub mod symbols;
pub mod value;
mod model;

pub use error::{Error, Result};
pub use model::*;

use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

// Internal type abbreviations
type BTreeIndex<I, K> = BTreeMap<K, BTreeSet<I>>;

/// A database of information extracted from the debug info of a program.
///
/// This holds the type graph and the file-scope variables. It is built once
/// per binary and never modified afterwards.
#[derive(Clone, Debug, Default)]
pub struct TypeDb {
    /// Endianness of the target system.
    endian: gimli::RunTimeEndian,
    /// Pointer width of the target system. Currently only 32 and 64 are
    /// supported here.
    is_64: bool,

    /// All types in the program, indexed by location in the debug section(s).
    ///
    /// Invariant: within each entry, the key is the same as the type's `offset`
    /// field.
    types: BTreeMap<TypeId, Type>,

    /// Index: type name to location(s) that can be looked up in `types`.
    type_name_index: BTreeIndex<TypeId, String>,

    /// All file-scope variables with a name.
    variables: BTreeMap<VarId, StaticVariable>,

    /// Index: variable name to location(s) in `variables`.
    variable_name_index: BTreeIndex<VarId, String>,
}

impl TypeDb {
    /// Gets the endianness of the program.
    pub fn endian(&self) -> gimli::RunTimeEndian {
        self.endian
    }

    /// Gets the size of a pointer in the program, in bytes.
    pub fn pointer_size(&self) -> u64 {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    /// Returns the number of types in the debug info.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Produces an iterator over all types defined in the debug info, together
    /// with their IDs.
    pub fn types(
        &self,
    ) -> impl Iterator<Item = (TypeId, &Type)> + '_ {
        self.types.iter().map(|(&id, ty)| (id, ty))
    }

    /// Looks up the type with the given ID.
    ///
    /// Debug info is sometimes partial, so a `TypeId` taken from a member or
    /// variable is not guaranteed to resolve.
    pub fn type_by_id(
        &self,
        id: TypeId,
    ) -> Option<&Type> {
        self.types.get(&id)
    }

    /// Like `type_by_id`, but failing with `UnresolvedType`.
    pub fn resolve(&self, id: TypeId) -> Result<&Type> {
        self.type_by_id(id).ok_or(Error::UnresolvedType(id))
    }

    /// Shorthand for looking up the name of a type.
    pub fn type_name(
        &self,
        id: TypeId,
    ) -> Option<Cow<'_, str>> {
        Some(self.type_by_id(id)?.name(self))
    }

    /// Consults the type-name index and returns an iterator over types with a
    /// given name.
    ///
    /// Names are matched in their entirety. Unnamed types (pointers, arrays,
    /// qualifiers) are not in the index.
    pub fn types_by_name(
        &self,
        name: &str,
    ) -> impl Iterator<Item = (TypeId, &Type)> + '_ {
        self.type_name_index
            .get(name)
            .into_iter()
            .flat_map(move |set| {
                set.iter().map(move |&id| (id, &self.types[&id]))
            })
    }

    /// Iterates over all named file-scope variables.
    pub fn variables(
        &self,
    ) -> impl Iterator<Item = (VarId, &StaticVariable)> + '_ {
        self.variables.iter().map(|(&id, v)| (id, v))
    }

    /// Finds variables by exact name. Static variables in different
    /// compilation units can share a name.
    pub fn variables_by_name(
        &self,
        name: &str,
    ) -> impl Iterator<Item = (VarId, &StaticVariable)> + '_ {
        self.variable_name_index
            .get(name)
            .into_iter()
            .flat_map(move |set| {
                set.iter().map(move |&id| (id, &self.variables[&id]))
            })
    }
}

/// A variable entry as it appears in the debug info, before declarations and
/// definitions have been matched up.
#[derive(Clone, Debug)]
pub(crate) struct VariableEntry {
    pub name: Option<String>,
    pub type_id: Option<TypeId>,
    pub location: Option<u64>,
    /// For a definition that completes an earlier declaration, the location of
    /// that declaration. The definition usually carries only the address.
    pub specification: Option<gimli::UnitSectionOffset>,
    pub offset: gimli::UnitSectionOffset,
}

/// Builder that accumulates the type information from a program and produces a
/// `TypeDb` database.
///
/// This is primarily intended as a write-only sink for type information. After
/// everything is stuffed in, `build()` will link variables to their
/// declarations, generate indices, and produce a `TypeDb` database.
#[derive(Clone, Debug)]
pub struct TypeDbBuilder {
    path: Vec<String>,
    endian: gimli::RunTimeEndian,
    is_64: bool,
    types: BTreeMap<TypeId, Type>,
    variables: BTreeMap<VarId, VariableEntry>,
}

impl TypeDbBuilder {
    /// Creates a new `TypeDbBuilder` for information from a program with the
    /// given endianness and pointer width.
    pub fn new(endian: gimli::RunTimeEndian, is_64: bool) -> Self {
        Self {
            endian,
            path: vec![],
            is_64,
            types: BTreeMap::new(),
            variables: BTreeMap::new(),
        }
    }

    pub fn build(self) -> TypeDb {
        // Count, but tolerate, references to types we never saw. They turn
        // into UnresolvedType skips during layout.
        let dangling = self
            .types
            .values()
            .flat_map(referenced_types)
            .filter(|id| !self.types.contains_key(id))
            .count();
        if dangling > 0 {
            tracing::warn!(
                dangling,
                "debug info references types that are not defined"
            );
        }

        let type_name_index = index_by_key(&self.types, |_, t| match t {
            Type::Struct(s) => s.name.clone(),
            Type::Alias(a) => a.name.clone(),
            Type::Scalar(s) => s.name.clone(),
        });

        // Definitions that point at a declaration inherit its name and type;
        // the declaration itself is then redundant.
        let completed: BTreeSet<_> = self
            .variables
            .values()
            .filter_map(|v| v.specification)
            .collect();
        let mut variables = BTreeMap::new();
        for (&id, v) in &self.variables {
            if completed.contains(&id.0) && v.location.is_none() {
                continue;
            }
            let decl = v
                .specification
                .and_then(|s| self.variables.get(&VarId(s)));
            let name = v
                .name
                .clone()
                .or_else(|| decl.and_then(|d| d.name.clone()));
            let Some(name) = name else {
                tracing::debug!(offset = ?v.offset, "skipping nameless variable");
                continue;
            };
            variables.insert(id, StaticVariable {
                name,
                type_id: v.type_id.or_else(|| decl.and_then(|d| d.type_id)),
                location: v.location,
                offset: v.offset,
            });
        }
        let variable_name_index =
            index_by_key(&variables, |_, v| Some(v.name.clone()));

        TypeDb {
            endian: self.endian,
            is_64: self.is_64,
            types: self.types,
            type_name_index,
            variables,
            variable_name_index,
        }
    }

    /// Adds a type to the database.
    ///
    /// It's unusual to call this from outside the library, but it might be
    /// useful if you have additional type information from some outside source.
    pub fn record_type(&mut self, t: impl Into<Type>) {
        let t = t.into();
        self.types.insert(TypeId(t.offset()), t);
    }

    /// Adds a fully-formed variable to the database.
    pub fn record_variable(&mut self, v: StaticVariable) {
        self.record_variable_entry(VariableEntry {
            name: Some(v.name),
            type_id: v.type_id,
            location: v.location,
            specification: None,
            offset: v.offset,
        });
    }

    pub(crate) fn record_variable_entry(&mut self, v: VariableEntry) {
        self.variables.insert(VarId(v.offset), v);
    }

    fn format_path(&self, name: impl std::fmt::Display) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", self.path.join("::"), name)
        }
    }

    /// Pushes a path component onto the namespace path stack and runs `body`,
    /// popping the stack when it completes.
    fn path_component<T>(
        &mut self,
        c: impl Into<String>,
        body: impl FnOnce(&mut Self) -> T,
    ) -> T {
        self.path.push(c.into());
        let result = body(self);
        self.path.pop();
        result
    }
}

/// Lists the types a type refers to directly.
fn referenced_types(t: &Type) -> Vec<TypeId> {
    match t {
        Type::Struct(s) => s.members.iter().filter_map(|m| m.type_id).collect(),
        Type::Alias(a) => a.target.into_iter().collect(),
        Type::Scalar(s) => match &s.kind {
            ScalarKind::Pointer { .. } => vec![],
            ScalarKind::Array { element_type_id, .. } => vec![*element_type_id],
            ScalarKind::Base(_) | ScalarKind::Enum | ScalarKind::Union => {
                vec![]
            }
        },
    }
}

/// Utility for indexing entries in a key-value table by some projection.
///
/// `table` is a sequence of keys and values in arbitrary order.
///
/// `project` takes a key-value pair and produces some datum to be indexed.
///
/// The result is a mapping from the data produced by `project` to keys in
/// `table`.
fn index_by_key<'t, K: 't, V: 't, T>(
    table: impl IntoIterator<Item = (&'t K, &'t V)>,
    mut project: impl FnMut(&K, &V) -> Option<T>,
) -> BTreeMap<T, BTreeSet<K>>
where
    T: Ord,
    K: Ord + Clone,
{
    let mut index: BTreeMap<T, BTreeSet<K>> = BTreeMap::new();

    for (k, v) in table {
        if let Some(i) = project(k, v) {
            index.entry(i).or_default().insert(k.clone());
        }
    }

    index
}

/// Parses type and variable information from an `object::File`.
///
/// Fails with `Error::Format` if the file carries no debug info at all.
pub fn parse_file<'a>(
    object: &'a object::File,
) -> Result<TypeDb> {
    if object.section_by_name(".debug_info").is_none() {
        return Err(Error::Format("binary has no .debug_info section".into()));
    }

    let endian = if object.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let load_section =
        |id: gimli::SectionId| -> std::result::Result<Cow<'a, [u8]>, gimli::Error> {
            match object.section_by_name(id.name()) {
                Some(section) => Ok(section
                    .uncompressed_data()
                    .unwrap_or(Default::default())),
                None => Ok(Default::default()),
            }
        };

    let dwarf_cow = gimli::Dwarf::load(&load_section)?;

    let dwarf =
        dwarf_cow.borrow(|section| gimli::EndianSlice::new(section, endian));

    let mut iter = dwarf.units();
    let mut builder = TypeDbBuilder::new(endian, object.is_64());

    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;

        let mut entries = unit.entries();
        while let Some(()) = entries.next_entry()? {
            if entries.current().is_none() {
                break;
            }
            dwarf_parser::parse_entry(&dwarf, &unit, &mut entries, &mut builder)?;
        }
    }

    let db = builder.build();
    tracing::debug!(
        types = db.type_count(),
        variables = db.variables.len(),
        "parsed debug info"
    );
    Ok(db)
}

#[cfg(test)]
mod test {
    use super::*;

    fn goff(n: usize) -> gimli::UnitSectionOffset {
        gimli::DebugInfoOffset(n).into()
    }

    /// A little-endian x86-64 ELF header of type `e_type` and nothing else: no
    /// sections, no segments, so no debug info and no symbols either.
    pub(crate) fn bare_elf(e_type: u16) -> Vec<u8> {
        let mut b = vec![0u8; 64];
        b[..7].copy_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1]);
        b[16..18].copy_from_slice(&e_type.to_le_bytes());
        b[18..20].copy_from_slice(&62u16.to_le_bytes());
        b[20..24].copy_from_slice(&1u32.to_le_bytes());
        b[52..54].copy_from_slice(&64u16.to_le_bytes());
        b[54..56].copy_from_slice(&56u16.to_le_bytes());
        b[58..60].copy_from_slice(&64u16.to_le_bytes());
        b
    }

    #[repr(C)]
    pub struct SampleInner {
        pub a: u16,
        pub b: u16,
    }

    #[repr(C)]
    pub struct SampleCounters {
        pub count: u32,
        pub inner: SampleInner,
        pub total: u64,
    }

    #[no_mangle]
    pub static PROCVARS_SAMPLE_COUNTERS: SampleCounters = SampleCounters {
        count: 7,
        inner: SampleInner { a: 1, b: 2 },
        total: 99,
    };

    #[test]
    fn definition_inherits_declaration() {
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        builder.record_type(Scalar {
            name: Some("int".to_string()),
            kind: ScalarKind::Base(Encoding::Signed),
            byte_size: Some(4),
            offset: goff(1),
        });
        builder.record_variable_entry(VariableEntry {
            name: Some("counter".to_string()),
            type_id: Some(TypeId(goff(1))),
            location: None,
            specification: None,
            offset: goff(2),
        });
        builder.record_variable_entry(VariableEntry {
            name: None,
            type_id: None,
            location: Some(0x2000),
            specification: Some(goff(2)),
            offset: goff(3),
        });
        let db = builder.build();

        let vars: Vec<_> = db.variables_by_name("counter").collect();
        assert_eq!(vars.len(), 1);
        let (_, v) = vars[0];
        assert_eq!(v.location, Some(0x2000));
        assert_eq!(v.type_id, Some(TypeId(goff(1))));
    }

    #[test]
    fn byte_size_through_aliases_and_arrays() {
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, false);
        builder.record_type(Scalar {
            name: Some("short".to_string()),
            kind: ScalarKind::Base(Encoding::Signed),
            byte_size: Some(2),
            offset: goff(1),
        });
        builder.record_type(Alias {
            name: Some("s16".to_string()),
            kind: AliasKind::Typedef,
            target: Some(TypeId(goff(1))),
            offset: goff(2),
        });
        builder.record_type(Scalar {
            name: None,
            kind: ScalarKind::Array {
                element_type_id: TypeId(goff(2)),
                count: Some(6),
            },
            byte_size: None,
            offset: goff(3),
        });
        builder.record_type(Scalar {
            name: None,
            kind: ScalarKind::Pointer { type_id: None },
            byte_size: None,
            offset: goff(4),
        });
        let db = builder.build();

        let ary = db.type_by_id(TypeId(goff(3))).unwrap();
        assert_eq!(ary.byte_size(&db), Some(12));
        assert_eq!(ary.name(&db), "s16[6]");
        let ptr = db.type_by_id(TypeId(goff(4))).unwrap();
        assert_eq!(ptr.byte_size(&db), Some(4));
        assert_eq!(ptr.name(&db), "void *");
        assert_eq!(db.types_by_name("s16").count(), 1);
    }

    #[test]
    fn missing_debug_info_is_a_format_error() {
        let buffer = bare_elf(object::elf::ET_DYN);
        let object = object::File::parse(&*buffer).unwrap();
        assert!(matches!(parse_file(&object), Err(Error::Format(_))));
    }

    #[test]
    fn reads_own_debug_info() {
        let exe = std::env::current_exe().unwrap();
        let buffer = std::fs::read(exe).unwrap();
        let object = object::File::parse(&*buffer).unwrap();
        let db = parse_file(&object).unwrap();

        let (_, var) = db
            .variables()
            .find(|(_, v)| {
                v.name.ends_with("PROCVARS_SAMPLE_COUNTERS") && v.location.is_some()
            })
            .expect("sample static in debug info");

        // The debug info address agrees with the symbol table.
        let symtab = symbols::SymbolTable::from_object(&object).unwrap();
        let sym = symtab
            .symbols
            .iter()
            .find(|s| s.name == "PROCVARS_SAMPLE_COUNTERS")
            .unwrap();
        assert_eq!(var.location, Some(sym.value));
        assert_eq!(sym.size, 16);

        let fields = layout::flatten(&db, var.type_id.unwrap(), &var.name).unwrap();
        let got: Vec<_> = fields
            .iter()
            .map(|f| (f.path.clone(), f.offset, f.size))
            .collect();
        let n = &var.name;
        assert_eq!(
            got,
            [
                (format!("{}.count", n), 0, 4),
                (format!("{}.inner.a", n), 4, 2),
                (format!("{}.inner.b", n), 6, 2),
                (format!("{}.total", n), 8, 8),
            ]
        );

        // And it points at the live static once translated.
        let name = std::env::current_exe().unwrap();
        let name = name.file_name().unwrap().to_str().unwrap();
        let loc = procmaps::locate_pid(std::process::id(), name).unwrap();
        let live = loc.live_address(
            var.location.unwrap(),
            procmaps::AddressTranslation::for_object(&object),
        );
        assert_eq!(live, std::ptr::addr_of!(PROCVARS_SAMPLE_COUNTERS) as u64);
    }
}
