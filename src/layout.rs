//! Struct layout resolution: flattening structured variables into the byte
//! ranges of their leaf fields.
//!
//! A leaf is any member whose type (after looking through typedefs and
//! qualifiers) is not a structure. Intermediate structures never get a
//! descriptor of their own; their leaves are spliced into the parent's list
//! with cumulative offsets and dotted paths.

use crate::model::MAX_ALIAS_CHAIN;
use crate::{AliasKind, Error, Result, Struct, Type, TypeDb, TypeId};
use indexmap::IndexMap;

/// Structures nested deeper than this are assumed to be broken debug info.
pub const MAX_NESTING: usize = 32;

/// One leaf field of a structured variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Name of the variable (or other root) the path starts from.
    pub base_name: String,
    /// Dotted path from the root to this leaf, e.g. `g.inner.a`.
    pub path: String,
    /// Byte offset from the root's address.
    pub offset: u64,
    /// Size of the leaf in bytes; 0 when the debug info doesn't say (flexible
    /// array members, for instance).
    pub size: u64,
    /// Declared type of the leaf, aliases and all.
    pub type_id: TypeId,
}

/// Follows typedefs and qualifiers from `id` until reaching a type that is
/// not an alias.
pub fn unwrap_aliases(db: &TypeDb, id: TypeId) -> Result<(TypeId, &Type)> {
    let mut chain = vec![];
    let mut id = id;
    for _ in 0..MAX_ALIAS_CHAIN {
        let t = db.resolve(id)?;
        match t {
            Type::Alias(a) => {
                if chain.contains(&id) {
                    return Err(Error::CyclicType(id));
                }
                chain.push(id);
                id = a.target.ok_or(Error::UnresolvedType(id))?;
            }
            Type::Struct(_) | Type::Scalar(_) => return Ok((id, t)),
        }
    }
    Err(Error::NestingTooDeep {
        path: format!("{:x?}", id),
        limit: MAX_ALIAS_CHAIN,
    })
}

/// Returns the structure `id` denotes, if it denotes one, looking through any
/// number of aliases.
pub fn as_struct(
    db: &TypeDb,
    id: TypeId,
) -> Result<Option<(TypeId, &Struct)>> {
    match unwrap_aliases(db, id)? {
        (sid, Type::Struct(s)) => Ok(Some((sid, s))),
        (_, Type::Scalar(_)) | (_, Type::Alias(_)) => Ok(None),
    }
}

/// Flattens the type `root_type` into its leaf fields, with paths starting at
/// `root_path`.
///
/// Fields whose type can't be resolved are skipped. If `root_type` is not a
/// structure at all, the result is a single descriptor for the root itself.
pub fn flatten(
    db: &TypeDb,
    root_type: TypeId,
    root_path: &str,
) -> Result<Vec<FieldDescriptor>> {
    let mut f = Flattener {
        db,
        base_name: root_path,
        stack: vec![],
        out: vec![],
    };
    match as_struct(db, root_type)? {
        Some((sid, s)) => f.walk(sid, s, root_path, 0)?,
        None => f.leaf(root_type, root_path.to_string(), 0),
    }
    Ok(f.out)
}

struct Flattener<'a> {
    db: &'a TypeDb,
    base_name: &'a str,
    /// Structures on the current recursion path, outermost first.
    stack: Vec<TypeId>,
    out: Vec<FieldDescriptor>,
}

impl Flattener<'_> {
    fn walk(
        &mut self,
        sid: TypeId,
        s: &Struct,
        path: &str,
        base: u64,
    ) -> Result<()> {
        if self.stack.contains(&sid) {
            return Err(Error::CyclicType(sid));
        }
        if self.stack.len() >= MAX_NESTING {
            return Err(Error::NestingTooDeep {
                path: path.to_string(),
                limit: MAX_NESTING,
            });
        }
        self.stack.push(sid);

        for m in &s.members {
            let Some(tid) = m.type_id else {
                tracing::debug!(path, member = ?m.name, "member has no type");
                continue;
            };
            let offset = base.checked_add(m.location).ok_or_else(|| {
                Error::Format(format!("offset of {}.{:?} overflows", path, m.name))
            })?;
            match as_struct(self.db, tid) {
                Ok(Some((cid, child))) => {
                    // Anonymous nested structs contribute their members
                    // directly, as they do in C.
                    let child_path = match &m.name {
                        Some(n) => format!("{}.{}", path, n),
                        None => path.to_string(),
                    };
                    self.walk(cid, child, &child_path, offset)?;
                }
                Ok(None) => {
                    let leaf_path = match &m.name {
                        Some(n) => format!("{}.{}", path, n),
                        None => format!("{}.<anonymous>", path),
                    };
                    self.leaf(tid, leaf_path, offset);
                }
                Err(Error::UnresolvedType(missing)) => {
                    tracing::debug!(path, member = ?m.name, ?missing, "skipping member of unresolved type");
                }
                Err(e) => return Err(e),
            }
        }

        self.stack.pop();
        Ok(())
    }

    fn leaf(&mut self, type_id: TypeId, path: String, offset: u64) {
        let size = self
            .db
            .type_by_id(type_id)
            .and_then(|t| t.byte_size(self.db))
            .unwrap_or(0);
        self.out.push(FieldDescriptor {
            base_name: self.base_name.to_string(),
            path,
            offset,
            size,
            type_id,
        });
    }
}

/// Collects every named typedef whose immediate target is a structure.
///
/// Only one layer is looked through: a typedef of a typedef of a struct is
/// not included (though the inner typedef is). When the same name is defined
/// in several compilation units, the first one wins.
pub fn structure_typedefs(db: &TypeDb) -> IndexMap<String, TypeId> {
    let mut m = IndexMap::new();
    for (id, t) in db.types() {
        let Type::Alias(a) = t else { continue };
        if a.kind != AliasKind::Typedef {
            continue;
        }
        let (Some(name), Some(target)) = (&a.name, a.target) else {
            continue;
        };
        if matches!(db.type_by_id(target), Some(Type::Struct(_))) {
            m.entry(name.clone()).or_insert(id);
        }
    }
    m
}

/// Flattens every named variable whose type is a structure, keyed by field
/// path.
///
/// Variables with unresolvable types are skipped. Static variables in
/// different compilation units can share a name, and so paths; the first one
/// seen wins.
pub fn struct_fields(db: &TypeDb) -> Result<IndexMap<String, FieldDescriptor>> {
    let mut fields = IndexMap::new();
    for (_, v) in db.variables() {
        let Some(tid) = v.type_id else { continue };
        match as_struct(db, tid) {
            Ok(Some(_)) => (),
            Ok(None) => continue,
            Err(Error::UnresolvedType(missing)) => {
                tracing::debug!(variable = %v.name, ?missing, "skipping variable of unresolved type");
                continue;
            }
            Err(e) => return Err(e),
        }
        for fd in flatten(db, tid, &v.name)? {
            if fields.contains_key(&fd.path) {
                tracing::debug!(path = %fd.path, "duplicate field path ignored");
                continue;
            }
            fields.insert(fd.path.clone(), fd);
        }
    }
    Ok(fields)
}

/// Summary of one direct member of a structure, for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub type_name: String,
    pub offset: u64,
    pub size: u64,
}

/// Lists the direct members of the structure behind typedef `id` (see
/// `structure_typedefs`). Members without a type are left out.
pub fn typedef_members(db: &TypeDb, id: TypeId) -> Result<Vec<MemberInfo>> {
    let target = match db.resolve(id)? {
        Type::Alias(a) => a.target.ok_or(Error::UnresolvedType(id))?,
        Type::Struct(_) => id,
        Type::Scalar(_) => return Ok(vec![]),
    };
    let Type::Struct(s) = db.resolve(target)? else {
        return Ok(vec![]);
    };
    Ok(s.members
        .iter()
        .filter_map(|m| {
            let t = db.type_by_id(m.type_id?)?;
            Some(MemberInfo {
                name: m.name.clone().unwrap_or_default(),
                type_name: t.name(db).into_owned(),
                offset: m.location,
                size: t.byte_size(db).unwrap_or(0),
            })
        })
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Alias, Encoding, Member, Scalar, ScalarKind, StaticVariable,
        TypeDbBuilder,
    };

    #[derive(Debug, Default)]
    struct OffsetMaker {
        next_offset: usize,
    }

    impl OffsetMaker {
        fn next(&mut self) -> gimli::UnitSectionOffset {
            self.next_offset += 1;
            gimli::DebugInfoOffset(self.next_offset).into()
        }
    }

    fn base(
        builder: &mut TypeDbBuilder,
        om: &mut OffsetMaker,
        name: &str,
        encoding: Encoding,
        byte_size: u64,
    ) -> TypeId {
        let offset = om.next();
        builder.record_type(Scalar {
            name: Some(name.to_string()),
            kind: ScalarKind::Base(encoding),
            byte_size: Some(byte_size),
            offset,
        });
        TypeId(offset)
    }

    fn structure(
        builder: &mut TypeDbBuilder,
        om: &mut OffsetMaker,
        name: Option<&str>,
        byte_size: u64,
        members: &[(Option<&str>, Option<TypeId>, u64)],
    ) -> TypeId {
        let offset = om.next();
        let members = members
            .iter()
            .map(|&(name, type_id, location)| Member {
                name: name.map(str::to_string),
                type_id,
                location,
                offset: om.next(),
            })
            .collect();
        builder.record_type(Struct {
            name: name.map(str::to_string),
            byte_size,
            members,
            offset,
        });
        TypeId(offset)
    }

    fn typedef(
        builder: &mut TypeDbBuilder,
        om: &mut OffsetMaker,
        name: &str,
        target: TypeId,
    ) -> TypeId {
        let offset = om.next();
        builder.record_type(Alias {
            name: Some(name.to_string()),
            kind: AliasKind::Typedef,
            target: Some(target),
            offset,
        });
        TypeId(offset)
    }

    fn paths(fields: &[FieldDescriptor]) -> Vec<(&str, u64, u64)> {
        fields
            .iter()
            .map(|f| (f.path.as_str(), f.offset, f.size))
            .collect()
    }

    #[test]
    fn nested_struct_yields_only_leaves() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int32", Encoding::Signed, 4);
        let inner = structure(&mut builder, &mut om, Some("Inner"), 8, &[
            (Some("a"), Some(int), 0),
            (Some("b"), Some(int), 4),
        ]);
        let outer = structure(&mut builder, &mut om, Some("Outer"), 12, &[
            (Some("inner"), Some(inner), 0),
            (Some("x"), Some(int), 8),
        ]);
        let db = builder.build();

        let fields = flatten(&db, outer, "g").unwrap();
        assert_eq!(
            paths(&fields),
            [("g.inner.a", 0, 4), ("g.inner.b", 4, 4), ("g.x", 8, 4)]
        );
        assert!(fields.iter().all(|f| f.base_name == "g"));
        assert!(fields.iter().all(|f| f.type_id == int));
    }

    #[test]
    fn alias_chain_flattens_like_its_struct() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int", Encoding::Signed, 4);
        let dbl = base(&mut builder, &mut om, "double", Encoding::Float, 8);
        let s = structure(&mut builder, &mut om, Some("pair"), 16, &[
            (Some("n"), Some(int), 0),
            (Some("d"), Some(dbl), 8),
        ]);
        let t1 = typedef(&mut builder, &mut om, "pair_t", s);
        let t2 = typedef(&mut builder, &mut om, "pair_tt", t1);
        let qualified = om.next();
        builder.record_type(Alias {
            name: None,
            kind: AliasKind::Const,
            target: Some(t2),
            offset: qualified,
        });
        let db = builder.build();

        let direct = flatten(&db, s, "v").unwrap();
        assert_eq!(flatten(&db, t1, "v").unwrap(), direct);
        assert_eq!(flatten(&db, t2, "v").unwrap(), direct);
        assert_eq!(flatten(&db, TypeId(qualified), "v").unwrap(), direct);
    }

    #[test]
    fn typedef_member_is_descended() {
        // Mirrors a C program with `typedef struct InnerStruct {...}
        // InnerStruct_t;` used as a member of another struct.
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int", Encoding::Signed, 4);
        let chr = base(&mut builder, &mut om, "char", Encoding::SignedChar, 1);
        let dbl = base(&mut builder, &mut om, "double", Encoding::Float, 8);
        let inner = structure(&mut builder, &mut om, Some("InnerStruct"), 16, &[
            (Some("inner_int"), Some(int), 0),
            (Some("inner_double"), Some(dbl), 8),
        ]);
        let inner_t = typedef(&mut builder, &mut om, "InnerStruct_t", inner);
        let outer = structure(&mut builder, &mut om, Some("OuterStruct"), 24, &[
            (Some("outer_int"), Some(int), 0),
            (Some("outer_char"), Some(chr), 4),
            (Some("inner"), Some(inner_t), 8),
        ]);
        builder.record_variable(StaticVariable {
            name: "global_struct".to_string(),
            type_id: Some(outer),
            location: Some(0x4010),
            offset: om.next(),
        });
        builder.record_variable(StaticVariable {
            name: "plain".to_string(),
            type_id: Some(int),
            location: Some(0x4028),
            offset: om.next(),
        });
        let db = builder.build();

        let fields = struct_fields(&db).unwrap();
        let got: Vec<_> = fields.values().map(|f| (f.path.as_str(), f.offset, f.size)).collect();
        assert_eq!(got, [
            ("global_struct.outer_int", 0, 4),
            ("global_struct.outer_char", 4, 1),
            ("global_struct.inner.inner_int", 8, 4),
            ("global_struct.inner.inner_double", 16, 8),
        ]);

        let typedefs = structure_typedefs(&db);
        assert_eq!(typedefs.get("InnerStruct_t"), Some(&inner_t));
        let members = typedef_members(&db, inner_t).unwrap();
        assert_eq!(members, [
            MemberInfo {
                name: "inner_int".to_string(),
                type_name: "int".to_string(),
                offset: 0,
                size: 4,
            },
            MemberInfo {
                name: "inner_double".to_string(),
                type_name: "double".to_string(),
                offset: 8,
                size: 8,
            },
        ]);
    }

    #[test]
    fn unresolved_members_are_skipped() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int", Encoding::Signed, 4);
        let dangling = TypeId(gimli::DebugInfoOffset(0xdead).into());
        let s = structure(&mut builder, &mut om, Some("partial"), 16, &[
            (Some("a"), Some(int), 0),
            (Some("gone"), None, 4),
            (Some("lost"), Some(dangling), 8),
            (Some("z"), Some(int), 12),
        ]);
        let db = builder.build();

        let fields = flatten(&db, s, "p").unwrap();
        assert_eq!(paths(&fields), [("p.a", 0, 4), ("p.z", 12, 4)]);
    }

    #[test]
    fn self_containing_struct_is_an_error() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int", Encoding::Signed, 4);
        // Struct whose second member is (through a typedef) itself. Real C
        // can't express this, but broken debug info can.
        let s_off = om.next();
        let td_off = om.next();
        builder.record_type(Struct {
            name: Some("loop".to_string()),
            byte_size: 8,
            members: vec![
                Member {
                    name: Some("n".to_string()),
                    type_id: Some(int),
                    location: 0,
                    offset: om.next(),
                },
                Member {
                    name: Some("again".to_string()),
                    type_id: Some(TypeId(td_off)),
                    location: 4,
                    offset: om.next(),
                },
            ],
            offset: s_off,
        });
        builder.record_type(Alias {
            name: Some("loop_t".to_string()),
            kind: AliasKind::Typedef,
            target: Some(TypeId(s_off)),
            offset: td_off,
        });
        let db = builder.build();

        match flatten(&db, TypeId(s_off), "l") {
            Err(Error::CyclicType(id)) => assert_eq!(id, TypeId(s_off)),
            other => panic!("expected CyclicType, got {:?}", other),
        }
    }

    #[test]
    fn alias_loop_is_an_error() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let a = om.next();
        let b = om.next();
        builder.record_type(Alias {
            name: Some("a_t".to_string()),
            kind: AliasKind::Typedef,
            target: Some(TypeId(b)),
            offset: a,
        });
        builder.record_type(Alias {
            name: Some("b_t".to_string()),
            kind: AliasKind::Typedef,
            target: Some(TypeId(a)),
            offset: b,
        });
        let db = builder.build();

        assert!(matches!(
            flatten(&db, TypeId(a), "x"),
            Err(Error::CyclicType(_))
        ));
    }

    #[test]
    fn leaves_tile_the_struct() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let u8_ = base(&mut builder, &mut om, "uint8_t", Encoding::Unsigned, 1);
        let u16_ = base(&mut builder, &mut om, "uint16_t", Encoding::Unsigned, 2);
        let u64_ = base(&mut builder, &mut om, "uint64_t", Encoding::Unsigned, 8);
        let ary = om.next();
        builder.record_type(Scalar {
            name: None,
            kind: ScalarKind::Array {
                element_type_id: u16_,
                count: Some(3),
            },
            byte_size: None,
            offset: ary,
        });
        let hdr = structure(&mut builder, &mut om, Some("hdr"), 8, &[
            (Some("tag"), Some(u8_), 0),
            (Some("words"), Some(TypeId(ary)), 2),
        ]);
        let rec = structure(&mut builder, &mut om, Some("rec"), 32, &[
            (Some("h"), Some(hdr), 0),
            (Some("stamp"), Some(u64_), 8),
            (Some("h2"), Some(hdr), 16),
            (Some("tail"), Some(u8_), 24),
        ]);
        let db = builder.build();

        let fields = flatten(&db, rec, "r").unwrap();
        assert_eq!(fields.len(), 6);
        let mut ranges: Vec<_> =
            fields.iter().map(|f| (f.offset, f.offset + f.size)).collect();
        ranges.sort();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0, "overlap between {:?}", w);
        }
        assert!(ranges.iter().all(|&(_, end)| end <= 32));
        assert_eq!(
            fields.iter().find(|f| f.path == "r.h2.words").map(|f| (f.offset, f.size)),
            Some((18, 6))
        );
    }

    #[test]
    fn anonymous_members() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int", Encoding::Signed, 4);
        let anon = structure(&mut builder, &mut om, None, 8, &[
            (Some("lo"), Some(int), 0),
            (Some("hi"), Some(int), 4),
        ]);
        let s = structure(&mut builder, &mut om, Some("wrap"), 12, &[
            (Some("tag"), Some(int), 0),
            (None, Some(anon), 4),
        ]);
        let db = builder.build();

        let fields = flatten(&db, s, "w").unwrap();
        assert_eq!(
            paths(&fields),
            [("w.tag", 0, 4), ("w.lo", 4, 4), ("w.hi", 8, 4)]
        );
    }

    #[test]
    fn typedefs_only_look_through_one_layer() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int", Encoding::Signed, 4);
        let s = structure(&mut builder, &mut om, Some("s"), 4, &[
            (Some("n"), Some(int), 0),
        ]);
        let s_t = typedef(&mut builder, &mut om, "s_t", s);
        typedef(&mut builder, &mut om, "s_tt", s_t);
        typedef(&mut builder, &mut om, "myint", int);
        let db = builder.build();

        let typedefs = structure_typedefs(&db);
        assert_eq!(typedefs.keys().collect::<Vec<_>>(), ["s_t"]);
    }

    #[test]
    fn scalar_root_is_its_own_leaf() {
        let mut om = OffsetMaker::default();
        let mut builder =
            TypeDbBuilder::new(gimli::RunTimeEndian::Little, true);
        let int = base(&mut builder, &mut om, "int32_t", Encoding::Signed, 4);
        let db = builder.build();

        let fields = flatten(&db, int, "counter").unwrap();
        assert_eq!(paths(&fields), [("counter", 0, 4)]);
    }
}
