//! Data model types.
//!
//! This is our abstract description of the types and static variables in a
//! program, as far as layout resolution needs them.

use std::borrow::Cow;
use crate::TypeDb;

/// Alias chains longer than this are treated as broken rather than followed.
pub(crate) const MAX_ALIAS_CHAIN: usize = 64;

/// Identifies a specific type within a program, using its offset within the
/// debug section(s).
///
/// Sometimes types appear more than once in debug info. In that case, each type
/// will have a distinct `TypeId`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TypeId(pub gimli::UnitSectionOffset);

impl From<gimli::UnitSectionOffset> for TypeId {
    fn from(x: gimli::UnitSectionOffset) -> Self {
        Self(x)
    }
}

/// Identifies a static variable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VarId(pub gimli::UnitSectionOffset);

impl From<gimli::UnitSectionOffset> for VarId {
    fn from(x: gimli::UnitSectionOffset) -> Self {
        Self(x)
    }
}

/// Information about a type from a program.
///
/// Layout resolution only cares whether something is a structure (and so can
/// be descended into), an alias for something else, or a leaf. Everything
/// that is neither a structure nor an alias is a `Scalar`, including arrays
/// and unions, which are sized but not descended into.
#[derive(Debug, Clone)]
pub enum Type {
    Scalar(Scalar),
    Struct(Struct),
    Alias(Alias),
}

impl Type {
    /// Returns the location of the type's definition within the debug info
    /// section(s).
    pub fn offset(&self) -> gimli::UnitSectionOffset {
        match self {
            Self::Scalar(s) => s.offset,
            Self::Struct(s) => s.offset,
            Self::Alias(s) => s.offset,
        }
    }

    /// Determines the size of the type, in bytes.
    ///
    /// Aliases report the size of whatever they eventually point to. Arrays
    /// without an explicit size are sized from their element type and count;
    /// pointers without one get the program's pointer size. Not all types
    /// have sizes.
    pub fn byte_size(&self, world: &TypeDb) -> Option<u64> {
        let mut factor = 1u64;
        let mut t = self;
        for _ in 0..MAX_ALIAS_CHAIN {
            match t {
                Self::Struct(s) => return factor.checked_mul(s.byte_size),
                Self::Scalar(s) => match (&s.kind, s.byte_size) {
                    (_, Some(n)) => return factor.checked_mul(n),
                    (ScalarKind::Pointer { .. }, None) => {
                        return factor.checked_mul(world.pointer_size());
                    }
                    (ScalarKind::Array { element_type_id, count }, None) => {
                        factor = factor.checked_mul((*count)?)?;
                        t = world.type_by_id(*element_type_id)?;
                    }
                    _ => return None,
                },
                Self::Alias(a) => {
                    t = world.type_by_id(a.target?)?;
                }
            }
        }
        None
    }

    /// Determines the name of the type.
    ///
    /// Unnamed types (pointers, arrays, qualifiers, anonymous structs) get a
    /// name synthesized from their parts.
    pub fn name(&self, world: &TypeDb) -> Cow<'_, str> {
        let named = |t: Option<TypeId>| -> String {
            t.and_then(|t| world.type_by_id(t))
                .map(|t| t.name(world).into_owned())
                .unwrap_or_else(|| "void".to_string())
        };
        match self {
            Self::Struct(s) => match &s.name {
                Some(n) => n.into(),
                None => "<anonymous struct>".into(),
            },
            Self::Alias(a) => match (&a.name, a.kind) {
                (Some(n), _) => n.into(),
                (None, AliasKind::Const) => {
                    format!("const {}", named(a.target)).into()
                }
                (None, AliasKind::Volatile) => {
                    format!("volatile {}", named(a.target)).into()
                }
                (None, AliasKind::Restrict) => {
                    format!("restrict {}", named(a.target)).into()
                }
                (None, AliasKind::Atomic) => {
                    format!("_Atomic {}", named(a.target)).into()
                }
                (None, AliasKind::Typedef) => "<anonymous typedef>".into(),
            },
            Self::Scalar(s) => {
                if let Some(n) = &s.name {
                    return n.into();
                }
                match &s.kind {
                    ScalarKind::Pointer { type_id } => {
                        format!("{} *", named(*type_id)).into()
                    }
                    ScalarKind::Array { element_type_id, count } => {
                        let eltname = named(Some(*element_type_id));
                        if let Some(n) = count {
                            format!("{}[{}]", eltname, n).into()
                        } else {
                            format!("{}[]", eltname).into()
                        }
                    }
                    ScalarKind::Enum => "<anonymous enum>".into(),
                    ScalarKind::Union => "<anonymous union>".into(),
                    ScalarKind::Base(_) => "<anonymous base type>".into(),
                }
            }
        }
    }
}

impl From<Scalar> for Type {
    fn from(x: Scalar) -> Self {
        Self::Scalar(x)
    }
}

impl From<Struct> for Type {
    fn from(x: Struct) -> Self {
        Self::Struct(x)
    }
}

impl From<Alias> for Type {
    fn from(x: Alias) -> Self {
        Self::Alias(x)
    }
}

/// A type that layout resolution does not descend into.
#[derive(Clone, Debug)]
pub struct Scalar {
    /// Name of the type, if it has one.
    pub name: Option<String>,
    /// What sort of leaf this is.
    pub kind: ScalarKind,
    /// Number of bytes in a value of the type, when the debug info says so
    /// directly. See `Type::byte_size` for the derived size.
    pub byte_size: Option<u64>,
    /// Location in debug info.
    pub offset: gimli::UnitSectionOffset,
}

#[derive(Clone, Debug)]
pub enum ScalarKind {
    /// A "base type," also known as a "primitive type," like `int` or
    /// `double`.
    Base(Encoding),
    /// Pointer to some other type; `None` for `void *`.
    Pointer { type_id: Option<TypeId> },
    /// Array of `count` elements. Flexible array members have no count.
    Array {
        element_type_id: TypeId,
        count: Option<u64>,
    },
    /// C-style enumeration.
    Enum,
    /// C-style non-tagged union. Its members overlap, so we don't flatten it.
    Union,
}

/// A "struct type" describes a record containing members, each of which has its
/// own type.
#[derive(Debug, Clone)]
pub struct Struct {
    /// Name of the struct type. C allows anonymous structs, typically wrapped
    /// in a typedef.
    pub name: Option<String>,
    /// Size of a value of this struct in bytes.
    pub byte_size: u64,
    /// Member fields of the struct, in the order they appear in the debug
    /// info. This is the declaration order, not necessarily the order in
    /// memory.
    pub members: Vec<Member>,
    /// Location in debug info.
    pub offset: gimli::UnitSectionOffset,
}

/// A type that stands for another type.
#[derive(Debug, Clone)]
pub struct Alias {
    /// Name of the alias. Typedefs have names; qualifiers don't.
    pub name: Option<String>,
    pub kind: AliasKind,
    /// The aliased type. `None` means `void` (e.g. `const void`) or that the
    /// debug info left the reference out.
    pub target: Option<TypeId>,
    /// Location in debug info.
    pub offset: gimli::UnitSectionOffset,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AliasKind {
    Typedef,
    Const,
    Volatile,
    Restrict,
    Atomic,
}

/// Possible encodings for a base type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Encoding {
    /// Unsigned integer.
    Unsigned,
    /// Signed integer.
    Signed,
    /// Unsigned char. This is used for C `unsigned char` (`byte_size == 1`)
    /// and sometimes for C `char` depending on the platform ABI because
    /// reasons.
    UnsignedChar,
    /// Signed char. This is used for C `signed char` and sometimes for C
    /// `char`.
    SignedChar,
    /// Boolean -- 0 is false, non-zero is true.
    Boolean,
    /// IEEE754 floating point number.
    Float,
    /// Anything else (complex floats, decimal floats, UTF characters...). We
    /// can size these but not interpret them.
    Other,
}

/// A component of a struct or union.
#[derive(Debug, Clone)]
pub struct Member {
    /// Name of the member. Anonymous nested structs and unions have no name.
    pub name: Option<String>,
    /// Type of data stored in this member. Missing when the debug info is
    /// partial, e.g. for members that were optimized out.
    pub type_id: Option<TypeId>,
    /// Offset of this member within the enclosing type, in bytes.
    pub location: u64,
    /// Location in debug info.
    pub offset: gimli::UnitSectionOffset,
}

/// A variable declared at file (or namespace) scope.
#[derive(Clone, Debug)]
pub struct StaticVariable {
    /// Name of variable.
    pub name: String,
    /// Type contained in variable, if the debug info records one.
    pub type_id: Option<TypeId>,
    /// Static address in the binary, when the variable is defined here (as
    /// opposed to merely declared) and has a simple location.
    pub location: Option<u64>,
    /// Location in debug info.
    pub offset: gimli::UnitSectionOffset,
}
