//! Recursive descent parser for DWARF info (i.e. the part missing from Gimli).
//!
//! This consumes DWARF debug info sections by recursive descent, building up
//! our data model. Only the entries that matter for variable layout are
//! recorded; everything else is skipped without complaint. Malformed or
//! unexpected attribute forms are logged and the attribute ignored, so a single
//! odd entry never sinks the whole parse.

use crate::{
    Alias, AliasKind, Encoding, Member, Result, Scalar, ScalarKind, Struct,
    TypeDbBuilder, TypeId, VariableEntry,
};
use std::borrow::Cow;

use gimli::constants as gim_con;

// Internal type abbreviations
type RtSlice<'a> = gimli::EndianSlice<'a, gimli::RunTimeEndian>;

pub(crate) fn parse_entry(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;

    if entry.has_children() {
        while let Some(()) = cursor.next_entry()? {
            if cursor.current().is_some() {
                handle_nested_types(dwarf, unit, cursor, builder)?;
            } else {
                break;
            }
        }
    }

    Ok(())
}

/// Factored out of parsers for DWARF entities that can contain types. This
/// dispatches between the type, variable, or namespace parsing routines based
/// on tag.
fn handle_nested_types(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    if let Some(child) = cursor.current() {
        match child.tag() {
            gim_con::DW_TAG_base_type => {
                parse_base_type(dwarf, unit, cursor, builder)?;
            }
            gim_con::DW_TAG_structure_type | gim_con::DW_TAG_class_type => {
                parse_structure_type(dwarf, unit, cursor, builder)?;
            }
            gim_con::DW_TAG_union_type => {
                parse_opaque_type(dwarf, unit, cursor, builder, ScalarKind::Union)?;
            }
            gim_con::DW_TAG_enumeration_type => {
                parse_opaque_type(dwarf, unit, cursor, builder, ScalarKind::Enum)?;
            }
            gim_con::DW_TAG_array_type => {
                parse_array_type(dwarf, unit, cursor, builder)?;
            }
            gim_con::DW_TAG_pointer_type
            | gim_con::DW_TAG_reference_type
            | gim_con::DW_TAG_rvalue_reference_type => {
                parse_pointer_type(dwarf, unit, cursor, builder)?;
            }
            gim_con::DW_TAG_typedef => {
                parse_alias(dwarf, unit, cursor, builder, AliasKind::Typedef)?;
            }
            gim_con::DW_TAG_const_type => {
                parse_alias(dwarf, unit, cursor, builder, AliasKind::Const)?;
            }
            gim_con::DW_TAG_volatile_type => {
                parse_alias(dwarf, unit, cursor, builder, AliasKind::Volatile)?;
            }
            gim_con::DW_TAG_restrict_type => {
                parse_alias(dwarf, unit, cursor, builder, AliasKind::Restrict)?;
            }
            gim_con::DW_TAG_atomic_type => {
                parse_alias(dwarf, unit, cursor, builder, AliasKind::Atomic)?;
            }
            gim_con::DW_TAG_namespace => {
                parse_namespace(dwarf, unit, cursor, builder)?;
            }
            gim_con::DW_TAG_variable => {
                parse_static_variable(dwarf, unit, cursor, builder)?;
            }
            _ => {
                // Subprogram bodies, lexical blocks, imported declarations,
                // and the like.
                skip_entry(cursor)?;
            }
        }
    }

    Ok(())
}

fn parse_namespace(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;
    let mut name = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        if attr.name() == gim_con::DW_AT_name {
            name = Some(get_attr_string(dwarf, unit, attr.value())?);
        }
    }

    let name = name.unwrap_or_else(|| "{anonymous}".into()).into_owned();

    if entry.has_children() {
        builder.path_component(name, |builder| {
            while let Some(()) = cursor.next_entry()? {
                if cursor.current().is_some() {
                    handle_nested_types(dwarf, unit, cursor, builder)?;
                } else {
                    break;
                }
            }
            Ok(())
        })
    } else {
        Ok(())
    }
}

fn parse_base_type(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut name = None;
    let mut byte_size = None;
    let mut encoding = Encoding::Other;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_byte_size => {
                byte_size = attr.value().udata_value();
            }
            gim_con::DW_AT_encoding => {
                if let gimli::AttributeValue::Encoding(e) = attr.value() {
                    encoding = match e {
                        gim_con::DW_ATE_unsigned => Encoding::Unsigned,
                        gim_con::DW_ATE_signed => Encoding::Signed,
                        gim_con::DW_ATE_boolean => Encoding::Boolean,
                        gim_con::DW_ATE_unsigned_char => Encoding::UnsignedChar,
                        gim_con::DW_ATE_signed_char => Encoding::SignedChar,
                        gim_con::DW_ATE_float => Encoding::Float,
                        _ => Encoding::Other,
                    };
                } else {
                    tracing::debug!(?offset, value = ?attr.value(), "odd encoding form");
                }
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    builder.record_type(Scalar {
        name: name.map(Cow::into_owned),
        kind: ScalarKind::Base(encoding),
        byte_size,
        offset,
    });
    Ok(())
}

fn parse_structure_type(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut name = None;
    let mut byte_size = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_byte_size => {
                byte_size = attr.value().udata_value();
            }
            gim_con::DW_AT_declaration => {
                // Forward declaration; the definition lives elsewhere.
                skip_entry(cursor)?;
                return Ok(());
            }
            _ => (),
        }
    }

    let name = name.map(Cow::into_owned);
    let mut members = vec![];

    if entry.has_children() {
        let mut children = |builder: &mut TypeDbBuilder| -> Result<()> {
            while let Some(()) = cursor.next_entry()? {
                if let Some(child) = cursor.current() {
                    match child.tag() {
                        gim_con::DW_TAG_member => {
                            if let Some(m) = parse_member(dwarf, unit, cursor)? {
                                members.push(m);
                            }
                        }
                        _ => {
                            handle_nested_types(dwarf, unit, cursor, builder)?;
                        }
                    }
                } else {
                    break;
                }
            }
            Ok(())
        };
        match &name {
            Some(n) => builder.path_component(n.clone(), children)?,
            None => children(builder)?,
        }
    }

    let Some(byte_size) = byte_size else {
        tracing::debug!(?offset, ?name, "structure without a size, skipped");
        return Ok(());
    };
    let name = name.map(|n| builder.format_path(n));

    builder.record_type(Struct {
        name,
        byte_size,
        members,
        offset,
    });
    Ok(())
}

/// Parses a struct member. Static data members (C++) have no location within
/// the struct and yield `None`.
fn parse_member(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
) -> Result<Option<Member>> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut name = None;
    let mut type_id = None;
    let mut location = None;
    let mut is_static = false;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                type_id = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_data_member_location => {
                location = member_location(unit, attr.value());
                if location.is_none() {
                    tracing::debug!(?offset, value = ?attr.value(), "unsupported member location");
                }
            }
            gim_con::DW_AT_data_bit_offset => {
                location = attr.value().udata_value().map(|bits| bits / 8);
            }
            gim_con::DW_AT_external | gim_con::DW_AT_declaration => {
                is_static = true;
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    if is_static {
        return Ok(None);
    }

    Ok(Some(Member {
        name: name.map(Cow::into_owned),
        type_id,
        // Union members, and the first member of many structs, omit the
        // location entirely.
        location: location.unwrap_or(0),
        offset,
    }))
}

/// Parses a type that we size but do not look inside: unions and C-style
/// enumerations.
fn parse_opaque_type(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
    kind: ScalarKind,
) -> Result<()> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut name = None;
    let mut byte_size = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_byte_size => {
                byte_size = attr.value().udata_value();
            }
            gim_con::DW_AT_declaration => {
                skip_entry(cursor)?;
                return Ok(());
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    let name = name.map(|n| builder.format_path(n));
    builder.record_type(Scalar {
        name,
        kind,
        byte_size,
        offset,
    });
    Ok(())
}

fn parse_array_type(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut element_type_id = None;
    let mut byte_size = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_type => {
                element_type_id = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_byte_size => {
                byte_size = attr.value().udata_value();
            }
            _ => (),
        }
    }

    // Multidimensional arrays have one subrange per dimension; we flatten
    // them into a single element count.
    let mut count = Some(1u64);
    let mut dimensions = 0;
    if entry.has_children() {
        while let Some(()) = cursor.next_entry()? {
            if let Some(child) = cursor.current() {
                match child.tag() {
                    gim_con::DW_TAG_subrange_type => {
                        let n = parse_subrange_type(dwarf, unit, cursor)?;
                        count = count.zip(n).and_then(|(a, b)| a.checked_mul(b));
                        dimensions += 1;
                    }
                    _ => {
                        skip_entry(cursor)?;
                    }
                }
            } else {
                break;
            }
        }
    }
    if dimensions == 0 {
        count = None;
    }

    let Some(element_type_id) = element_type_id else {
        tracing::debug!(?offset, "array without element type, skipped");
        return Ok(());
    };

    builder.record_type(Scalar {
        name: None,
        kind: ScalarKind::Array {
            element_type_id,
            count,
        },
        byte_size,
        offset,
    });
    Ok(())
}

/// Returns the number of elements described by a subrange, if known.
fn parse_subrange_type(
    _dwarf: &gimli::Dwarf<RtSlice<'_>>,
    _unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
) -> Result<Option<u64>> {
    let entry = current(cursor)?;

    let mut lower_bound = None;
    let mut upper_bound = None;
    let mut count = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_lower_bound => {
                lower_bound = attr.value().udata_value();
            }
            gim_con::DW_AT_upper_bound => {
                upper_bound = attr.value().udata_value();
            }
            gim_con::DW_AT_count => {
                count = attr.value().udata_value();
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    // C and C++ use zero-based arrays and usually give the upper bound
    // rather than the count.
    let lower_bound = lower_bound.unwrap_or(0);
    Ok(count.or_else(|| {
        upper_bound
            .and_then(|u| u.checked_sub(lower_bound))
            .and_then(|n| n.checked_add(1))
    }))
}

fn parse_pointer_type(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut name = None;
    let mut type_id = None;
    let mut byte_size = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                type_id = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_byte_size => {
                byte_size = attr.value().udata_value();
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    builder.record_type(Scalar {
        name: name.map(Cow::into_owned),
        kind: ScalarKind::Pointer { type_id },
        byte_size,
        offset,
    });
    Ok(())
}

/// Parses typedefs and type qualifiers, which all stand for another type.
fn parse_alias(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
    kind: AliasKind,
) -> Result<()> {
    let entry = current(cursor)?;

    let offset = entry.offset().to_unit_section_offset(unit);
    let mut name = None;
    let mut target = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_type => {
                target = type_ref(unit, attr.value());
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    let name = match kind {
        AliasKind::Typedef => name.map(|n| builder.format_path(n)),
        _ => None,
    };
    builder.record_type(Alias {
        name,
        kind,
        target,
        offset,
    });
    Ok(())
}

fn parse_static_variable(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    builder: &mut TypeDbBuilder,
) -> Result<()> {
    let entry = current(cursor)?;

    let mut name = None;
    let mut linkage_name = None;
    let mut type_id = None;
    let mut location = None;
    let mut specification = None;

    let offset = entry.offset().to_unit_section_offset(unit);

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_linkage_name => {
                linkage_name = Some(get_attr_string(dwarf, unit, attr.value())?);
            }
            gim_con::DW_AT_location => {
                match static_address(unit, attr.value()) {
                    Ok(a) => location = a,
                    Err(e) => {
                        tracing::debug!(?offset, error = %e, "unhandled location expression");
                    }
                }
            }
            gim_con::DW_AT_type => {
                type_id = type_ref(unit, attr.value());
            }
            gim_con::DW_AT_specification => {
                specification = die_ref(unit, attr.value());
            }
            _ => (),
        }
    }

    skip_children(cursor)?;

    let name = match (name, linkage_name) {
        // This is a heuristic for detecting C-linkage variables, which are
        // not namespaced.
        (Some(n), None) => Some(n.into_owned()),
        (Some(n), Some(_)) => Some(builder.format_path(n)),
        (None, _) => None,
    };

    builder.record_variable_entry(VariableEntry {
        name,
        type_id,
        location,
        specification,
        offset,
    });
    Ok(())
}

/// Evaluates a variable's location expression, returning its address if it
/// lives at a single fixed address. Thread-locals, register variables and
/// anything composite yield `None`.
fn static_address(
    unit: &gimli::Unit<RtSlice<'_>>,
    value: gimli::AttributeValue<RtSlice<'_>>,
) -> Result<Option<u64>> {
    let Some(e) = value.exprloc_value() else {
        return Ok(None);
    };
    let mut eval = e.evaluation(unit.encoding());
    let mut result = eval.evaluate()?;
    loop {
        match result {
            gimli::EvaluationResult::Complete => {
                let pieces = eval.result();
                return Ok(match pieces.as_slice() {
                    [gimli::Piece {
                        location: gimli::Location::Address { address },
                        ..
                    }] => Some(*address),
                    _ => None,
                });
            }
            gimli::EvaluationResult::RequiresRelocatedAddress(a) => {
                result = eval.resume_with_relocated_address(a)?;
            }
            _ => return Ok(None),
        }
    }
}

/// Decodes `DW_AT_data_member_location`, which is either a constant or (in
/// older DWARF) a tiny expression run against the structure's base address.
fn member_location(
    unit: &gimli::Unit<RtSlice<'_>>,
    value: gimli::AttributeValue<RtSlice<'_>>,
) -> Option<u64> {
    if let Some(n) = value.udata_value() {
        return Some(n);
    }
    let e = value.exprloc_value()?;
    let mut eval = e.evaluation(unit.encoding());
    eval.set_initial_value(0);
    match eval.evaluate().ok()? {
        gimli::EvaluationResult::Complete => {
            match eval.result().as_slice() {
                [gimli::Piece {
                    location: gimli::Location::Address { address },
                    ..
                }] => Some(*address),
                _ => None,
            }
        }
        _ => None,
    }
}

fn type_ref(
    unit: &gimli::Unit<RtSlice<'_>>,
    value: gimli::AttributeValue<RtSlice<'_>>,
) -> Option<TypeId> {
    die_ref(unit, value).map(TypeId)
}

/// Turns a reference to another entry into a section-wide offset.
fn die_ref(
    unit: &gimli::Unit<RtSlice<'_>>,
    value: gimli::AttributeValue<RtSlice<'_>>,
) -> Option<gimli::UnitSectionOffset> {
    match value {
        gimli::AttributeValue::UnitRef(o) => {
            Some(o.to_unit_section_offset(unit))
        }
        gimli::AttributeValue::DebugInfoRef(o) => Some(o.into()),
        v => {
            tracing::debug!(value = ?v, "unexpected reference form");
            None
        }
    }
}

fn get_attr_string<'a>(
    dwarf: &gimli::Dwarf<RtSlice<'a>>,
    unit: &gimli::Unit<RtSlice<'a>>,
    attrval: gimli::AttributeValue<RtSlice<'a>>,
) -> Result<Cow<'a, str>> {
    Ok(dwarf.attr_string(unit, attrval)?.to_string_lossy())
}

fn current<'c, 'abbrev, 'unit, 'a>(
    cursor: &'c gimli::EntriesCursor<'abbrev, 'unit, RtSlice<'a>>,
) -> Result<&'c gimli::DebuggingInformationEntry<'abbrev, 'unit, RtSlice<'a>>>
{
    cursor
        .current()
        .ok_or_else(|| crate::Error::Format("DWARF cursor not on an entry".into()))
}

/// Consumes the children of the current entry, if any, without looking at
/// them.
fn skip_children(
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
) -> Result<()> {
    let has_children = current(cursor)?.has_children();
    if has_children {
        while let Some(()) = cursor.next_entry()? {
            if cursor.current().is_some() {
                skip_entry(cursor)?;
            } else {
                break;
            }
        }
    }
    Ok(())
}

fn skip_entry(
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
) -> Result<()> {
    let entry = current(cursor)?;
    tracing::trace!(tag = %entry.tag(), offset = ?entry.offset(), "skipping entry");
    skip_children(cursor)
}
