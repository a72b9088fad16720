//! Link-time RPN evaluation and patch application.
//!
//! Every patch's RPN folds to a single constant now that symbols have
//! addresses and sections have banks; the result is range-checked against
//! the patch width and written little-endian into the owning section's
//! data. PC-relative patches become `target - (patch address + 1)`.

use crate::common::PatchKind;
use crate::diag::Reporter;
use crate::link::{LinkSection, LoadedObject, SymVal};
use crate::rpn::{self, RpnOp};

pub(crate) fn resolve_patches(
    sections: &mut [LinkSection],
    loaded: &[LoadedObject],
    diag: &mut Reporter,
) {
    for section_index in 0..sections.len() {
        let patches = std::mem::take(&mut sections[section_index].patches);
        for patch in &patches {
            let location = loaded[patch.object]
                .object
                .location(patch.node, patch.line);
            let Some(value) = eval_rpn(
                &patch.rpn,
                sections,
                loaded,
                patch.object,
                patch.pc_section,
                patch.pc_offset,
                &location,
                diag,
            ) else {
                continue;
            };
            let value = match patch.kind {
                PatchKind::Jr => {
                    let pc = pc_address(sections, patch.pc_section, patch.pc_offset);
                    let Some(pc) = pc else {
                        diag.error(&location, "jr has no PC to be relative to");
                        continue;
                    };
                    let delta = value.wrapping_sub(pc.wrapping_add(1));
                    if !(-128..=127).contains(&delta) {
                        diag.error(
                            &location,
                            format!("jr target is {} bytes away; the range is -128 to 127", delta),
                        );
                        continue;
                    }
                    delta
                }
                PatchKind::Byte => {
                    if !(-128..=255).contains(&value) {
                        diag.error(
                            &location,
                            format!("value ${:X} does not fit in 8 bits", value),
                        );
                        continue;
                    }
                    value
                }
                PatchKind::Word => {
                    if !(-32768..=65535).contains(&value) {
                        diag.error(
                            &location,
                            format!("value ${:X} does not fit in 16 bits", value),
                        );
                        continue;
                    }
                    value
                }
                PatchKind::Long => value,
            };
            let width = patch.kind.width();
            let offset = patch.offset as usize;
            let bytes = value.to_le_bytes();
            sections[section_index].data[offset..offset + width]
                .copy_from_slice(&bytes[..width]);
        }
        sections[section_index].patches = patches;
    }
}

fn pc_address(sections: &[LinkSection], pc_section: i32, pc_offset: u32) -> Option<i32> {
    if pc_section < 0 {
        return None;
    }
    sections.get(pc_section as usize)?.address(pc_offset)
}

fn pc_bank(sections: &[LinkSection], pc_section: i32) -> Option<u32> {
    if pc_section < 0 {
        return None;
    }
    sections
        .get(pc_section as usize)?
        .placed
        .map(|placement| placement.bank)
}

/// Evaluate a serialized RPN stream to a constant. Reports and returns
/// `None` when a symbol, section or arithmetic step fails.
#[allow(clippy::too_many_arguments)]
pub(crate) fn eval_rpn(
    bytes: &[u8],
    sections: &[LinkSection],
    loaded: &[LoadedObject],
    object: usize,
    pc_section: i32,
    pc_offset: u32,
    location: &str,
    diag: &mut Reporter,
) -> Option<i32> {
    let ops = match rpn::parse(bytes) {
        Ok(ops) => ops,
        Err(error) => {
            diag.error(location, error);
            return None;
        }
    };
    let mut stack: Vec<i32> = Vec::new();
    let mut fail = |diag: &mut Reporter, message: String| {
        diag.error(location, message);
    };
    for op in ops {
        match op {
            RpnOp::Const(value) => stack.push(value),
            RpnOp::Sym(index) => {
                let value = symbol_value(sections, loaded, object, index)?;
                match value {
                    Ok(value) => stack.push(value),
                    Err(name) => {
                        fail(diag, format!("`{}` has no value at link time", name));
                        return None;
                    }
                }
            }
            RpnOp::BankSym(index) => {
                let symbol = loaded[object].symbols.get(index as usize)?;
                match symbol {
                    SymVal::Label { section, .. } => {
                        match sections[*section].placed {
                            Some(placement) => stack.push(placement.bank as i32),
                            None => return None,
                        }
                    }
                    _ => {
                        let name = symbol_name(loaded, object, index);
                        fail(diag, format!("`{}` has no bank", name));
                        return None;
                    }
                }
            }
            RpnOp::BankSect(name) => match find_section(sections, &name) {
                Some(section) => match section.placed {
                    Some(placement) => stack.push(placement.bank as i32),
                    None => return None,
                },
                None => {
                    fail(diag, format!("no section named `{}`", name));
                    return None;
                }
            },
            RpnOp::BankSelf => match pc_bank(sections, pc_section) {
                Some(bank) => stack.push(bank as i32),
                None => {
                    fail(diag, String::from("PC has no bank here"));
                    return None;
                }
            },
            RpnOp::SizeofSect(name) => match find_section(sections, &name) {
                Some(section) => stack.push(section.size as i32),
                None => {
                    fail(diag, format!("no section named `{}`", name));
                    return None;
                }
            },
            RpnOp::StartofSect(name) => match find_section(sections, &name) {
                Some(section) => match section.placed {
                    Some(placement) => stack.push(i32::from(placement.org)),
                    None => return None,
                },
                None => {
                    fail(diag, format!("no section named `{}`", name));
                    return None;
                }
            },
            RpnOp::HramCheck => {
                let value = stack.pop()?;
                let full = value | 0xFF00;
                if !(0xFF00..=0xFFFE).contains(&full) || (value & !0xFFFF) != 0 {
                    fail(diag, format!("${:04X} is not an HRAM address", value));
                    return None;
                }
                stack.push(full & 0xFF);
            }
            RpnOp::RstCheck => {
                let value = stack.pop()?;
                if value & !0x38 != 0 {
                    fail(diag, format!("${:02X} is not a RST vector", value));
                    return None;
                }
                stack.push(value | 0xC7);
            }
            RpnOp::Binary(op) => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                match op.eval(lhs, rhs) {
                    Ok(value) => stack.push(value),
                    Err(error) => {
                        fail(diag, error.to_string());
                        return None;
                    }
                }
            }
            RpnOp::Unary(op) => {
                let value = stack.pop()?;
                stack.push(op.eval(value));
            }
        }
    }
    if stack.len() != 1 {
        diag.error(location, "malformed RPN expression");
        return None;
    }
    stack.pop()
}

/// A symbol's link-time value; `Err` carries the name when it has none.
fn symbol_value(
    sections: &[LinkSection],
    loaded: &[LoadedObject],
    object: usize,
    index: u32,
) -> Option<Result<i32, String>> {
    let symbol = loaded[object].symbols.get(index as usize)?;
    match symbol {
        SymVal::Value(value) => Some(Ok(*value)),
        SymVal::Label { section, offset } => sections
            .get(*section)
            .and_then(|s| s.address(*offset))
            .map(Ok),
        SymVal::Unresolved => Some(Err(symbol_name(loaded, object, index))),
    }
}

fn symbol_name(loaded: &[LoadedObject], object: usize, index: u32) -> String {
    loaded[object]
        .object
        .symbols
        .get(index as usize)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("symbol #{}", index))
}

fn find_section<'a>(sections: &'a [LinkSection], name: &str) -> Option<&'a LinkSection> {
    sections.iter().find(|section| section.name == name)
}
