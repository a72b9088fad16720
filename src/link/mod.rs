//! The linker: object modules in, placed sections and resolved bytes out.
//!
//! [`link`] merges same-named UNION/FRAGMENT pieces across objects,
//! resolves imports against exports, assigns every floating section a
//! concrete `(bank, org)`, evaluates the patches, and checks deferred
//! assertions. [`output`] turns the result into the ROM image, symbol
//! file and map file.

use std::collections::HashMap;
use std::fmt;

use crate::common::{AssertKind, MemoryLayout, SectionKind, SectionModifier};
use crate::diag::{Fatal, Reporter, Warning, WarningConfig};
use crate::obj;

mod patch;
mod place;
pub mod output;

/// Linker configuration, the library-side view of the CLI flags.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Address-space shape: 32 KiB mode, DMG mode, contiguous WRAM.
    pub layout: MemoryLayout,
    /// Byte filling the gaps of the ROM image.
    pub pad: u8,
    /// Template image whose bytes fill the gaps instead of the pad byte.
    pub overlay: Option<Vec<u8>>,
    /// Warning settings.
    pub warnings: WarningConfig,
}

/// A section after cross-object merging.
#[derive(Debug)]
pub struct LinkSection {
    pub name: String,
    pub kind: SectionKind,
    pub modifier: SectionModifier,
    pub org: Option<u16>,
    pub bank: Option<u32>,
    pub align_log2: u8,
    pub align_ofs: u16,
    pub size: u32,
    pub data: Vec<u8>,
    pub(crate) patches: Vec<LinkPatch>,
    /// Filled in by placement.
    pub placed: Option<Placement>,
}

/// A concrete address assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub bank: u32,
    pub org: u16,
}

impl LinkSection {
    /// The absolute address of `offset` within the section, once placed.
    pub(crate) fn address(&self, offset: u32) -> Option<i32> {
        self.placed
            .map(|p| i32::from(p.org).wrapping_add(offset as i32))
    }
}

/// A patch rebased into its merged section.
#[derive(Debug)]
pub(crate) struct LinkPatch {
    /// Which object the patch came from, for symbol lookup and
    /// diagnostics.
    pub object: usize,
    pub node: u32,
    pub line: u32,
    pub offset: u32,
    /// Merged-section index of the PC, or a negative value for none.
    pub pc_section: i32,
    pub pc_offset: u32,
    pub kind: crate::common::PatchKind,
    pub rpn: Vec<u8>,
}

/// A symbol resolved to link-time terms.
#[derive(Debug, Clone)]
pub(crate) enum SymVal {
    Value(i32),
    Label { section: usize, offset: u32 },
    Unresolved,
}

/// One input object plus its mapping into the merged tables.
#[derive(Debug)]
pub(crate) struct LoadedObject {
    pub object: obj::Object,
    /// Object section index to (merged section, base offset).
    pub section_map: Vec<(usize, u32)>,
    /// Object symbol index to resolved value.
    pub symbols: Vec<SymVal>,
}

/// A label surviving into the symbol and map files.
#[derive(Debug, Clone)]
pub struct OutSymbol {
    pub name: String,
    /// Index into [`LinkOutput::sections`].
    pub section: usize,
    pub offset: u32,
}

/// Everything the output stage needs.
#[derive(Debug)]
pub struct LinkOutput {
    pub sections: Vec<LinkSection>,
    pub symbols: Vec<OutSymbol>,
    pub warnings: usize,
}

/// Why a link produced no output.
#[derive(Debug)]
pub enum LinkError {
    Fatal(Fatal),
    Errors(usize),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Fatal(fatal) => write!(f, "fatal: {}", fatal),
            LinkError::Errors(count) => write!(f, "link failed with {} error(s)", count),
        }
    }
}

impl std::error::Error for LinkError {}

/// Link a set of object modules.
pub fn link(objects: Vec<obj::Object>, opts: &Options) -> Result<LinkOutput, LinkError> {
    let mut diag = Reporter::new(opts.warnings.clone());
    let mut sections: Vec<LinkSection> = Vec::new();
    let mut names: HashMap<String, usize> = HashMap::new();
    let mut loaded: Vec<LoadedObject> = Vec::new();

    for (object_index, object) in objects.into_iter().enumerate() {
        let mut section_map = Vec::with_capacity(object.sections.len());
        for section in &object.sections {
            let mapped = merge_section(
                &mut sections,
                &mut names,
                object_index,
                section,
                &mut diag,
            );
            section_map.push(mapped);
        }
        // Patches rebase onto the merged sections now that this object's
        // own mapping is complete.
        for (section_index, section) in object.sections.iter().enumerate() {
            let (merged, base) = section_map[section_index];
            for patch in &section.patches {
                let (pc_section, pc_offset) = match patch.pc_section {
                    pc if pc >= 0 && (pc as usize) < section_map.len() => {
                        let (mapped, pc_base) = section_map[pc as usize];
                        (mapped as i32, patch.pc_offset + pc_base)
                    }
                    _ => (obj::SECTION_NONE, 0),
                };
                sections[merged].patches.push(LinkPatch {
                    object: object_index,
                    node: patch.node,
                    line: patch.line,
                    offset: patch.offset + base,
                    pc_section,
                    pc_offset,
                    kind: patch.kind,
                    rpn: patch.rpn.clone(),
                });
            }
        }
        loaded.push(LoadedObject {
            object,
            section_map,
            symbols: Vec::new(),
        });
    }

    resolve_symbols(&mut loaded, &mut diag);
    place::place(&mut sections, &opts.layout, &mut diag);
    patch::resolve_patches(&mut sections, &loaded, &mut diag);
    if let Err(fatal) = check_assertions(&sections, &loaded, &mut diag) {
        return Err(LinkError::Fatal(fatal));
    }

    if diag.has_errors() {
        return Err(LinkError::Errors(diag.error_count()));
    }

    let mut symbols = Vec::new();
    for loaded_object in &loaded {
        for (index, symbol) in loaded_object.object.symbols.iter().enumerate() {
            if let SymVal::Label { section, offset } = loaded_object.symbols[index] {
                symbols.push(OutSymbol {
                    name: symbol.name.clone(),
                    section,
                    offset,
                });
            }
        }
    }

    Ok(LinkOutput {
        sections,
        symbols,
        warnings: diag.warning_count(),
    })
}

/// Merge one object section into the global table, returning its merged
/// index and the base offset its contents start at.
fn merge_section(
    sections: &mut Vec<LinkSection>,
    names: &mut HashMap<String, usize>,
    object_index: usize,
    section: &obj::Section,
    diag: &mut Reporter,
) -> (usize, u32) {
    let loc = format!("object #{}, section `{}`", object_index, section.name);
    if let Some(&index) = names.get(&section.name) {
        let merged = &mut sections[index];
        if merged.kind != section.kind {
            diag.error(
                &loc,
                format!("section is {}, already seen as {}", section.kind, merged.kind),
            );
            return (index, 0);
        }
        // Fragments may extend a section first declared without the
        // modifier; unions must agree on both sides.
        let compatible = match (merged.modifier, section.modifier) {
            (SectionModifier::Union, SectionModifier::Union) => true,
            (SectionModifier::Fragment, SectionModifier::Fragment) => true,
            (SectionModifier::Normal, SectionModifier::Fragment) => {
                merged.modifier = SectionModifier::Fragment;
                true
            }
            _ => false,
        };
        if !compatible {
            diag.error(&loc, "section name is defined more than once");
            return (index, 0);
        }
        let base = match section.modifier {
            SectionModifier::Fragment => {
                let base = merged.size;
                merged.size += section.size;
                merged.data.extend_from_slice(&section.data);
                base
            }
            _ => {
                merged.size = merged.size.max(section.size);
                0
            }
        };
        merge_placement_attrs(merged, section, base, &loc, diag);
        (index, base)
    } else {
        let index = sections.len();
        names.insert(section.name.clone(), index);
        sections.push(LinkSection {
            name: section.name.clone(),
            kind: section.kind,
            modifier: section.modifier,
            org: section.org,
            bank: section.bank,
            align_log2: section.align_log2,
            align_ofs: section.align_ofs,
            size: section.size,
            data: section.data.clone(),
            patches: Vec::new(),
            placed: None,
        });
        (index, 0)
    }
}

fn merge_placement_attrs(
    merged: &mut LinkSection,
    piece: &obj::Section,
    base: u32,
    loc: &str,
    diag: &mut Reporter,
) {
    match (merged.org, piece.org) {
        (Some(a), Some(b)) if a != b => {
            diag.error(
                loc,
                format!("conflicting addresses ${:04X} and ${:04X}", a, b),
            );
        }
        (None, Some(org)) => {
            // A fragment's fixed address pins its own start.
            merged.org = Some(org.wrapping_sub(base as u16));
        }
        _ => {}
    }
    match (merged.bank, piece.bank) {
        (Some(a), Some(b)) if a != b => {
            diag.error(loc, format!("conflicting banks {} and {}", a, b));
        }
        (None, Some(bank)) => merged.bank = Some(bank),
        _ => {}
    }
    if piece.align_log2 > 0 {
        // The piece wants its own start aligned; rebase the requirement
        // onto the merged section's origin.
        let mask = if piece.align_log2 >= 16 {
            0xFFFF
        } else {
            (1u32 << piece.align_log2) - 1
        };
        let wanted = (u32::from(piece.align_ofs).wrapping_sub(base)) & mask;
        if piece.align_log2 > merged.align_log2 {
            let coarse = if merged.align_log2 == 0 {
                0
            } else {
                (1u32 << merged.align_log2) - 1
            };
            if wanted & coarse != u32::from(merged.align_ofs) {
                diag.error(loc, "conflicting alignment constraints");
                return;
            }
            merged.align_log2 = piece.align_log2;
            merged.align_ofs = wanted as u16;
        } else if u32::from(merged.align_ofs) & mask != wanted {
            diag.error(loc, "conflicting alignment constraints");
        }
    }
}

/// Fill every object's symbol table with link-time values, resolving
/// imports against exports.
fn resolve_symbols(loaded: &mut [LoadedObject], diag: &mut Reporter) {
    // Exports first: name to (object, symbol) with duplicate detection.
    let mut exports: HashMap<String, (usize, usize)> = HashMap::new();
    for (object_index, loaded_object) in loaded.iter().enumerate() {
        for (index, symbol) in loaded_object.object.symbols.iter().enumerate() {
            if let obj::Visibility::Export(def) = &symbol.visibility {
                if let Some(&(other, other_index)) = exports.get(&symbol.name) {
                    let here = loaded_object.object.location(def.node, def.line);
                    let there = {
                        let other_object = &loaded[other].object;
                        match other_object.symbols[other_index].visibility.def() {
                            Some(other_def) => {
                                other_object.location(other_def.node, other_def.line)
                            }
                            None => String::from("elsewhere"),
                        }
                    };
                    diag.error(
                        here,
                        format!("`{}` is already exported at {}", symbol.name, there),
                    );
                } else {
                    exports.insert(symbol.name.clone(), (object_index, index));
                }
            }
        }
    }

    for object_index in 0..loaded.len() {
        let mut values = Vec::with_capacity(loaded[object_index].object.symbols.len());
        for symbol in &loaded[object_index].object.symbols {
            let value = match &symbol.visibility {
                obj::Visibility::Local(def) | obj::Visibility::Export(def) => {
                    def_value(&loaded[object_index], def)
                }
                obj::Visibility::Import => match exports.get(&symbol.name) {
                    Some(&(exporter, index)) => {
                        match loaded[exporter].object.symbols[index].visibility.def() {
                            Some(def) => def_value(&loaded[exporter], def),
                            None => SymVal::Unresolved,
                        }
                    }
                    None => {
                        diag.error(
                            format!("object #{}", object_index),
                            format!("`{}` is not defined by any object", symbol.name),
                        );
                        SymVal::Unresolved
                    }
                },
            };
            values.push(value);
        }
        loaded[object_index].symbols = values;
    }
}

fn def_value(loaded: &LoadedObject, def: &obj::SymbolDef) -> SymVal {
    if def.section == obj::SECTION_NONE {
        return SymVal::Value(def.value);
    }
    match loaded.section_map.get(def.section as usize) {
        Some(&(section, base)) => SymVal::Label {
            section,
            offset: def.value as u32 + base,
        },
        None => SymVal::Unresolved,
    }
}

/// Evaluate the deferred assertions now that everything is placed.
fn check_assertions(
    sections: &[LinkSection],
    loaded: &[LoadedObject],
    diag: &mut Reporter,
) -> Result<(), Fatal> {
    for (object_index, loaded_object) in loaded.iter().enumerate() {
        for assertion in &loaded_object.object.assertions {
            let location = loaded_object
                .object
                .location(assertion.patch.node, assertion.patch.line);
            let pc = match assertion.patch.pc_section {
                pc if pc >= 0 => loaded_object
                    .section_map
                    .get(pc as usize)
                    .map(|&(section, base)| (section as i32, assertion.patch.pc_offset + base))
                    .unwrap_or((obj::SECTION_NONE, 0)),
                _ => (obj::SECTION_NONE, 0),
            };
            let value = match patch::eval_rpn(
                &assertion.patch.rpn,
                sections,
                loaded,
                object_index,
                pc.0,
                pc.1,
                &location,
                diag,
            ) {
                Some(value) => value,
                None => continue,
            };
            if value != 0 {
                continue;
            }
            let text = if assertion.message.is_empty() {
                String::from("assertion failed")
            } else {
                format!("assertion failed: {}", assertion.message)
            };
            match assertion.kind {
                AssertKind::Warn => diag.warning(Warning::Assert, &location, text),
                AssertKind::Error => diag.error(&location, text),
                AssertKind::Fatal => {
                    return Err(Fatal::new(format!("{}: {}", location, text)));
                }
            }
        }
    }
    Ok(())
}
