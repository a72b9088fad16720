//! Writing object modules.
//!
//! The serialized layout is documented in [`crate::obj`]. Everything goes
//! through [`std::io::Write`], so objects can stream straight to a file.

use std::io::{self, Write};

use crate::obj::{self, Node, NodeKind, Object, Patch, Section, Symbol, Visibility};

trait WriteExt: Write {
    fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_all(&[value])
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_name(&mut self, value: &str) -> io::Result<()> {
        self.write_all(value.as_bytes())?;
        self.write_all(&[0])
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

/// Serialize an object module.
pub fn write_object<W: Write>(mut w: W, object: &Object) -> io::Result<()> {
    w.write_all(&obj::MAGIC)?;
    w.write_u32(obj::VERSION)?;
    w.write_u32(object.symbols.len() as u32)?;
    w.write_u32(object.sections.len() as u32)?;
    w.write_u32(object.nodes.len() as u32)?;
    for node in &object.nodes {
        write_node(&mut w, node)?;
    }
    for symbol in &object.symbols {
        write_symbol(&mut w, symbol)?;
    }
    for section in &object.sections {
        write_section(&mut w, section)?;
    }
    w.write_u32(object.assertions.len() as u32)?;
    for assertion in &object.assertions {
        write_patch(&mut w, &assertion.patch, Some(assertion.kind.to_obj()))?;
        w.write_name(&assertion.message)?;
    }
    Ok(())
}

fn write_node<W: Write>(w: &mut W, node: &Node) -> io::Result<()> {
    match node.parent {
        Some((index, line)) => {
            w.write_u32(index)?;
            w.write_u32(line)?;
        }
        None => {
            w.write_u32(obj::NODE_NO_PARENT)?;
            w.write_u32(0)?;
        }
    }
    match &node.kind {
        NodeKind::File(name) => {
            w.write_u8(obj::node_type::FILE)?;
            w.write_name(name)?;
        }
        NodeKind::Macro(name) => {
            w.write_u8(obj::node_type::MACRO)?;
            w.write_name(name)?;
        }
        NodeKind::Rept(iters) => {
            w.write_u8(obj::node_type::REPT)?;
            w.write_u32(iters.len() as u32)?;
            for &iter in iters {
                w.write_u32(iter)?;
            }
        }
    }
    Ok(())
}

fn write_symbol<W: Write>(w: &mut W, symbol: &Symbol) -> io::Result<()> {
    w.write_name(&symbol.name)?;
    let (type_byte, def) = match &symbol.visibility {
        Visibility::Local(def) => (obj::symbol_type::LOCAL, Some(def)),
        Visibility::Import => (obj::symbol_type::IMPORT, None),
        Visibility::Export(def) => (obj::symbol_type::EXPORT, Some(def)),
    };
    w.write_u8(type_byte)?;
    if let Some(def) = def {
        w.write_u32(def.node)?;
        w.write_u32(def.line)?;
        w.write_i32(def.section)?;
        w.write_i32(def.value)?;
    }
    Ok(())
}

fn write_section<W: Write>(w: &mut W, section: &Section) -> io::Result<()> {
    w.write_name(&section.name)?;
    w.write_u32(section.size)?;
    let type_byte =
        section.kind.to_obj() | (section.modifier.to_obj() << obj::SECTION_MODIFIER_SHIFT);
    w.write_u8(type_byte)?;
    w.write_i32(section.org.map(i32::from).unwrap_or(obj::FLOATING))?;
    w.write_i32(section.bank.map(|b| b as i32).unwrap_or(obj::FLOATING))?;
    w.write_u8(section.align_log2)?;
    w.write_u32(u32::from(section.align_ofs))?;
    if section.kind.has_data() {
        debug_assert_eq!(section.data.len() as u32, section.size);
        w.write_all(&section.data)?;
        w.write_u32(section.patches.len() as u32)?;
        for patch in &section.patches {
            write_patch(w, patch, None)?;
        }
    }
    Ok(())
}

/// Patch records double as assertion headers; assertions replace the
/// width byte with their severity.
fn write_patch<W: Write>(w: &mut W, patch: &Patch, type_override: Option<u8>) -> io::Result<()> {
    w.write_u32(patch.node)?;
    w.write_u32(patch.line)?;
    w.write_u32(patch.offset)?;
    w.write_i32(patch.pc_section)?;
    w.write_u32(patch.pc_offset)?;
    w.write_u8(type_override.unwrap_or_else(|| patch.kind.to_obj()))?;
    w.write_u32(patch.rpn.len() as u32)?;
    w.write_all(&patch.rpn)?;
    Ok(())
}
