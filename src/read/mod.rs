//! Reading object modules.
//!
//! The inverse of [`crate::write`]. Malformed input never panics: every
//! read is bounds-checked and every enum byte validated, with terse
//! static messages in the error type. A magic or version mismatch is an
//! error the caller treats as fatal.

use core::{fmt, result};

use memchr::memchr;

use crate::common::{AssertKind, PatchKind, SectionKind, SectionModifier};
use crate::obj::{self, Assertion, Node, NodeKind, Object, Patch, Section, Symbol, SymbolDef, Visibility};

/// The error type used within the read module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub(crate) &'static str);

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for Error {}

/// The result type used within the read module.
pub type Result<T> = result::Result<T, Error>;

/// A bounds-checked little-endian cursor.
#[derive(Debug, Clone, Copy)]
struct Bytes<'data> {
    data: &'data [u8],
    offset: usize,
}

impl<'data> Bytes<'data> {
    fn new(data: &'data [u8]) -> Self {
        Bytes { data, offset: 0 }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'data [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(Error("Object is truncated"))?;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or(Error("Object is truncated"))?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_name(&mut self) -> Result<String> {
        let rest = &self.data[self.offset..];
        let len = memchr(0, rest).ok_or(Error("Unterminated string"))?;
        let name = core::str::from_utf8(&rest[..len])
            .map_err(|_| Error("String is not UTF-8"))?;
        self.offset += len + 1;
        Ok(name.to_owned())
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// Parse an object module.
pub fn parse(data: &[u8]) -> Result<Object> {
    let mut bytes = Bytes::new(data);
    let magic = bytes.read_slice(4)?;
    if magic != obj::MAGIC {
        return Err(Error("Not an object module (bad magic)"));
    }
    let version = bytes.read_u32()?;
    if version != obj::VERSION {
        return Err(Error("Unsupported object version"));
    }
    let nb_symbols = bytes.read_u32()? as usize;
    let nb_sections = bytes.read_u32()? as usize;
    let nb_nodes = bytes.read_u32()? as usize;

    let mut object = Object::default();
    for _ in 0..nb_nodes {
        object.nodes.push(read_node(&mut bytes, nb_nodes)?);
    }
    for _ in 0..nb_symbols {
        object.symbols.push(read_symbol(&mut bytes, nb_nodes)?);
    }
    for _ in 0..nb_sections {
        object.sections.push(read_section(&mut bytes, nb_nodes)?);
    }
    let nb_assertions = bytes.read_u32()? as usize;
    for _ in 0..nb_assertions {
        object.assertions.push(read_assertion(&mut bytes, nb_nodes)?);
    }
    if !bytes.is_empty() {
        return Err(Error("Trailing bytes after object contents"));
    }
    Ok(object)
}

fn read_node(bytes: &mut Bytes<'_>, nb_nodes: usize) -> Result<Node> {
    let parent_index = bytes.read_u32()?;
    let parent_line = bytes.read_u32()?;
    let parent = if parent_index == obj::NODE_NO_PARENT {
        None
    } else {
        if parent_index as usize >= nb_nodes {
            return Err(Error("Node parent index out of range"));
        }
        Some((parent_index, parent_line))
    };
    let kind = match bytes.read_u8()? {
        obj::node_type::REPT => {
            let depth = bytes.read_u32()? as usize;
            if depth > nb_nodes {
                return Err(Error("REPT node deeper than the node table"));
            }
            let mut iters = Vec::with_capacity(depth);
            for _ in 0..depth {
                iters.push(bytes.read_u32()?);
            }
            NodeKind::Rept(iters)
        }
        obj::node_type::FILE => NodeKind::File(bytes.read_name()?),
        obj::node_type::MACRO => NodeKind::Macro(bytes.read_name()?),
        _ => return Err(Error("Invalid node type")),
    };
    Ok(Node { parent, kind })
}

fn read_symbol(bytes: &mut Bytes<'_>, nb_nodes: usize) -> Result<Symbol> {
    let name = bytes.read_name()?;
    let type_byte = bytes.read_u8()?;
    let visibility = match type_byte {
        obj::symbol_type::IMPORT => Visibility::Import,
        obj::symbol_type::LOCAL | obj::symbol_type::EXPORT => {
            let def = read_symbol_def(bytes, nb_nodes)?;
            if type_byte == obj::symbol_type::LOCAL {
                Visibility::Local(def)
            } else {
                Visibility::Export(def)
            }
        }
        _ => return Err(Error("Invalid symbol type")),
    };
    Ok(Symbol { name, visibility })
}

fn read_symbol_def(bytes: &mut Bytes<'_>, nb_nodes: usize) -> Result<SymbolDef> {
    let node = bytes.read_u32()?;
    if node as usize >= nb_nodes {
        return Err(Error("Symbol node index out of range"));
    }
    let line = bytes.read_u32()?;
    let section = bytes.read_i32()?;
    let value = bytes.read_i32()?;
    Ok(SymbolDef {
        node,
        line,
        section,
        value,
    })
}

fn read_section(bytes: &mut Bytes<'_>, nb_nodes: usize) -> Result<Section> {
    let name = bytes.read_name()?;
    let size = bytes.read_u32()?;
    let type_byte = bytes.read_u8()?;
    let kind = SectionKind::from_obj(type_byte & obj::SECTION_KIND_MASK)
        .ok_or(Error("Invalid section type"))?;
    let modifier = SectionModifier::from_obj(type_byte >> obj::SECTION_MODIFIER_SHIFT)
        .ok_or(Error("Invalid section modifier"))?;
    let org = match bytes.read_i32()? {
        obj::FLOATING => None,
        org if (0..=0xFFFF).contains(&org) => Some(org as u16),
        _ => return Err(Error("Section address out of range")),
    };
    let bank = match bytes.read_i32()? {
        obj::FLOATING => None,
        bank if bank >= 0 => Some(bank as u32),
        _ => return Err(Error("Section bank out of range")),
    };
    let align_log2 = bytes.read_u8()?;
    if align_log2 > 16 {
        return Err(Error("Section alignment out of range"));
    }
    let align_ofs = bytes.read_u32()?;
    if align_ofs > 0xFFFF {
        return Err(Error("Section alignment offset out of range"));
    }
    let mut section = Section {
        name,
        size,
        kind,
        modifier,
        org,
        bank,
        align_log2,
        align_ofs: align_ofs as u16,
        data: Vec::new(),
        patches: Vec::new(),
    };
    if kind.has_data() {
        section.data = bytes.read_slice(size as usize)?.to_vec();
        let nb_patches = bytes.read_u32()? as usize;
        for _ in 0..nb_patches {
            let (mut patch, type_byte) = read_patch(bytes, nb_nodes)?;
            patch.kind = PatchKind::from_obj(type_byte).ok_or(Error("Invalid patch type"))?;
            if patch.offset as usize + patch.kind.width() > size as usize {
                return Err(Error("Patch offset outside its section"));
            }
            section.patches.push(patch);
        }
    }
    Ok(section)
}

fn read_patch(bytes: &mut Bytes<'_>, nb_nodes: usize) -> Result<(Patch, u8)> {
    let node = bytes.read_u32()?;
    if node as usize >= nb_nodes {
        return Err(Error("Patch node index out of range"));
    }
    let line = bytes.read_u32()?;
    let offset = bytes.read_u32()?;
    let pc_section = bytes.read_i32()?;
    let pc_offset = bytes.read_u32()?;
    let type_byte = bytes.read_u8()?;
    let rpn_len = bytes.read_u32()? as usize;
    let rpn = bytes.read_slice(rpn_len)?.to_vec();
    // Assertions reuse the record with a severity in the type byte; the
    // caller decides which reading applies and fills in `kind`.
    let patch = Patch {
        node,
        line,
        offset,
        pc_section,
        pc_offset,
        kind: PatchKind::Byte,
        rpn,
    };
    Ok((patch, type_byte))
}

fn read_assertion(bytes: &mut Bytes<'_>, nb_nodes: usize) -> Result<Assertion> {
    let (patch, type_byte) = read_patch(bytes, nb_nodes)?;
    let kind = AssertKind::from_obj(type_byte).ok_or(Error("Invalid assertion type"))?;
    let message = bytes.read_name()?;
    Ok(Assertion {
        patch,
        kind,
        message,
    })
}
