//! The object-module format.
//!
//! An object module stores one translation unit's sections, symbols,
//! relocations and assertions. Everything is little-endian. The layout is:
//!
//! * magic [`MAGIC`], version u32 ([`VERSION`]; any mismatch is fatal),
//! * `nbSymbols` u32, `nbSections` u32, `nbNodes` u32,
//! * the node table: `(parentIndex u32, parentLine u32, type u8, payload)`
//!   where the payload is a NUL-terminated name for FILE and MACRO nodes and
//!   a `depth u32` followed by `depth` u32 iteration numbers for REPT nodes.
//!   Parent index `0xFFFF_FFFF` marks a root node. The table reconstructs
//!   include/macro call chains for diagnostics,
//! * the symbols: `(name NUL-string, type u8)`; non-IMPORT symbols carry
//!   `(nodeIdx u32, line u32, sectionID s32, value s32)`,
//! * the sections: `(name NUL-string, size u32, type u8 with bits 7:6 the
//!   modifier, org s32, bank s32, alignLog2 u8, alignOfs u32)`; ROM kinds
//!   append `size` data bytes, `nbPatches u32` and the patch records,
//! * `nbAssertions` u32 and the assertion records: a patch record whose
//!   type byte is the assertion severity, followed by the message string.
//!
//! Patch records are `(nodeIdx u32, line u32, offset u32, pcSectionID s32,
//! pcOffset u32, type u8, rpnLen u32, rpn bytes)`. The RPN opcode bytes are
//! defined in [`rpn_op`].

use crate::common::{AssertKind, PatchKind, SectionKind, SectionModifier};

/// The magic number at the start of every object module.
pub const MAGIC: [u8; 4] = *b"RGB9";

/// The format version following the magic.
pub const VERSION: u32 = 9;

/// Parent index of a root node.
pub const NODE_NO_PARENT: u32 = 0xFFFF_FFFF;

/// Section ID meaning "no section" (constants and imports).
pub const SECTION_NONE: i32 = -1;

/// Org or bank value meaning "floating".
pub const FLOATING: i32 = -1;

/// Node table entry types.
pub mod node_type {
    /// A REPT/FOR body; the payload is the iteration number list.
    pub const REPT: u8 = 0;
    /// A source file; the payload is its path.
    pub const FILE: u8 = 1;
    /// A macro body; the payload is the macro name.
    pub const MACRO: u8 = 2;
}

/// Symbol table entry types.
pub mod symbol_type {
    /// Defined here, not visible to other modules.
    pub const LOCAL: u8 = 0;
    /// Referenced here, defined elsewhere.
    pub const IMPORT: u8 = 1;
    /// Defined here and visible to other modules.
    pub const EXPORT: u8 = 2;
}

/// Mask for the section kind bits of the section type byte.
pub const SECTION_KIND_MASK: u8 = 0x3F;

/// Shift for the section modifier bits of the section type byte.
pub const SECTION_MODIFIER_SHIFT: u32 = 6;

/// RPN opcode bytes.
///
/// Each opcode is a single byte; `CONST` is followed by an s32 operand, and
/// the symbol opcodes by a u32 symbol index. The section opcodes embed a
/// NUL-terminated section name.
pub mod rpn_op {
    pub const ADD: u8 = 0x00;
    pub const SUB: u8 = 0x01;
    pub const MUL: u8 = 0x02;
    pub const DIV: u8 = 0x03;
    pub const MOD: u8 = 0x04;
    pub const NEG: u8 = 0x05;
    pub const EXP: u8 = 0x06;
    pub const OR: u8 = 0x10;
    pub const AND: u8 = 0x11;
    pub const XOR: u8 = 0x12;
    pub const NOT: u8 = 0x13;
    pub const LOGAND: u8 = 0x21;
    pub const LOGOR: u8 = 0x22;
    pub const LOGNOT: u8 = 0x23;
    pub const LOGEQ: u8 = 0x30;
    pub const LOGNE: u8 = 0x31;
    pub const LOGGT: u8 = 0x32;
    pub const LOGLT: u8 = 0x33;
    pub const LOGGE: u8 = 0x34;
    pub const LOGLE: u8 = 0x35;
    pub const SHL: u8 = 0x40;
    pub const SHR: u8 = 0x41;
    pub const USHR: u8 = 0x42;
    /// Followed by a u32 symbol index.
    pub const BANK_SYM: u8 = 0x50;
    /// Followed by a NUL-terminated section name.
    pub const BANK_SECT: u8 = 0x51;
    /// The bank of the section the patch itself lives in.
    pub const BANK_SELF: u8 = 0x52;
    /// Followed by a NUL-terminated section name.
    pub const SIZEOF_SECT: u8 = 0x53;
    /// Followed by a NUL-terminated section name.
    pub const STARTOF_SECT: u8 = 0x54;
    /// Validate an HRAM address and reduce it to its low byte.
    pub const HRAM_CHECK: u8 = 0x60;
    /// Validate a RST vector and fold in the opcode bits.
    pub const RST_CHECK: u8 = 0x61;
    /// Followed by an s32 value.
    pub const CONST: u8 = 0x80;
    /// Followed by a u32 symbol index.
    pub const SYM: u8 = 0x81;
}

/// A parsed or to-be-written object module.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Object {
    /// Include/macro/rept context chain nodes.
    pub nodes: Vec<Node>,
    /// All symbols, in the order their indices are assigned.
    pub symbols: Vec<Symbol>,
    /// All sections, in declaration order.
    pub sections: Vec<Section>,
    /// Deferred assertions.
    pub assertions: Vec<Assertion>,
}

impl Object {
    /// Render the context chain of a source position, outermost first,
    /// the way assembler diagnostics do.
    pub fn location(&self, node: u32, line: u32) -> String {
        let mut chain = Vec::new();
        let mut current = Some((node, line));
        while let Some((index, at)) = current {
            match self.nodes.get(index as usize) {
                Some(node) => {
                    chain.push(format!("{}({})", node.display_name(), at));
                    current = node.parent;
                }
                None => break,
            }
        }
        chain.reverse();
        chain.join(" -> ")
    }
}

/// One entry of the node table.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Parent node index and the line within the parent where this context
    /// was entered, or `None` for a root node.
    pub parent: Option<(u32, u32)>,
    /// What kind of lexical context the node describes.
    pub kind: NodeKind,
}

/// The payload of a [`Node`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A source file, by path.
    File(String),
    /// A macro expansion, by macro name.
    Macro(String),
    /// A REPT/FOR expansion; the numbers of every nested iteration,
    /// outermost first.
    Rept(Vec<u32>),
}

impl Node {
    /// The name to show in a diagnostic context line.
    pub fn display_name(&self) -> String {
        match &self.kind {
            NodeKind::File(name) => name.clone(),
            NodeKind::Macro(name) => format!("macro {}", name),
            NodeKind::Rept(iters) => {
                let mut name = String::from("rept");
                for it in iters {
                    name.push_str(&format!(" ({})", it));
                }
                name
            }
        }
    }
}

/// One symbol record.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    /// The symbol name, scope separators included.
    pub name: String,
    /// Visibility and definedness.
    pub visibility: Visibility,
}

/// Whether a symbol is defined here, and who may see it.
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    /// Defined in this module only.
    Local(SymbolDef),
    /// Defined elsewhere; the linker must resolve it by name.
    Import,
    /// Defined here and visible to every module in the link.
    Export(SymbolDef),
}

impl Visibility {
    /// The definition record, if the symbol is defined in this module.
    pub fn def(&self) -> Option<&SymbolDef> {
        match self {
            Visibility::Local(def) | Visibility::Export(def) => Some(def),
            Visibility::Import => None,
        }
    }
}

/// Where and what a defined symbol is.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDef {
    /// Node of the definition site.
    pub node: u32,
    /// Line of the definition site.
    pub line: u32,
    /// Owning section index, or [`SECTION_NONE`] for numeric constants.
    pub section: i32,
    /// Offset within the section for labels, the value for constants.
    pub value: i32,
}

/// One section record.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Section name; unique across the link unless the modifier says
    /// otherwise.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    /// Memory type.
    pub kind: SectionKind,
    /// UNION/FRAGMENT combination rule.
    pub modifier: SectionModifier,
    /// Fixed base address, or `None` to let the linker place it.
    pub org: Option<u16>,
    /// Fixed bank, or `None` to let the linker pick one.
    pub bank: Option<u32>,
    /// Required alignment: the org must have `align_log2` low bits equal to
    /// `align_ofs`.
    pub align_log2: u8,
    /// Offset within the alignment boundary.
    pub align_ofs: u16,
    /// Data bytes; empty for kinds without data.
    pub data: Vec<u8>,
    /// Relocations into `data`.
    pub patches: Vec<Patch>,
}

/// One relocation record.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Node of the source location, for diagnostics.
    pub node: u32,
    /// Line of the source location.
    pub line: u32,
    /// Byte offset of the patched field within the section.
    pub offset: u32,
    /// Section the patch's PC lives in (differs from the patched section
    /// inside LOAD blocks), or [`SECTION_NONE`].
    pub pc_section: i32,
    /// Offset of the PC within `pc_section`.
    pub pc_offset: u32,
    /// Width and interpretation.
    pub kind: PatchKind,
    /// The serialized RPN expression computing the value.
    pub rpn: Vec<u8>,
}

/// One assertion record: a condition checked after placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    /// The condition, shaped exactly like a patch; it fails when the RPN
    /// evaluates to zero.
    pub patch: Patch,
    /// Severity on failure.
    pub kind: AssertKind,
    /// Message to print, possibly empty.
    pub message: String,
}
