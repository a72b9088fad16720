//! The section builder: where emitted bytes, reservations and patches go.
//!
//! An active-section stack backs `PUSHS`/`POPS`; a LOAD block pretends a
//! RAM section is active for label purposes while the bytes land in the
//! enclosing ROM section; UNION/NEXTU/ENDU rewind the write cursor over
//! overlaid arms. The cursor equals `data.len()` for ROM kinds at all
//! times, since unions are only legal where no data is.

use indexmap::IndexMap;

use crate::asm::context::{ContextStack, Loc};
use crate::asm::expr::{warn_truncation, Expr};
use crate::common::{PatchKind, SectionKind, SectionModifier};
use crate::diag::Reporter;
use crate::rpn::RpnOp;

/// A relocation recorded against a section.
#[derive(Debug, Clone)]
pub struct Patch {
    pub loc: Loc,
    pub offset: u32,
    pub pc_section: usize,
    pub pc_offset: u32,
    pub kind: PatchKind,
    pub ops: Vec<RpnOp>,
}

/// A section under construction.
#[derive(Debug)]
pub struct AsmSection {
    pub name: String,
    pub kind: SectionKind,
    pub modifier: SectionModifier,
    pub org: Option<u16>,
    pub bank: Option<u32>,
    pub align_log2: u8,
    pub align_ofs: u16,
    pub data: Vec<u8>,
    pub size: u32,
    pub patches: Vec<Patch>,
    /// Largest size the org/window combination permits.
    limit: u32,
    overflowed: bool,
}

impl AsmSection {
    fn grow(&mut self, new_size: u32) -> Result<(), String> {
        self.size = self.size.max(new_size);
        if self.size > self.limit && !self.overflowed {
            self.overflowed = true;
            return Err(format!(
                "section `{}` grew past the {} window (${:X} > ${:X} bytes)",
                self.name, self.kind, self.size, self.limit
            ));
        }
        Ok(())
    }
}

/// A UNION arm in progress.
#[derive(Debug)]
struct UnionArm {
    start: u32,
    widest: u32,
}

/// A LOAD block in progress: labels bind to `section` while data goes to
/// the enclosing ROM section.
#[derive(Debug)]
struct LoadBlock {
    section: usize,
    cursor: u32,
}

/// The per-activation state of a section.
#[derive(Debug)]
struct Active {
    section: usize,
    cursor: u32,
    load: Option<LoadBlock>,
    unions: Vec<UnionArm>,
}

/// All sections plus the activation stack.
#[derive(Debug, Default)]
pub struct Sections {
    list: Vec<AsmSection>,
    names: IndexMap<String, usize>,
    current: Option<Active>,
    stack: Vec<Option<Active>>,
}

/// Attributes given on a SECTION or LOAD directive.
#[derive(Debug, Clone, Copy)]
pub struct SectionSpec {
    pub kind: SectionKind,
    pub modifier: SectionModifier,
    pub org: Option<u16>,
    pub bank: Option<u32>,
    pub align_log2: u8,
    pub align_ofs: u16,
}

impl Sections {
    /// The sections in declaration order.
    pub fn list(&self) -> &[AsmSection] {
        &self.list
    }

    pub fn into_list(self) -> Vec<AsmSection> {
        self.list
    }

    pub fn get(&self, index: usize) -> &AsmSection {
        &self.list[index]
    }

    fn validate(spec: &SectionSpec, name: &str) -> Result<u32, String> {
        let region = spec.kind.max_region();
        if let Some(org) = spec.org {
            if u32::from(org) < u32::from(region.start) || u32::from(org) >= region.end {
                return Err(format!(
                    "`{}`: ${:04X} is outside the {} window (${:04X}-${:04X})",
                    name,
                    org,
                    spec.kind,
                    region.start,
                    region.end - 1
                ));
            }
        }
        if let Some(bank) = spec.bank {
            if !region.contains_bank(bank) {
                return Err(format!(
                    "`{}`: bank {} is outside the {} range ({}-{})",
                    name, bank, spec.kind, region.first_bank, region.last_bank
                ));
            }
        }
        if spec.align_log2 > 16 {
            return Err(format!(
                "`{}`: alignment 2^{} is out of range",
                name, spec.align_log2
            ));
        }
        if spec.align_log2 > 0 && spec.align_log2 < 16 {
            if u32::from(spec.align_ofs) >= (1u32 << spec.align_log2) {
                return Err(format!(
                    "`{}`: alignment offset {} is outside a 2^{} boundary",
                    name, spec.align_ofs, spec.align_log2
                ));
            }
        }
        if let (Some(org), 1..=16) = (spec.org, spec.align_log2) {
            let mask = if spec.align_log2 >= 16 {
                0xFFFF
            } else {
                (1u32 << spec.align_log2) - 1
            };
            if u32::from(org) & mask != u32::from(spec.align_ofs) & mask {
                return Err(format!(
                    "`{}`: fixed address ${:04X} contradicts ALIGN[{}, {}]",
                    name, org, spec.align_log2, spec.align_ofs
                ));
            }
        }
        let start = spec.org.map(u32::from).unwrap_or(u32::from(region.start));
        Ok(region.end - start)
    }

    /// Open (or re-open) a section and make it current.
    pub fn begin(&mut self, name: &str, spec: SectionSpec) -> Result<(), String> {
        if spec.modifier == SectionModifier::Union && spec.kind.has_data() {
            return Err(format!("`{}`: a UNION section cannot hold ROM data", name));
        }
        let limit = Self::validate(&spec, name)?;
        let index = match self.names.get(name) {
            Some(&index) => {
                let section = &mut self.list[index];
                if section.modifier != spec.modifier
                    || !matches!(
                        spec.modifier,
                        SectionModifier::Union | SectionModifier::Fragment
                    )
                {
                    return Err(format!("section `{}` already exists", name));
                }
                if section.kind != spec.kind {
                    return Err(format!(
                        "section `{}` is {}, not {}",
                        name, section.kind, spec.kind
                    ));
                }
                merge_placement(section, &spec)?;
                section.limit = section.limit.min(limit);
                index
            }
            None => {
                self.list.push(AsmSection {
                    name: name.to_owned(),
                    kind: spec.kind,
                    modifier: spec.modifier,
                    org: spec.org,
                    bank: spec.bank,
                    align_log2: spec.align_log2,
                    align_ofs: spec.align_ofs,
                    data: Vec::new(),
                    size: 0,
                    patches: Vec::new(),
                    limit,
                    overflowed: false,
                });
                self.names.insert(name.to_owned(), self.list.len() - 1);
                self.list.len() - 1
            }
        };
        let cursor = match spec.modifier {
            SectionModifier::Union => 0,
            _ => self.list[index].size,
        };
        self.current = Some(Active {
            section: index,
            cursor,
            load: None,
            unions: Vec::new(),
        });
        Ok(())
    }

    /// PUSHS: save the current activation (possibly none).
    pub fn push(&mut self) {
        self.stack.push(self.current.take());
    }

    /// POPS: restore the last pushed activation.
    pub fn pop(&mut self) -> Result<(), String> {
        match self.stack.pop() {
            Some(saved) => {
                self.current = saved;
                // The section may have grown while it was pushed away.
                if let Some(active) = &mut self.current {
                    let section = &self.list[active.section];
                    if section.kind.has_data() {
                        active.cursor = section.data.len() as u32;
                    }
                }
                Ok(())
            }
            None => Err(String::from("no entries in the section stack")),
        }
    }

    fn require_active(&self) -> Result<(), String> {
        if self.current.is_none() {
            return Err(String::from("not inside a SECTION"));
        }
        Ok(())
    }

    /// The section new labels should attach to, and at what offset.
    pub fn label_home(&self) -> Result<(usize, u32), String> {
        self.require_active()?;
        let active = self.current.as_ref().unwrap();
        match &active.load {
            Some(load) => Ok((load.section, load.cursor)),
            None => Ok((active.section, active.cursor)),
        }
    }

    /// The current PC as an expression base: section and offset.
    pub fn pc(&self) -> Result<(usize, u32), String> {
        self.label_home()
            .map_err(|_| String::from("PC is undefined outside a SECTION"))
    }

    /// The kind of the current section, if any.
    pub fn active_kind(&self) -> Option<SectionKind> {
        self.current
            .as_ref()
            .map(|active| self.list[active.section].kind)
    }

    /// Open a LOAD block.
    pub fn begin_load(&mut self, name: &str, spec: SectionSpec) -> Result<(), String> {
        self.require_active()?;
        {
            let active = self.current.as_ref().unwrap();
            if active.load.is_some() {
                return Err(String::from("LOAD blocks cannot nest"));
            }
            if !self.list[active.section].kind.has_data() {
                return Err(String::from("LOAD requires a ROM section"));
            }
        }
        if spec.kind.has_data() {
            return Err(format!("`{}`: LOAD needs a RAM section kind", name));
        }
        // Register the RAM section exactly as SECTION would, then rebind
        // the activation so bytes keep flowing into the ROM section.
        let rom = self.current.take().unwrap();
        if let Err(error) = self.begin(name, spec) {
            self.current = Some(rom);
            return Err(error);
        }
        let ram = self.current.take().unwrap();
        self.current = Some(Active {
            load: Some(LoadBlock {
                section: ram.section,
                cursor: ram.cursor,
            }),
            ..rom
        });
        Ok(())
    }

    /// Close the LOAD block.
    pub fn end_load(&mut self) -> Result<(), String> {
        self.require_active()?;
        let load = self.current.as_mut().unwrap().load.take();
        match load {
            Some(load) => self.list[load.section].grow(load.cursor),
            None => Err(String::from("ENDL outside a LOAD block")),
        }
    }

    /// Open a UNION block at the current position.
    pub fn begin_union(&mut self) -> Result<(), String> {
        self.require_active()?;
        let index = self.current.as_ref().unwrap().section;
        if self.list[index].kind.has_data() {
            return Err(String::from("UNION is not allowed in ROM sections"));
        }
        let active = self.current.as_mut().unwrap();
        let start = active.cursor;
        active.unions.push(UnionArm {
            start,
            widest: start,
        });
        Ok(())
    }

    /// Start the next UNION arm.
    pub fn next_union(&mut self) -> Result<(), String> {
        self.require_active()?;
        let active = self.current.as_mut().unwrap();
        let cursor = active.cursor;
        match active.unions.last_mut() {
            Some(arm) => {
                arm.widest = arm.widest.max(cursor);
                active.cursor = arm.start;
                Ok(())
            }
            None => Err(String::from("NEXTU outside a UNION block")),
        }
    }

    /// Close the UNION block; the widest arm wins.
    pub fn end_union(&mut self) -> Result<(), String> {
        self.require_active()?;
        let active = self.current.as_mut().unwrap();
        let cursor = active.cursor;
        match active.unions.pop() {
            Some(arm) => {
                active.cursor = arm.widest.max(cursor);
                Ok(())
            }
            None => Err(String::from("ENDU outside a UNION block")),
        }
    }

    /// Anything left unclosed at end of input.
    pub fn check_closed(&self) -> Result<(), String> {
        if let Some(active) = &self.current {
            if active.load.is_some() {
                return Err(String::from("LOAD block is never closed"));
            }
            if !active.unions.is_empty() {
                return Err(String::from("UNION block is never closed"));
            }
        }
        Ok(())
    }

    fn rom_index(&self) -> Result<usize, String> {
        self.require_active()?;
        let index = self.current.as_ref().unwrap().section;
        if !self.list[index].kind.has_data() {
            return Err(format!(
                "cannot output data in a {} section",
                self.list[index].kind
            ));
        }
        Ok(index)
    }

    /// Emit one literal byte.
    pub fn emit_byte(&mut self, byte: u8) -> Result<(), String> {
        self.emit_bytes(core::slice::from_ref(&byte))
    }

    /// Emit literal bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), String> {
        let index = self.rom_index()?;
        let amount = bytes.len() as u32;
        self.list[index].data.extend_from_slice(bytes);
        let active = self.current.as_mut().unwrap();
        active.cursor += amount;
        let new_size = active.cursor;
        let load = active
            .load
            .as_mut()
            .map(|load| {
                load.cursor += amount;
                (load.section, load.cursor)
            });
        self.list[index].grow(new_size)?;
        if let Some((load_section, load_cursor)) = load {
            self.list[load_section].grow(load_cursor)?;
        }
        Ok(())
    }

    /// DS: reserve space. ROM sections fill with the pattern (or the pad
    /// byte); RAM sections just grow.
    pub fn reserve(&mut self, count: u32, fill: &[u8], pad: u8) -> Result<(), String> {
        self.require_active()?;
        let index = self.current.as_ref().unwrap().section;
        if self.list[index].kind.has_data() {
            let mut bytes = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                bytes.push(if fill.is_empty() {
                    pad
                } else {
                    fill[i % fill.len()]
                });
            }
            return self.emit_bytes(&bytes);
        }
        if !fill.is_empty() {
            return Err(String::from("DS with a fill pattern needs a ROM section"));
        }
        let active = self.current.as_mut().unwrap();
        active.cursor += count;
        let new_size = active.cursor;
        self.list[index].grow(new_size)
    }

    /// ALIGN inside a section: pad when the address is known, otherwise
    /// fold the requirement into the section's placement constraint.
    pub fn align(&mut self, log2: u8, offset: u16, pad: u8) -> Result<(), String> {
        if log2 > 16 {
            return Err(format!("alignment 2^{} is out of range", log2));
        }
        self.require_active()?;
        let (index, cursor, in_load) = {
            let active = self.current.as_ref().unwrap();
            (active.section, active.cursor, active.load.is_some())
        };
        if in_load {
            return Err(String::from("ALIGN is not supported inside LOAD"));
        }
        let mask = if log2 >= 16 { 0xFFFF } else { (1u32 << log2) - 1 };
        match self.list[index].org {
            Some(org) => {
                let address = u32::from(org) + cursor;
                let pad_len = u32::from(offset).wrapping_sub(address) & mask;
                if pad_len == 0 {
                    return Ok(());
                }
                self.reserve(pad_len, &[], pad)
            }
            None => {
                // Floating org: require the eventual base address to make
                // the current position land on the requested boundary.
                let want_ofs = (u32::from(offset).wrapping_sub(cursor) & mask) as u16;
                let section = &mut self.list[index];
                if section.align_log2 >= log2 {
                    if (u32::from(section.align_ofs) & mask) != u32::from(want_ofs) {
                        return Err(format!(
                            "ALIGN[{}, {}] conflicts with the section's alignment",
                            log2, offset
                        ));
                    }
                } else {
                    let coarse_mask = if section.align_log2 == 0 {
                        0
                    } else {
                        (1u32 << section.align_log2) - 1
                    };
                    if u32::from(want_ofs) & coarse_mask != u32::from(section.align_ofs) {
                        return Err(format!(
                            "ALIGN[{}, {}] conflicts with the section's alignment",
                            log2, offset
                        ));
                    }
                    section.align_log2 = log2;
                    section.align_ofs = want_ofs;
                }
                Ok(())
            }
        }
    }

    /// Emit an expression of the given width, creating a patch when its
    /// value must wait for the linker.
    pub fn emit_expr(
        &mut self,
        kind: PatchKind,
        expr: Expr,
        ctx: &ContextStack,
        diag: &mut Reporter,
    ) -> Result<(), String> {
        let index = self.rom_index()?;
        if let Some(error) = &expr.error {
            diag.error(ctx.location(), error);
            return self.emit_bytes(&vec![0; kind.width()]);
        }
        if expr.is_known() && kind != PatchKind::Jr {
            let value = expr.value();
            let bits = 8 * kind.width() as u32;
            warn_truncation(value, bits, diag, &ctx.location(), "operand");
            let bytes = value.to_le_bytes();
            return self.emit_bytes(&bytes[..kind.width()]);
        }
        let (offset, pc_section, pc_offset) = {
            let active = self.current.as_ref().unwrap();
            match &active.load {
                Some(load) => (active.cursor, load.section, load.cursor),
                None => (active.cursor, active.section, active.cursor),
            }
        };
        let patch = Patch {
            loc: ctx.loc(),
            offset,
            pc_section,
            pc_offset,
            kind,
            ops: expr.into_ops(),
        };
        self.list[index].patches.push(patch);
        self.emit_bytes(&vec![0; kind.width()])
    }
}

fn merge_placement(section: &mut AsmSection, spec: &SectionSpec) -> Result<(), String> {
    match (section.org, spec.org) {
        (Some(a), Some(b)) if a != b => {
            return Err(format!(
                "section `{}` is already fixed at ${:04X}",
                section.name, a
            ));
        }
        (None, Some(b)) => section.org = Some(b),
        _ => {}
    }
    match (section.bank, spec.bank) {
        (Some(a), Some(b)) if a != b => {
            return Err(format!(
                "section `{}` is already fixed in bank {}",
                section.name, a
            ));
        }
        (None, Some(b)) => section.bank = Some(b),
        _ => {}
    }
    if spec.align_log2 > section.align_log2 {
        section.align_log2 = spec.align_log2;
        section.align_ofs = spec.align_ofs;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: SectionKind) -> SectionSpec {
        SectionSpec {
            kind,
            modifier: SectionModifier::Normal,
            org: None,
            bank: None,
            align_log2: 0,
            align_ofs: 0,
        }
    }

    #[test]
    fn bytes_go_to_the_active_section() {
        let mut sections = Sections::default();
        sections.begin("A", spec(SectionKind::Rom0)).unwrap();
        sections.emit_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(sections.list()[0].data, [1, 2, 3]);
        assert_eq!(sections.list()[0].size, 3);
    }

    #[test]
    fn ram_sections_refuse_data() {
        let mut sections = Sections::default();
        sections.begin("W", spec(SectionKind::Wram0)).unwrap();
        assert!(sections.emit_byte(0).is_err());
        sections.reserve(16, &[], 0).unwrap();
        assert_eq!(sections.list()[0].size, 16);
    }

    #[test]
    fn union_takes_the_widest_arm() {
        let mut sections = Sections::default();
        sections.begin("W", spec(SectionKind::Wram0)).unwrap();
        sections.begin_union().unwrap();
        sections.reserve(4, &[], 0).unwrap();
        sections.next_union().unwrap();
        sections.reserve(10, &[], 0).unwrap();
        sections.end_union().unwrap();
        sections.reserve(1, &[], 0).unwrap();
        assert_eq!(sections.list()[0].size, 11);
    }

    #[test]
    fn pushs_pops_round_trip() {
        let mut sections = Sections::default();
        sections.begin("A", spec(SectionKind::Rom0)).unwrap();
        sections.emit_byte(1).unwrap();
        sections.push();
        sections.begin("B", spec(SectionKind::Rom0)).unwrap();
        sections.emit_byte(2).unwrap();
        sections.pop().unwrap();
        sections.emit_byte(3).unwrap();
        assert_eq!(sections.list()[0].data, [1, 3]);
        assert_eq!(sections.list()[1].data, [2]);
    }

    #[test]
    fn fragments_append() {
        let mut sections = Sections::default();
        let mut fragment = spec(SectionKind::Rom0);
        fragment.modifier = SectionModifier::Fragment;
        sections.begin("F", fragment).unwrap();
        sections.emit_byte(1).unwrap();
        sections.begin("F", fragment).unwrap();
        sections.emit_byte(2).unwrap();
        assert_eq!(sections.list().len(), 1);
        assert_eq!(sections.list()[0].data, [1, 2]);
    }

    #[test]
    fn load_splits_bytes_from_labels() {
        let mut sections = Sections::default();
        sections.begin("Code", spec(SectionKind::Rom0)).unwrap();
        sections.emit_byte(0xAA).unwrap();
        sections
            .begin_load("Ram", spec(SectionKind::Wram0))
            .unwrap();
        assert_eq!(sections.label_home().unwrap(), (1, 0));
        sections.emit_bytes(&[1, 2]).unwrap();
        assert_eq!(sections.label_home().unwrap(), (1, 2));
        sections.end_load().unwrap();
        assert_eq!(sections.list()[0].data, [0xAA, 1, 2]);
        assert_eq!(sections.list()[1].size, 2);
    }
}
