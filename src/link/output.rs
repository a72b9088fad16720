//! Output emission: the ROM image, the symbol file, and the map file.
//!
//! All three walk section types in the documented order (ROM0, ROMX,
//! VRAM, SRAM, WRAM0, WRAMX, OAM, HRAM) and banks in ascending order
//! within each type.

use std::io::{self, Write};

use crate::common::{SectionKind, BANK_SIZE};
use crate::link::{LinkOutput, Options};

/// The comment heading the generated symbol file.
const SYM_HEADER: &str = "; File generated by gbasm linker";

impl LinkOutput {
    /// Sections of one kind and bank, as indices, ascending by address.
    fn bank_sections(&self, kind: SectionKind, bank: u32) -> Vec<usize> {
        let mut list: Vec<usize> = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, section)| {
                section.kind == kind
                    && section
                        .placed
                        .map(|placement| placement.bank == bank)
                        .unwrap_or(false)
            })
            .map(|(index, _)| index)
            .collect();
        list.sort_by_key(|&index| self.sections[index].placed.unwrap().org);
        list
    }

    /// The banks of one kind that have placed sections, ascending.
    fn banks_of(&self, kind: SectionKind) -> Vec<u32> {
        let mut banks: Vec<u32> = self
            .sections
            .iter()
            .filter(|section| section.kind == kind)
            .filter_map(|section| section.placed.map(|placement| placement.bank))
            .collect();
        banks.sort_unstable();
        banks.dedup();
        banks
    }

    /// Build the ROM image: ROM0, then each ROMX bank in ascending index,
    /// gaps filled from the overlay or with the pad byte.
    pub fn rom_image(&self, opts: &Options) -> Result<Vec<u8>, String> {
        let tiny = opts.layout.tiny;
        let rom0_banks: u32 = if tiny { 2 } else { 1 };
        if let Some(overlay) = &opts.overlay {
            let banks = overlay.len() as u32 / BANK_SIZE;
            if overlay.len() as u32 % BANK_SIZE != 0 || banks < 2 {
                return Err(format!(
                    "overlay must be a multiple of ${:X} bytes and at least 2 banks, got {} bytes",
                    BANK_SIZE,
                    overlay.len()
                ));
            }
            if tiny && banks != 2 {
                return Err(String::from("overlay must be exactly 32 KiB in 32 KiB mode"));
            }
        }
        let max_romx_bank = if tiny {
            0
        } else {
            self.banks_of(SectionKind::Romx).last().copied().unwrap_or(0)
        };
        let overlay_banks = opts
            .overlay
            .as_ref()
            .map(|overlay| overlay.len() as u32 / BANK_SIZE)
            .unwrap_or(0);
        // The overlay can dictate more ROMX banks than any section uses.
        let total_banks = (max_romx_bank + 1)
            .max(rom0_banks)
            .max(overlay_banks);
        let mut image = vec![opts.pad; (total_banks * BANK_SIZE) as usize];
        if let Some(overlay) = &opts.overlay {
            image[..overlay.len()].copy_from_slice(overlay);
        }
        for section in &self.sections {
            if !section.kind.has_data() {
                continue;
            }
            let Some(placement) = section.placed else {
                continue;
            };
            let position = match section.kind {
                SectionKind::Rom0 => u32::from(placement.org),
                _ => placement.bank * BANK_SIZE + (u32::from(placement.org) - BANK_SIZE),
            } as usize;
            image[position..position + section.data.len()].copy_from_slice(&section.data);
        }
        Ok(image)
    }

    /// Labels of one section, with their addresses, in symbol-file order.
    fn section_symbols(&self, section_index: usize) -> Vec<(u32, &str)> {
        let section = &self.sections[section_index];
        let Some(placement) = section.placed else {
            return Vec::new();
        };
        let mut list: Vec<(u32, &str)> = self
            .symbols
            .iter()
            .filter(|symbol| symbol.section == section_index)
            .filter(|symbol| sym_file_legal(&symbol.name))
            .map(|symbol| (u32::from(placement.org) + symbol.offset, symbol.name.as_str()))
            .collect();
        list.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| sym_order_key(a.1).cmp(&sym_order_key(b.1)))
        });
        list
    }

    /// Write the symbol file: `BB:AAAA name` lines in lowercase hex.
    pub fn write_sym<W: Write>(&self, mut w: W) -> io::Result<()> {
        writeln!(w, "{}", SYM_HEADER)?;
        for kind in SectionKind::ALL {
            for bank in self.banks_of(kind) {
                let mut entries: Vec<(u32, &str)> = Vec::new();
                for index in self.bank_sections(kind, bank) {
                    entries.extend(self.section_symbols(index));
                }
                entries.sort_by(|a, b| {
                    a.0.cmp(&b.0)
                        .then_with(|| sym_order_key(a.1).cmp(&sym_order_key(b.1)))
                });
                for (address, name) in entries {
                    writeln!(w, "{:02x}:{:04x} {}", bank, address, escape_sym_name(name))?;
                }
            }
        }
        Ok(())
    }

    /// Write the map file: a usage summary, then a per-bank listing with
    /// embedded symbols and explicit gaps.
    pub fn write_map<W: Write>(&self, mut w: W, opts: &Options) -> io::Result<()> {
        writeln!(w, "SUMMARY:")?;
        for kind in SectionKind::ALL {
            let Some(region) = opts.layout.region(kind) else {
                continue;
            };
            let banks = self.banks_of(kind);
            let bank_count = banks.len().max(1) as u32;
            let used: u32 = self
                .sections
                .iter()
                .filter(|section| section.kind == kind && section.placed.is_some())
                .map(|section| section.size)
                .sum();
            let free = bank_count * region.size() - used;
            writeln!(
                w,
                "\t{}: {} byte{} used / {} free in {} bank{}",
                kind,
                used,
                plural(used),
                free,
                bank_count,
                plural(bank_count)
            )?;
        }
        for kind in SectionKind::ALL {
            let Some(region) = opts.layout.region(kind) else {
                continue;
            };
            for bank in self.banks_of(kind) {
                writeln!(w, "{} bank #{}:", kind, bank)?;
                let mut cursor = u32::from(region.start);
                let mut empty_total = 0;
                for index in self.bank_sections(kind, bank) {
                    let section = &self.sections[index];
                    let placement = section.placed.unwrap();
                    let start = u32::from(placement.org);
                    if start > cursor {
                        let gap = start - cursor;
                        writeln!(
                            w,
                            "\tEMPTY: ${:04x}-${:04x} (${:x} byte{})",
                            cursor,
                            start - 1,
                            gap,
                            plural(gap)
                        )?;
                        empty_total += gap;
                    }
                    if section.size == 0 {
                        writeln!(w, "\tSECTION: ${:04x} (0 bytes) [\"{}\"]", start, section.name)?;
                    } else {
                        writeln!(
                            w,
                            "\tSECTION: ${:04x}-${:04x} (${:x} byte{}) [\"{}\"]",
                            start,
                            start + section.size - 1,
                            section.size,
                            plural(section.size),
                            section.name
                        )?;
                    }
                    for (address, name) in self.section_symbols(index) {
                        writeln!(w, "\t\t${:04x} = {}", address, name)?;
                    }
                    cursor = cursor.max(start + section.size);
                }
                if cursor < region.end {
                    let gap = region.end - cursor;
                    writeln!(
                        w,
                        "\tEMPTY: ${:04x}-${:04x} (${:x} byte{})",
                        cursor,
                        region.end - 1,
                        gap,
                        plural(gap)
                    )?;
                    empty_total += gap;
                }
                writeln!(w, "\tTOTAL EMPTY: ${:x} byte{}", empty_total, plural(empty_total))?;
            }
        }
        Ok(())
    }
}

fn plural(count: u32) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// Whether a name may appear in the symbol file.
fn sym_file_legal(name: &str) -> bool {
    name.chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
}

/// The total order for same-address symbols: scope name first, then the
/// parent before its own locals, then the local part.
fn sym_order_key(name: &str) -> (&str, u8, &str) {
    match name.split_once('.') {
        Some((scope, local)) => (scope, 1, local),
        None => (name, 0, ""),
    }
}

/// Escape non-ASCII characters for the symbol file.
fn escape_sym_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii() {
            out.push(c);
        } else if (c as u32) <= 0xFFFF {
            out.push_str(&format!("\\u{:04X}", c as u32));
        } else {
            out.push_str(&format!("\\U{:08X}", c as u32));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sym_ordering_is_total() {
        let mut names = vec!["B", "A.x", "A", "C.y"];
        names.sort_by_key(|name| sym_order_key(name));
        assert_eq!(names, ["A", "A.x", "B", "C.y"]);
        let mut reversed = vec!["C.y", "A", "A.x", "B"];
        reversed.sort_by_key(|name| sym_order_key(name));
        assert_eq!(reversed, names);
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_sym_name("Plain_1"), "Plain_1");
        assert_eq!(escape_sym_name("héllo"), "h\\u00E9llo");
        assert_eq!(escape_sym_name("a\u{1F600}"), "a\\U0001F600");
    }
}
