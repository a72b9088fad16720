//! The placement engine: assign every section a concrete `(bank, org)`.
//!
//! First-fit descending, deterministic: fully constrained sections go
//! first, then bank-fixed ones, then org-fixed ones over ascending banks,
//! then fully floating ones sorted by decreasing size and name. Banked
//! types grow their bank list on demand, so ROMX and SRAM only use as
//! many banks as the input (or the overlay) requires.

use std::collections::BTreeMap;

use log::debug;

use crate::common::{MemoryLayout, Region, SectionKind};
use crate::diag::Reporter;
use crate::link::{LinkSection, Placement};

/// One bank's free space, kept as ordered disjoint `[start, end)`
/// address intervals.
#[derive(Debug)]
struct Bank {
    free: Vec<(u32, u32)>,
    placed: Vec<usize>,
}

impl Bank {
    fn new(region: &Region) -> Bank {
        Bank {
            free: vec![(u32::from(region.start), region.end)],
            placed: Vec::new(),
        }
    }

    /// Carve a fixed range out of the free list. `Ok` if it was free.
    fn claim(&mut self, start: u32, size: u32) -> Result<(), ()> {
        if size == 0 {
            return Ok(());
        }
        let end = start + size;
        for i in 0..self.free.len() {
            let (free_start, free_end) = self.free[i];
            if start >= free_start && end <= free_end {
                self.free.remove(i);
                if end < free_end {
                    self.free.insert(i, (end, free_end));
                }
                if start > free_start {
                    self.free.insert(i, (free_start, start));
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// First-fit an aligned floating section; returns the address.
    fn fit(&mut self, size: u32, align_log2: u8, align_ofs: u16) -> Option<u32> {
        for i in 0..self.free.len() {
            let (free_start, free_end) = self.free[i];
            let address = align_up(free_start, align_log2, align_ofs);
            if address + size <= free_end {
                self.claim(address, size).ok()?;
                return Some(address);
            }
        }
        None
    }
}

fn align_up(address: u32, align_log2: u8, align_ofs: u16) -> u32 {
    if align_log2 == 0 {
        return address;
    }
    let unit = 1u32 << align_log2.min(16);
    let mask = unit - 1;
    let wanted = u32::from(align_ofs) & mask;
    address + ((wanted.wrapping_sub(address)) & mask)
}

/// Per-kind bank table, created lazily so on-demand bank growth falls
/// out naturally.
#[derive(Debug)]
struct Space {
    region: Region,
    banks: BTreeMap<u32, Bank>,
}

impl Space {
    fn bank(&mut self, number: u32) -> &mut Bank {
        let region = self.region;
        self.banks
            .entry(number)
            .or_insert_with(|| Bank::new(&region))
    }
}

pub(crate) fn place(
    sections: &mut [LinkSection],
    layout: &MemoryLayout,
    diag: &mut Reporter,
) {
    let mut spaces: BTreeMap<SectionKind, Space> = BTreeMap::new();
    for kind in SectionKind::ALL {
        if let Some(region) = layout.region(kind) {
            spaces.insert(
                kind,
                Space {
                    region,
                    banks: BTreeMap::new(),
                },
            );
        }
    }

    // Validate each section against the layout and sort the work into the
    // four constraint classes.
    let mut fixed = Vec::new();
    let mut bank_only = Vec::new();
    let mut org_only = Vec::new();
    let mut floating = Vec::new();
    for (index, section) in sections.iter_mut().enumerate() {
        let Some(space) = spaces.get(&section.kind) else {
            diag.error(
                format!("section `{}`", section.name),
                format!("{} sections are not legal with this memory layout", section.kind),
            );
            continue;
        };
        let region = space.region;
        if let Some(org) = section.org {
            let org = u32::from(org);
            if org < u32::from(region.start) || org + section.size > region.end {
                diag.error(
                    format!("section `{}`", section.name),
                    format!(
                        "${:04X}-${:04X} does not fit the {} window (${:04X}-${:04X})",
                        org,
                        org + section.size.max(1) - 1,
                        section.kind,
                        region.start,
                        region.end - 1
                    ),
                );
                continue;
            }
            if section.align_log2 > 0 {
                let mask = (1u32 << section.align_log2.min(16)) - 1;
                if org & mask != u32::from(section.align_ofs) & mask {
                    diag.error(
                        format!("section `{}`", section.name),
                        format!(
                            "fixed address ${:04X} contradicts ALIGN[{}, {}]",
                            org, section.align_log2, section.align_ofs
                        ),
                    );
                    continue;
                }
            }
        }
        // Kinds with a single legal bank are implicitly bank-fixed.
        if section.bank.is_none() && region.first_bank == region.last_bank {
            section.bank = Some(region.first_bank);
        }
        if let Some(bank) = section.bank {
            if !region.contains_bank(bank) {
                diag.error(
                    format!("section `{}`", section.name),
                    format!(
                        "bank {} is outside the {} range ({}-{})",
                        bank, section.kind, region.first_bank, region.last_bank
                    ),
                );
                continue;
            }
        }
        if section.size > region.size() {
            diag.error(
                format!("section `{}`", section.name),
                format!(
                    "{} bytes do not fit a {} bank",
                    section.size, section.kind
                ),
            );
            continue;
        }
        match (section.bank, section.org) {
            (Some(_), Some(_)) => fixed.push(index),
            (Some(_), None) => bank_only.push(index),
            (None, Some(_)) => org_only.push(index),
            (None, None) => floating.push(index),
        }
    }

    // Fully floating sections in a deterministic order: big first, names
    // as the tie break.
    floating.sort_by(|&a, &b| {
        sections[b]
            .size
            .cmp(&sections[a].size)
            .then_with(|| sections[a].name.cmp(&sections[b].name))
    });

    for index in fixed {
        let section = &sections[index];
        let bank = section.bank.unwrap();
        let org = u32::from(section.org.unwrap());
        let space = spaces.get_mut(&section.kind).unwrap();
        if space.bank(bank).claim(org, section.size).is_err() {
            let neighbor = overlap_of(sections, &spaces, index, bank, org);
            diag.error(
                format!("section `{}`", sections[index].name),
                match neighbor {
                    Some(other) => format!(
                        "${:04X} overlaps section `{}`",
                        org, sections[other].name
                    ),
                    None => format!("${:04X} is not free", org),
                },
            );
            continue;
        }
        let space = spaces.get_mut(&sections[index].kind).unwrap();
        space.bank(bank).placed.push(index);
        sections[index].placed = Some(Placement {
            bank,
            org: org as u16,
        });
        debug!(
            "placed `{}` at {}[${:04X}] bank {} (fully constrained)",
            sections[index].name, sections[index].kind, org, bank
        );
    }

    for index in bank_only {
        let (kind, bank, size, align_log2, align_ofs) = {
            let s = &sections[index];
            (s.kind, s.bank.unwrap(), s.size, s.align_log2, s.align_ofs)
        };
        let space = spaces.get_mut(&kind).unwrap();
        match space.bank(bank).fit(size, align_log2, align_ofs) {
            Some(org) => {
                space.bank(bank).placed.push(index);
                sections[index].placed = Some(Placement {
                    bank,
                    org: org as u16,
                });
                debug!(
                    "placed `{}` at {}[${:04X}] bank {} (bank fixed)",
                    sections[index].name, kind, org, bank
                );
            }
            None => diag.error(
                format!("section `{}`", sections[index].name),
                format!("no room for {} bytes in {} bank {}", size, kind, bank),
            ),
        }
    }

    for index in org_only {
        let (kind, org, size) = {
            let s = &sections[index];
            (s.kind, u32::from(s.org.unwrap()), s.size)
        };
        let space = spaces.get_mut(&kind).unwrap();
        let (first, last) = (space.region.first_bank, space.region.last_bank);
        let mut placed = false;
        for bank in first..=last {
            if space.bank(bank).claim(org, size).is_ok() {
                space.bank(bank).placed.push(index);
                sections[index].placed = Some(Placement {
                    bank,
                    org: org as u16,
                });
                debug!(
                    "placed `{}` at {}[${:04X}] bank {} (address fixed)",
                    sections[index].name, kind, org, bank
                );
                placed = true;
                break;
            }
        }
        if !placed {
            diag.error(
                format!("section `{}`", sections[index].name),
                format!("${:04X} is not free in any {} bank", org, kind),
            );
        }
    }

    for index in floating {
        let (kind, size, align_log2, align_ofs) = {
            let s = &sections[index];
            (s.kind, s.size, s.align_log2, s.align_ofs)
        };
        let space = spaces.get_mut(&kind).unwrap();
        let (first, last) = (space.region.first_bank, space.region.last_bank);
        let mut placed = false;
        for bank in first..=last {
            if let Some(org) = space.bank(bank).fit(size, align_log2, align_ofs) {
                space.bank(bank).placed.push(index);
                sections[index].placed = Some(Placement {
                    bank,
                    org: org as u16,
                });
                debug!(
                    "placed `{}` at {}[${:04X}] bank {} (floating)",
                    sections[index].name, kind, org, bank
                );
                placed = true;
                break;
            }
        }
        if !placed {
            diag.error(
                format!("section `{}`", sections[index].name),
                format!("no {} space left for {} bytes", kind, size),
            );
        }
    }
}

/// Find an already placed section overlapping `[org, org+size)` in the
/// same bank, for the diagnostic.
fn overlap_of(
    sections: &[LinkSection],
    spaces: &BTreeMap<SectionKind, Space>,
    index: usize,
    bank: u32,
    org: u32,
) -> Option<usize> {
    let section = &sections[index];
    let end = org + section.size;
    let space = spaces.get(&section.kind)?;
    let bank = space.banks.get(&bank)?;
    bank.placed.iter().copied().find(|&other| {
        match sections[other].placed {
            Some(placed) => {
                let other_start = u32::from(placed.org);
                let other_end = other_start + sections[other].size;
                org < other_end && other_start < end
            }
            None => false,
        }
    })
}
