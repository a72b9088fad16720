//! Link scenarios: placement, relocation, fragments, overlays, and the
//! text outputs.

use gbasm::asm::{self, Options as AsmOptions};
use gbasm::link::{self, LinkError, Options};
use gbasm::obj::Object;

fn obj(source: &str) -> Object {
    asm::assemble_str("test.asm", source, &AsmOptions::default())
        .expect("assembly failed")
        .object
}

fn find_symbol(output: &link::LinkOutput, name: &str) -> u32 {
    let symbol = output
        .symbols
        .iter()
        .find(|symbol| symbol.name == name)
        .unwrap_or_else(|| panic!("no symbol named {}", name));
    let placement = output.sections[symbol.section].placed.unwrap();
    u32::from(placement.org) + symbol.offset
}

#[test]
fn fragments_concatenate_across_objects() {
    let a = obj("SECTION \"A\", ROM0\nLabel::\n\tdb 1\n");
    let b = obj(
        "SECTION FRAGMENT \"A\", ROM0\n\
         \tdb 2\n\
         SECTION \"B\", ROM0[$0100]\n\
         \tdb SIZEOF(\"A\")\n\
         \tdw STARTOF(\"A\")\n",
    );
    let opts = Options::default();
    let output = link::link(vec![a, b], &opts).expect("link failed");
    assert_eq!(find_symbol(&output, "Label"), 0x0000);

    let rom = output.rom_image(&opts).unwrap();
    assert_eq!(rom.len(), 0x4000);
    assert_eq!(&rom[0..2], &[1, 2]);
    assert_eq!(rom[0x100], 2); // SIZEOF("A")
    assert_eq!(&rom[0x101..0x103], &[0, 0]); // STARTOF("A")
}

#[test]
fn imports_resolve_against_exports() {
    let caller = obj("SECTION \"Main\", ROM0[$0000]\n\tdw Target\n");
    let callee = obj("SECTION \"Lib\", ROM0[$0010]\nTarget::\n\tdb 9\n");
    let opts = Options::default();
    let output = link::link(vec![caller, callee], &opts).expect("link failed");
    let rom = output.rom_image(&opts).unwrap();
    assert_eq!(&rom[0..2], &[0x10, 0x00]);
    assert_eq!(rom[0x10], 9);
}

#[test]
fn undefined_imports_fail_the_link() {
    let caller = obj("SECTION \"Main\", ROM0\n\tdw Nowhere\n");
    let result = link::link(vec![caller], &Options::default());
    assert!(matches!(result, Err(LinkError::Errors(_))));
}

#[test]
fn duplicate_exports_fail_the_link() {
    let a = obj("SECTION \"A\", ROM0\nTwice::\n");
    let b = obj("SECTION \"B\", ROM0\nTwice::\n");
    let result = link::link(vec![a, b], &Options::default());
    assert!(matches!(result, Err(LinkError::Errors(_))));
}

#[test]
fn jr_in_range_gets_its_displacement() {
    let object = obj(
        "SECTION \"S\", ROM0[$0000]\n\
         Start:\n\
         \tjr Target\n\
         \tds $0E\n\
         Target:\n\
         \tdb 9\n",
    );
    let opts = Options::default();
    let output = link::link(vec![object], &opts).expect("link failed");
    let rom = output.rom_image(&opts).unwrap();
    assert_eq!(rom[0], 0x18);
    assert_eq!(rom[1], 0x0E);
}

#[test]
fn jr_out_of_range_is_an_error() {
    let object = obj(
        "SECTION \"S\", ROM0[$0000]\n\
         \tjr Target\n\
         \tds $80\n\
         Target:\n",
    );
    let result = link::link(vec![object], &Options::default());
    assert!(matches!(result, Err(LinkError::Errors(_))));
}

#[test]
fn overlay_fills_everything_outside_the_sections() {
    let object = obj("SECTION \"S\", ROM0[$0100]\n\tds 16, $EE\n");
    let mut opts = Options::default();
    opts.layout.tiny = true;
    opts.overlay = Some((0..0x8000u32).map(|i| (i & 0xFF) as u8).collect());
    let output = link::link(vec![object], &opts).expect("link failed");
    let rom = output.rom_image(&opts).unwrap();
    assert_eq!(rom.len(), 0x8000);
    assert!(rom[0x100..0x110].iter().all(|&byte| byte == 0xEE));
    assert_eq!(rom[0x0FF], 0xFF);
    assert_eq!(rom[0x110], 0x10);
    assert_eq!(rom[0x7FFF], 0xFF);
}

#[test]
fn short_overlays_are_rejected() {
    let object = obj("SECTION \"S\", ROM0\n\tdb 1\n");
    let mut opts = Options::default();
    opts.overlay = Some(vec![0; 0x4000]);
    let output = link::link(vec![object], &opts).expect("link failed");
    assert!(output.rom_image(&opts).is_err());
}

#[test]
fn romx_sections_in_tiny_mode_fail() {
    let object = obj("SECTION \"X\", ROMX\n\tdb 1\n");
    let mut opts = Options::default();
    opts.layout.tiny = true;
    let result = link::link(vec![object], &opts);
    assert!(matches!(result, Err(LinkError::Errors(_))));
}

#[test]
fn overlapping_fixed_sections_fail() {
    let a = obj("SECTION \"A\", ROM0[$0000]\n\tds 4\n");
    let b = obj("SECTION \"B\", ROM0[$0002]\n\tds 4\n");
    let result = link::link(vec![a, b], &Options::default());
    assert!(matches!(result, Err(LinkError::Errors(_))));
}

#[test]
fn zero_size_sections_may_share_an_address() {
    let a = obj("SECTION \"A\", ROM0[$0000]\n\tds 4\n");
    let b = obj("SECTION \"Marker\", ROM0[$0000]\n");
    let output = link::link(vec![a, b], &Options::default()).expect("link failed");
    assert_eq!(output.sections.len(), 2);
}

#[test]
fn floating_sections_place_biggest_first() {
    let object = obj(
        "SECTION \"Small\", ROM0\n\tds 4, 1\n\
         SECTION \"Big\", ROM0\n\tds 16, 2\n",
    );
    let opts = Options::default();
    let output = link::link(vec![object], &opts).expect("link failed");
    let big = output
        .sections
        .iter()
        .find(|section| section.name == "Big")
        .unwrap();
    let small = output
        .sections
        .iter()
        .find(|section| section.name == "Small")
        .unwrap();
    assert_eq!(big.placed.unwrap().org, 0x0000);
    assert_eq!(small.placed.unwrap().org, 0x0010);
}

#[test]
fn alignment_constraints_are_honored() {
    let object = obj(
        "SECTION \"Pad\", ROM0\n\tds 3\n\
         SECTION \"Aligned\", ROM0, ALIGN[8]\n\tds 8\n",
    );
    let output = link::link(vec![object], &Options::default()).expect("link failed");
    let aligned = output
        .sections
        .iter()
        .find(|section| section.name == "Aligned")
        .unwrap();
    assert_eq!(aligned.placed.unwrap().org & 0xFF, 0);
}

#[test]
fn banked_sections_grow_the_image() {
    let object = obj("SECTION \"Far\", ROMX, BANK[2]\n\tdb 5\n");
    let opts = Options::default();
    let output = link::link(vec![object], &opts).expect("link failed");
    let rom = output.rom_image(&opts).unwrap();
    assert_eq!(rom.len(), 3 * 0x4000);
    assert_eq!(rom[2 * 0x4000], 5);
}

#[test]
fn bank_intrinsics_resolve_at_link_time() {
    let object = obj(
        "SECTION \"Far\", ROMX, BANK[3]\n\
         FarLabel::\n\
         \tdb 1\n\
         SECTION \"Near\", ROM0[$0000]\n\
         \tdb BANK(FarLabel), BANK(\"Far\")\n",
    );
    let opts = Options::default();
    let output = link::link(vec![object], &opts).expect("link failed");
    let rom = output.rom_image(&opts).unwrap();
    assert_eq!(&rom[0..2], &[3, 3]);
}

#[test]
fn failing_link_assertions_are_errors() {
    let object = obj(
        "SECTION \"F\", ROM0\n\
         \tds 4\n\
         L:\n\
         ASSERT L == 0, \"expected the section start\"\n",
    );
    let result = link::link(vec![object], &Options::default());
    assert!(matches!(result, Err(LinkError::Errors(_))));
}

#[test]
fn passing_link_assertions_are_silent() {
    let object = obj(
        "SECTION \"F\", ROM0\n\
         L:\n\
         \tds 4\n\
         ASSERT L % 2 == 0\n",
    );
    assert!(link::link(vec![object], &Options::default()).is_ok());
}

#[test]
fn sym_file_format_and_order() {
    let object = obj(
        "SECTION \"S\", ROM0[$0000]\n\
         Main::\n\
         .inner:\n\
         \tdb 1\n\
         Other:\n\
         \tdb 2\n",
    );
    let opts = Options::default();
    let output = link::link(vec![object], &opts).expect("link failed");
    let mut sym = Vec::new();
    output.write_sym(&mut sym).unwrap();
    let text = String::from_utf8(sym).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "; File generated by gbasm linker");
    // Parent before its own locals at the same address.
    assert_eq!(lines[1], "00:0000 Main");
    assert_eq!(lines[2], "00:0000 Main.inner");
    assert_eq!(lines[3], "00:0001 Other");
}

#[test]
fn map_file_reports_usage_and_gaps() {
    let object = obj("SECTION \"S\", ROM0[$0010]\n\tds 16, 1\n");
    let opts = Options::default();
    let output = link::link(vec![object], &opts).expect("link failed");
    let mut map = Vec::new();
    output.write_map(&mut map, &opts).unwrap();
    let text = String::from_utf8(map).unwrap();
    assert!(text.starts_with("SUMMARY:"));
    assert!(text.contains("ROM0: 16 bytes used"));
    assert!(text.contains("ROM0 bank #0:"));
    assert!(text.contains("SECTION: $0010-$001f"));
    assert!(text.contains("EMPTY: $0000-$000f"));
    assert!(text.contains("TOTAL EMPTY:"));
}

#[test]
fn wram_union_pieces_overlay_across_objects() {
    let a = obj("SECTION UNION \"Shared\", WRAM0\n\tds 4\n");
    let b = obj("SECTION UNION \"Shared\", WRAM0\n\tds 12\n");
    let output = link::link(vec![a, b], &Options::default()).expect("link failed");
    let shared = output
        .sections
        .iter()
        .find(|section| section.name == "Shared")
        .unwrap();
    assert_eq!(shared.size, 12);
}

#[test]
fn linking_is_deterministic() {
    let source = "SECTION \"A\", ROM0\n\tds 4, 1\nSECTION \"B\", ROM0\n\tds 4, 2\n";
    let opts = Options::default();
    let first = link::link(vec![obj(source)], &opts).expect("link failed");
    let second = link::link(vec![obj(source)], &opts).expect("link failed");
    assert_eq!(
        first.rom_image(&opts).unwrap(),
        second.rom_image(&opts).unwrap()
    );
}
