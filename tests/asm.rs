//! Assembly scenarios: source in, object bytes out.

use gbasm::asm::{self, Options};
use gbasm::obj::{self, Object, Visibility};
use gbasm::{SectionKind, SectionModifier};

fn assemble(source: &str) -> Object {
    asm::assemble_str("test.asm", source, &Options::default())
        .expect("assembly failed")
        .object
}

fn assemble_with(source: &str, opts: &Options) -> Object {
    asm::assemble_str("test.asm", source, opts)
        .expect("assembly failed")
        .object
}

fn rom_data(object: &Object, name: &str) -> Vec<u8> {
    object
        .sections
        .iter()
        .find(|section| section.name == name)
        .unwrap_or_else(|| panic!("no section named {}", name))
        .data
        .clone()
}

#[test]
fn constants_fold_at_assembly_time() {
    let object = assemble(
        "DEF N EQU 3\n\
         SECTION \"Test\", ROM0[$0000]\n\
         \tDB N+1, N*N, HIGH($1234), LOW($1234)\n",
    );
    assert_eq!(rom_data(&object, "Test"), [0x04, 0x09, 0x12, 0x34]);
    assert!(object.sections[0].patches.is_empty());
}

#[test]
fn rept_unique_ids_are_distinct_and_ordered() {
    let object = assemble(
        "SECTION \"R\", ROM0\n\
         REPT 3\n\
         \tDB \\@\n\
         ENDR\n",
    );
    let data = rom_data(&object, "R");
    assert_eq!(data.len(), 3);
    assert!(data[0] < data[1] && data[1] < data[2]);
}

#[test]
fn for_loop_binds_its_variable() {
    let object = assemble(
        "SECTION \"F\", ROM0\n\
         FOR I, 3\n\
         \tDB I\n\
         ENDR\n\
         FOR J, 6, 0, -2\n\
         \tDB J\n\
         ENDR\n",
    );
    assert_eq!(rom_data(&object, "F"), [0, 1, 2, 6, 4, 2]);
}

#[test]
fn for_loop_break() {
    let object = assemble(
        "SECTION \"B\", ROM0\n\
         FOR I, 10\n\
         \tIF I == 2\n\
         \t\tBREAK\n\
         \tENDC\n\
         \tDB I\n\
         ENDR\n\
         \tDB $99\n",
    );
    assert_eq!(rom_data(&object, "B"), [0, 1, 0x99]);
}

#[test]
fn macro_args_shift_and_narg() {
    let object = assemble(
        "MACRO pair\n\
         \tDB \\1 + \\2, _NARG\n\
         \tSHIFT\n\
         \tDB \\1\n\
         ENDM\n\
         SECTION \"M\", ROM0\n\
         \tpair 2, 3\n",
    );
    assert_eq!(rom_data(&object, "M"), [5, 2, 3]);
}

#[test]
fn nested_macro_invocations_share_the_body() {
    let object = assemble(
        "MACRO countdown\n\
         \tDB \\1\n\
         \tIF \\1 > 1\n\
         \t\tcountdown \\1 - 1\n\
         \tENDC\n\
         ENDM\n\
         SECTION \"N\", ROM0\n\
         \tcountdown 3\n",
    );
    assert_eq!(rom_data(&object, "N"), [3, 2, 1]);
}

#[test]
fn conditional_branches_pick_one_arm() {
    let source = |mode: u32| {
        format!(
            "DEF MODE EQU {}\n\
             SECTION \"C\", ROM0\n\
             IF MODE == 1\n\
             \tDB 1\n\
             ELIF MODE == 2\n\
             \tDB 2\n\
             ELSE\n\
             \tDB 3\n\
             ENDC\n",
            mode
        )
    };
    assert_eq!(rom_data(&assemble(&source(1)), "C"), [1]);
    assert_eq!(rom_data(&assemble(&source(2)), "C"), [2]);
    assert_eq!(rom_data(&assemble(&source(7)), "C"), [3]);
}

#[test]
fn skipped_branches_are_not_evaluated() {
    // The undefined symbol and bad directive never run.
    let object = assemble(
        "SECTION \"S\", ROM0\n\
         IF 0\n\
         \tDB UNDEFINED_THING\n\
         \tPURGE @\n\
         ELSE\n\
         \tDB 7\n\
         ENDC\n",
    );
    assert_eq!(rom_data(&object, "S"), [7]);
}

#[test]
fn equs_expands_at_the_lexer_level() {
    let object = assemble(
        "DEF emit EQUS \"DB 1, 2\"\n\
         SECTION \"E\", ROM0\n\
         \temit\n",
    );
    assert_eq!(rom_data(&object, "E"), [1, 2]);
}

#[test]
fn interpolation_splices_values() {
    let object = assemble(
        "DEF V EQU 5\n\
         DEF NAME EQUS \"V\"\n\
         SECTION \"I\", ROM0\n\
         \tDB {V}, {NAME}\n",
    );
    assert_eq!(rom_data(&object, "I"), [5, 5]);
}

#[test]
fn number_literal_classes() {
    let object = assemble(
        "SECTION \"N\", ROM0\n\
         \tDB %1010, $FF & 15, &17, 2 ** 3\n\
         \tDW `01230123\n",
    );
    assert_eq!(rom_data(&object, "N"), [10, 15, 15, 8, 0x55, 0x33]);
}

#[test]
fn fixed_point_literals_and_intrinsics() {
    let object = assemble(
        "SECTION \"Q\", ROM0\n\
         \tDL FMUL(2.5, 2.0)\n\
         \tDL SIN(0.25)\n",
    );
    assert_eq!(
        rom_data(&object, "Q"),
        [0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x01, 0x00]
    );
}

#[test]
fn string_functions_fold() {
    let object = assemble(
        "SECTION \"S\", ROM0\n\
         \tDB STRLEN(\"abc\"), STRIN(\"hello\", \"llo\")\n\
         \tDB STRSUB(\"hello\", 2, 3)\n\
         \tDB STRUPR(\"a\")\n",
    );
    assert_eq!(rom_data(&object, "S"), [3, 3, b'e', b'l', b'l', b'A']);
}

#[test]
fn charmap_encodes_db_strings() {
    let object = assemble(
        "CHARMAP \"A\", 1\n\
         CHARMAP \"AB\", 2\n\
         CHARMAP \"B\", 3\n\
         SECTION \"C\", ROM0\n\
         \tDB \"ABA\"\n",
    );
    assert_eq!(rom_data(&object, "C"), [2, 1]);
}

#[test]
fn anonymous_and_local_labels_resolve() {
    let object = assemble(
        "SECTION \"L\", ROM0[$0000]\n\
         Main:\n\
         .first:\n\
         \tDB 1\n\
         :\n\
         \tDB Main.first, :-\n",
    );
    // `.first` is at 0, the anonymous label at 1.
    assert_eq!(rom_data(&object, "L"), [1, 0, 1]);
}

#[test]
fn rs_counter_allocates_offsets() {
    let object = assemble(
        "RSRESET\n\
         DEF fieldA RB 2\n\
         DEF fieldB RW 1\n\
         DEF fieldC RL\n\
         SECTION \"R\", ROM0\n\
         \tDB fieldA, fieldB, fieldC, _RS\n",
    );
    assert_eq!(rom_data(&object, "R"), [0, 2, 4, 8]);
}

#[test]
fn union_blocks_overlay_arms() {
    let object = assemble(
        "SECTION \"U\", WRAM0\n\
         UNION\n\
         \tDS 4\n\
         NEXTU\n\
         \tDS 10\n\
         ENDU\n\
         \tDS 1\n",
    );
    let section = &object.sections[0];
    assert_eq!(section.size, 11);
    assert_eq!(section.kind, SectionKind::Wram0);
}

#[test]
fn load_blocks_emit_into_the_rom_section() {
    let object = assemble(
        "SECTION \"Code\", ROM0[$0000]\n\
         \tDB $AA\n\
         LOAD \"Ram\", WRAM0\n\
         Buffer:\n\
         \tDB 1, 2\n\
         ENDL\n",
    );
    assert_eq!(rom_data(&object, "Code"), [0xAA, 1, 2]);
    let ram = object
        .sections
        .iter()
        .find(|section| section.name == "Ram")
        .unwrap();
    assert_eq!(ram.size, 2);
    // Buffer belongs to the RAM section, at its start.
    let buffer = object
        .symbols
        .iter()
        .find(|symbol| symbol.name == "Buffer")
        .unwrap();
    let def = buffer.visibility.def().unwrap();
    assert_eq!(def.section, 1);
    assert_eq!(def.value, 0);
}

#[test]
fn pushs_pops_and_option_stack() {
    let object = assemble(
        "SECTION \"A\", ROM0\n\
         \tDB 1\n\
         PUSHS\n\
         SECTION \"B\", ROM0\n\
         \tDB 2\n\
         POPS\n\
         \tDB 3\n\
         PUSHO\n\
         OPT p$41\n\
         \tDS 2\n\
         POPO\n\
         \tDS 1\n",
    );
    assert_eq!(rom_data(&object, "A"), [1, 3, 0x41, 0x41, 0]);
    assert_eq!(rom_data(&object, "B"), [2]);
}

#[test]
fn load_optimization_rewrites_high_page_loads() {
    let source = "SECTION \"O\", ROM0\n\tld a, [$FF80]\n\tld [$FF81], a\n";
    let mut opts = Options::default();
    opts.optimize_loads = true;
    let optimized = assemble_with(source, &opts);
    assert_eq!(rom_data(&optimized, "O"), [0xF0, 0x80, 0xE0, 0x81]);
    let plain = assemble(source);
    assert_eq!(
        rom_data(&plain, "O"),
        [0xFA, 0x80, 0xFF, 0xEA, 0x81, 0xFF]
    );
}

#[test]
fn instruction_encodings() {
    let object = assemble(
        "SECTION \"I\", ROM0\n\
         \tnop\n\
         \tld b, c\n\
         \tld [hl], a\n\
         \tld a, [hl+]\n\
         \tld hl, $8000\n\
         \tld hl, sp+3\n\
         \tadd hl, de\n\
         \tinc hl\n\
         \tdec c\n\
         \txor a\n\
         \tcp $90\n\
         \tbit 7, [hl]\n\
         \tswap a\n\
         \trst $18\n\
         \tjp nz, $1234\n\
         \tcall $0150\n\
         \tpush af\n\
         \tpop bc\n\
         \tldh a, [$FF44]\n\
         \treti\n",
    );
    assert_eq!(
        rom_data(&object, "I"),
        [
            0x00, // nop
            0x41, // ld b, c
            0x77, // ld [hl], a
            0x2A, // ld a, [hl+]
            0x21, 0x00, 0x80, // ld hl, $8000
            0xF8, 0x03, // ld hl, sp+3
            0x19, // add hl, de
            0x23, // inc hl
            0x0D, // dec c
            0xAF, // xor a
            0xFE, 0x90, // cp $90
            0xCB, 0x7E, // bit 7, [hl]
            0xCB, 0x37, // swap a
            0xDF, // rst $18
            0xC2, 0x34, 0x12, // jp nz, $1234
            0xCD, 0x50, 0x01, // call $0150
            0xF5, // push af
            0xC1, // pop bc
            0xF0, 0x44, // ldh a, [$FF44]
            0xD9, // reti
        ]
    );
}

#[test]
fn forward_references_become_patches() {
    let object = assemble(
        "SECTION \"P\", ROM0\n\
         \tdw Later\n\
         \tjr Later\n\
         Later:\n",
    );
    let section = &object.sections[0];
    assert_eq!(section.patches.len(), 2);
    assert_eq!(section.patches[0].offset, 0);
    assert_eq!(section.patches[1].offset, 3);
    // Both bytes are zero until the linker runs.
    assert_eq!(section.data, [0, 0, 0x18, 0]);
}

#[test]
fn exports_and_imports_in_the_object() {
    let object = assemble(
        "SECTION \"X\", ROM0[$0100]\n\
         Entry::\n\
         \tdw External\n",
    );
    let entry = object
        .symbols
        .iter()
        .find(|symbol| symbol.name == "Entry")
        .unwrap();
    assert!(matches!(entry.visibility, Visibility::Export(_)));
    let external = object
        .symbols
        .iter()
        .find(|symbol| symbol.name == "External")
        .unwrap();
    assert!(matches!(external.visibility, Visibility::Import));
}

#[test]
fn purge_removes_and_frees_the_name() {
    let object = assemble(
        "DEF X EQU 1\n\
         PURGE X\n\
         DEF X EQU 2\n\
         SECTION \"P\", ROM0\n\
         \tDB X\n",
    );
    assert_eq!(rom_data(&object, "P"), [2]);
}

#[test]
fn purge_of_builtins_is_an_error() {
    let result = asm::assemble_str("t.asm", "PURGE _RS\n", &Options::default());
    assert!(matches!(result, Err(asm::BuildError::Errors(_))));
}

#[test]
fn equ_redefinition_is_an_error() {
    let result = asm::assemble_str(
        "t.asm",
        "DEF N EQU 1\nDEF N EQU 2\n",
        &Options::default(),
    );
    assert!(matches!(result, Err(asm::BuildError::Errors(_))));
}

#[test]
fn variables_reassign_and_redef_rewrites_strings() {
    let object = assemble(
        "DEF V = 1\n\
         DEF V = V + 1\n\
         DEF S EQUS \"1\"\n\
         REDEF S EQUS \"9\"\n\
         SECTION \"V\", ROM0\n\
         \tDB V, S\n",
    );
    assert_eq!(rom_data(&object, "V"), [2, 9]);
}

#[test]
fn fragment_sections_append_within_one_unit() {
    let object = assemble(
        "SECTION FRAGMENT \"F\", ROM0\n\
         \tDB 1\n\
         SECTION FRAGMENT \"F\", ROM0\n\
         \tDB 2\n",
    );
    assert_eq!(object.sections.len(), 1);
    assert_eq!(object.sections[0].modifier, SectionModifier::Fragment);
    assert_eq!(rom_data(&object, "F"), [1, 2]);
}

#[test]
fn alignment_inside_fixed_sections_pads() {
    let object = assemble(
        "SECTION \"A\", ROM0[$0000]\n\
         \tDB 1\n\
         ALIGN 4\n\
         \tDB 2\n",
    );
    let data = rom_data(&object, "A");
    assert_eq!(data.len(), 17);
    assert_eq!(data[0], 1);
    assert_eq!(data[16], 2);
    assert!(data[1..16].iter().all(|&byte| byte == 0));
}

#[test]
fn alignment_of_floating_sections_becomes_a_constraint() {
    let object = assemble(
        "SECTION \"A\", ROM0\n\
         \tDB 1\n\
         ALIGN 8\n\
         \tDB 2\n",
    );
    let section = &object.sections[0];
    assert_eq!(section.align_log2, 8);
    // One byte emitted so far, so the section must start at $xxFF.
    assert_eq!(section.align_ofs, 0xFF);
    assert_eq!(section.size, 2);
}

#[test]
fn non_constant_assertions_are_deferred() {
    let object = assemble(
        "SECTION \"A\", ROM0\n\
         Lbl:\n\
         ASSERT Lbl >= 0, \"must not be negative\"\n",
    );
    assert_eq!(object.assertions.len(), 1);
    assert_eq!(object.assertions[0].message, "must not be negative");
}

#[test]
fn failed_constant_assertions_are_errors() {
    let result = asm::assemble_str("t.asm", "STATIC_ASSERT 1 == 2\n", &Options::default());
    assert!(matches!(result, Err(asm::BuildError::Errors(_))));
}

#[test]
fn include_depth_is_bounded() {
    let mut opts = Options::default();
    opts.max_depth = 4;
    let result = asm::assemble_str(
        "t.asm",
        "MACRO forever\n\tforever\nENDM\n\tforever\n",
        &opts,
    );
    assert!(matches!(result, Err(asm::BuildError::Fatal(_))));
}

#[test]
fn node_table_tracks_contexts() {
    let object = assemble(
        "MACRO inner\n\
         \tDB 1\n\
         ENDM\n\
         SECTION \"N\", ROM0\n\
         REPT 2\n\
         \tinner\n\
         ENDR\n",
    );
    let files = object
        .nodes
        .iter()
        .filter(|node| matches!(node.kind, obj::NodeKind::File(_)))
        .count();
    let macros = object
        .nodes
        .iter()
        .filter(|node| matches!(node.kind, obj::NodeKind::Macro(_)))
        .count();
    let repts = object
        .nodes
        .iter()
        .filter(|node| matches!(node.kind, obj::NodeKind::Rept(_)))
        .count();
    assert_eq!(files, 1);
    assert_eq!(macros, 2);
    assert_eq!(repts, 2);
}
