//! Object-module round trips: what the writer emits, the reader returns.

use gbasm::asm::{self, Options as AsmOptions};
use gbasm::link::{self, Options as LinkOptions};
use gbasm::obj::{self, Object};
use gbasm::{read, write};

fn obj(source: &str) -> Object {
    asm::assemble_str("test.asm", source, &AsmOptions::default())
        .expect("assembly failed")
        .object
}

fn round_trip(object: &Object) -> Object {
    let mut bytes = Vec::new();
    write::write_object(&mut bytes, object).unwrap();
    read::parse(&bytes).expect("reading back failed")
}

#[test]
fn symbols_survive_a_round_trip() {
    let object = obj(
        "DEF CONSTANT EQU $1234\n\
         SECTION \"S\", ROM0[$0000]\n\
         Exported::\n\
         Internal:\n\
         .local:\n\
         \tdw ImportedElsewhere\n",
    );
    let reread = round_trip(&object);
    assert_eq!(reread.symbols, object.symbols);
    assert_eq!(reread.nodes, object.nodes);
}

#[test]
fn sections_and_patches_survive_a_round_trip() {
    let object = obj(
        "SECTION \"Code\", ROMX, BANK[4], ALIGN[4]\n\
         Begin:\n\
         \tdw After\n\
         \tjr Begin\n\
         After:\n\
         \tdb BANK(@)\n\
         SECTION \"Vars\", WRAM0, ALIGN[2]\n\
         \tds 8\n",
    );
    let reread = round_trip(&object);
    assert_eq!(reread, object);
}

#[test]
fn assertions_survive_a_round_trip() {
    let object = obj(
        "SECTION \"S\", ROM0\n\
         L:\n\
         ASSERT WARN, L >= 0, \"suspicious placement\"\n\
         ASSERT L < $4000\n",
    );
    let reread = round_trip(&object);
    assert_eq!(reread.assertions, object.assertions);
}

#[test]
fn reread_objects_link_to_identical_roms() {
    let source = "SECTION \"S\", ROM0\n\
                  Start:\n\
                  \tjr Start\n\
                  \tdw Start\n\
                  \tdb SIZEOF(\"S\")\n";
    let original = obj(source);
    let reread = round_trip(&original);
    let opts = LinkOptions::default();
    let rom_a = link::link(vec![original], &opts)
        .unwrap()
        .rom_image(&opts)
        .unwrap();
    let rom_b = link::link(vec![reread], &opts)
        .unwrap()
        .rom_image(&opts)
        .unwrap();
    assert_eq!(rom_a, rom_b);
}

#[test]
fn bad_magic_is_rejected() {
    assert!(read::parse(b"NOPE\x09\x00\x00\x00").is_err());
}

#[test]
fn version_mismatch_is_rejected() {
    let object = obj("SECTION \"S\", ROM0\n\tdb 1\n");
    let mut bytes = Vec::new();
    write::write_object(&mut bytes, &object).unwrap();
    bytes[4] = obj::VERSION as u8 + 1;
    assert!(read::parse(&bytes).is_err());
}

#[test]
fn truncated_objects_are_rejected() {
    let object = obj("SECTION \"S\", ROM0\n\tdb 1\n");
    let mut bytes = Vec::new();
    write::write_object(&mut bytes, &object).unwrap();
    for len in [3, 8, 12, bytes.len() - 1] {
        assert!(read::parse(&bytes[..len]).is_err(), "accepted {} bytes", len);
    }
}

#[test]
fn trailing_garbage_is_rejected() {
    let object = obj("SECTION \"S\", ROM0\n\tdb 1\n");
    let mut bytes = Vec::new();
    write::write_object(&mut bytes, &object).unwrap();
    bytes.push(0);
    assert!(read::parse(&bytes).is_err());
}

#[test]
fn charmap_identity_preserves_utf8() {
    // With no charmap entries, encoding is the UTF-8 byte sequence.
    let object = obj("SECTION \"S\", ROM0\n\tdb \"héllo\"\n");
    assert_eq!(object.sections[0].data, "héllo".as_bytes());
}
