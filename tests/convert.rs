use std::{fs, path::Path};

use pretty_assertions::assert_eq;
use spim2bin::{Converter, DumpError, Endian, FileSink, Segment, DEFAULT_WIDTH};
use tempfile::TempDir;

const DUMP: &str = "\
User Text Segment [00400000]..[00440000]
[00400000] 8fa40000  lw $4, 0($29)                   ; 183: lw $a0 0($sp)
[00400004] 10800002  beq $4, $0, 8 [done-0x00400004]
[00400008] 0810000a  j 0x00400028 [loop]

User data segment [10000000]..[10040000]
[10000000]..[1000000f]  00000000
[10000010] 6c6c6548  6f77206f  0a646c72  00000000
[10000020]..[1003ffff]  00000000

Kernel data segment [90000000]..[90010000]
[90000000] 78452020  6f697470
";

fn words(path: &Path) -> Vec<u32> {
    let bytes = fs::read(path).unwrap();
    assert_eq!(bytes.len() % 4, 0);
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes(chunk.try_into().unwrap()))
        .collect()
}

fn convert(dir: &TempDir, name: &str, dump: &str, endian: Endian) -> Result<FileSink, DumpError> {
    let input = dir.path().join(name);
    fs::write(&input, dump).unwrap();
    let sink = FileSink::new(&input, dir.path(), endian);
    let mut conv = Converter::new(sink, DEFAULT_WIDTH);
    conv.run(fs::read(&input).unwrap().as_slice())?;
    let (sink, _) = conv.finish()?;
    Ok(sink)
}

#[test]
fn writes_one_file_per_section() {
    let dir = tempfile::tempdir().unwrap();
    let sink = convert(&dir, "hello.dump", DUMP, Endian::Native).unwrap();

    let text = sink.path(Segment::Text);
    assert_eq!(text, dir.path().join("hello.text"));
    assert_eq!(
        words(&text),
        vec![0x00400000, 0x8fa40000, 0x10800001, 0x0810000a]
    );

    let data = words(&sink.path(Segment::Data));
    // base, 4 words of padding, 4 words, then 0x3ffe0 bytes of padding
    assert_eq!(data.len(), 1 + 4 + 4 + 0x3ffe0 / 4);
    assert_eq!(data[0], 0x10000000);
    assert_eq!(&data[5..9], &[0x6c6c6548, 0x6f77206f, 0x0a646c72, 0]);
    assert!(data[9..].iter().all(|&word| word == 0));

    assert_eq!(
        words(&sink.path(Segment::KData)),
        vec![0x90000000, 0x78452020, 0x6f697470]
    );
    assert!(!sink.path(Segment::KText).exists());
}

#[test]
fn recurring_section_overwrites_file() {
    let dump = "\
User Text Segment [00400000]..[00440000]
[00400000] 00000001
[00400004] 00000002
[00400008] 00000003
User Text Segment [00500000]..[00540000]
[00500000] 00000004
";
    let dir = tempfile::tempdir().unwrap();
    let sink = convert(&dir, "twice.s", dump, Endian::Native).unwrap();
    assert_eq!(words(&sink.path(Segment::Text)), vec![0x00500000, 4]);
}

#[test]
fn consecutive_headers_write_empty_file() {
    let dump = "\
Kernel Text Segment [80000000]..[80010000]
Kernel data segment [90000000]..[90010000]
[90000000] 00000001
";
    let dir = tempfile::tempdir().unwrap();
    let sink = convert(&dir, "empty.dump", dump, Endian::Native).unwrap();
    assert_eq!(fs::metadata(sink.path(Segment::KText)).unwrap().len(), 0);
    assert_eq!(words(&sink.path(Segment::KData)), vec![0x90000000, 1]);
}

#[test]
fn misaligned_padding_keeps_earlier_sections() {
    let dump = "\
User Text Segment [00400000]..[00440000]
[00400000] 00000001
User data segment [00001000]..[00002000]
[00001000]..[00001002]  00000000
";
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bad.dump");
    let err = convert(&dir, "bad.dump", dump, Endian::Native).unwrap_err();
    assert!(matches!(err, DumpError::Alignment { line: 4, .. }));

    let sink = FileSink::new(&input, dir.path(), Endian::Native);
    assert_eq!(words(&sink.path(Segment::Text)), vec![0x00400000, 1]);
    assert!(!sink.path(Segment::Data).exists());
}

#[test]
fn explicit_byte_order() {
    let dump = "\
User data segment [10000000]..[10040000]
[10000000] 11223344
";
    let dir = tempfile::tempdir().unwrap();
    let sink = convert(&dir, "be.dump", dump, Endian::Big).unwrap();
    assert_eq!(
        fs::read(sink.path(Segment::Data)).unwrap(),
        vec![0x10, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44]
    );
}
