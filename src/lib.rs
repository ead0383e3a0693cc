use std::{
    fmt::{self, Display, Formatter},
    fs::File,
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
    str::{self, FromStr},
};

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Dump lines are cut to this many bytes before they are looked at.
pub const DEFAULT_WIDTH: usize = 55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Text,
    KText,
    Data,
    KData,
}

impl Segment {
    /// Header detection order, first match wins.
    pub const ALL: [Self; 4] = [Self::Text, Self::KText, Self::Data, Self::KData];

    pub fn header(self) -> &'static str {
        match self {
            Self::Text => "User Text Segment",
            Self::KText => "Kernel Text Segment",
            Self::Data => "User data segment",
            Self::KData => "Kernel data segment",
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Text => ".text",
            Self::KText => ".ktext",
            Self::Data => ".data",
            Self::KData => ".kdata",
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, Self::Text | Self::KText)
    }

    pub fn detect(line: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|segment| line.starts_with(segment.header().as_bytes()))
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// A bit field inside a 32-bit machine word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub shift: u32,
    pub width: u32,
}

impl Field {
    pub const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    pub const fn mask(self) -> u32 {
        (u32::MAX >> (32 - self.width)) << self.shift
    }

    pub const fn get(self, word: u32) -> u32 {
        (word & self.mask()) >> self.shift
    }

    pub const fn set(self, word: u32, value: u32) -> u32 {
        (word & !self.mask()) | ((value << self.shift) & self.mask())
    }
}

pub struct RFormat;

impl RFormat {
    pub const OPCODE: Field = Field::new(26, 6);
    pub const RS: Field = Field::new(21, 5);
    pub const RT: Field = Field::new(16, 5);
    pub const RD: Field = Field::new(11, 5);
    pub const SHIFT: Field = Field::new(6, 5);
    pub const FUNCT: Field = Field::new(0, 6);
}

pub struct IFormat;

impl IFormat {
    pub const OPCODE: Field = Field::new(26, 6);
    pub const RS: Field = Field::new(21, 5);
    pub const RT: Field = Field::new(16, 5);
    pub const IMM: Field = Field::new(0, 16);
}

pub struct JFormat;

impl JFormat {
    pub const OPCODE: Field = Field::new(26, 6);
    pub const ADDR: Field = Field::new(0, 26);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const SPECIAL: Self = Self(0x00);
    pub const J: Self = Self(0x02);
    pub const JAL: Self = Self(0x03);
    pub const BEQ: Self = Self(0x04);
    pub const BNE: Self = Self(0x05);
    pub const BLEZ: Self = Self(0x06);
    pub const BGTZ: Self = Self(0x07);

    /// PC-relative conditional branches.
    pub fn is_branch(self) -> bool {
        (Self::BEQ.0..=Self::BGTZ.0).contains(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    R,
    I,
    J,
}

/// A machine word. The layout it is read through depends only on its opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inst(pub u32);

impl Inst {
    pub fn opcode(self) -> Opcode {
        Opcode(IFormat::OPCODE.get(self.0) as u8)
    }

    pub fn format(self) -> Format {
        match self.opcode() {
            Opcode::SPECIAL => Format::R,
            Opcode::J | Opcode::JAL => Format::J,
            _ => Format::I,
        }
    }

    pub fn imm(self) -> i16 {
        IFormat::IMM.get(self.0) as u16 as i16
    }

    pub fn with_imm(self, imm: i16) -> Self {
        Self(IFormat::IMM.set(self.0, imm as u16 as u32))
    }

    /// SPIM encodes branch offsets from the branch itself rather than from
    /// `PC + 4`, so pull them back by one instruction.
    pub fn correct_branch(self) -> Self {
        if self.opcode().is_branch() {
            self.with_imm(self.imm().wrapping_sub(1))
        } else {
            self
        }
    }
}

impl Display for Inst {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let word = self.0;
        match self.format() {
            Format::R => write!(
                f,
                "r(op={:02X} rs={} rt={} rd={} shift={} funct={:02X})",
                RFormat::OPCODE.get(word),
                RFormat::RS.get(word),
                RFormat::RT.get(word),
                RFormat::RD.get(word),
                RFormat::SHIFT.get(word),
                RFormat::FUNCT.get(word)
            ),
            Format::I => write!(
                f,
                "i(op={:02X} rs={} rt={} imm={})",
                IFormat::OPCODE.get(word),
                IFormat::RS.get(word),
                IFormat::RT.get(word),
                self.imm()
            ),
            Format::J => write!(
                f,
                "j(op={:02X} addr=${:07X})",
                JFormat::OPCODE.get(word),
                JFormat::ADDR.get(word)
            ),
        }
    }
}

/// Forward-only reader over a single dump line.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(line: &'a [u8]) -> Self {
        Self { line, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.line.len());
    }

    fn skip_blanks(&mut self) {
        while let Some(c) = self.line.get(self.pos) {
            if !b" \t".contains(c) {
                break;
            }
            self.pos += 1;
        }
    }

    /// Next non-blank byte, without consuming it.
    pub fn peek(&mut self) -> Option<u8> {
        self.skip_blanks();
        self.line.get(self.pos).copied()
    }

    /// Moves to just past the next `byte`. Leaves the cursor alone if there is none.
    pub fn skip_past(&mut self, byte: u8) -> Option<()> {
        let offset = self.line[self.pos..].iter().position(|&c| c == byte)?;
        self.pos += offset + 1;
        Some(())
    }

    /// Reads a hex number with an optional `0x` prefix. Nothing is consumed on failure.
    pub fn read_hex(&mut self) -> Option<u32> {
        self.skip_blanks();
        let rest = &self.line[self.pos..];
        let prefixed = rest.len() > 2
            && rest[0] == b'0'
            && matches!(rest[1], b'x' | b'X')
            && rest[2].is_ascii_hexdigit();
        let start = if prefixed { 2 } else { 0 };
        let len = rest[start..]
            .iter()
            .take_while(|c| c.is_ascii_hexdigit())
            .count();
        if len == 0 {
            return None;
        }
        let digits = str::from_utf8(&rest[start..start + len]).ok()?;
        let value = u32::from_str_radix(digits, 16).ok()?;
        self.pos += start + len;
        Some(value)
    }
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("line {line}, column {column}: expected {expected}")]
    Parse {
        line: usize,
        column: usize,
        expected: &'static str,
    },

    #[error("line {line}: padding ${start:08X}..${end:08X} in section {segment} is not aligned to 4 bytes")]
    Alignment {
        line: usize,
        segment: Segment,
        start: u32,
        end: u32,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Native,
    Little,
    Big,
}

impl Endian {
    pub fn bytes(self, word: u32) -> [u8; 4] {
        match self {
            Self::Native => word.to_ne_bytes(),
            Self::Little => word.to_le_bytes(),
            Self::Big => word.to_be_bytes(),
        }
    }
}

impl FromStr for Endian {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "little" => Ok(Self::Little),
            "big" => Ok(Self::Big),
            _ => Err(format!("{s} is not one of `native`, `little`, or `big`")),
        }
    }
}

impl Display for Endian {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Little => write!(f, "little"),
            Self::Big => write!(f, "big"),
        }
    }
}

fn default_width() -> usize {
    DEFAULT_WIDTH
}

fn default_out_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_width")]
    pub width: usize,

    #[serde(default)]
    pub endian: Endian,

    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            width: default_width(),
            endian: Endian::default(),
            out_dir: default_out_dir(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Receives every finished segment.
pub trait Sink {
    fn emit(&mut self, segment: Segment, words: &[u32]) -> io::Result<()>;
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn emit(&mut self, segment: Segment, words: &[u32]) -> io::Result<()> {
        (**self).emit(segment, words)
    }
}

/// Writes each segment to `<dir>/<stem><suffix>`, replacing whatever was there.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
    stem: String,
    endian: Endian,
}

impl FileSink {
    pub fn new(input: &Path, dir: impl Into<PathBuf>, endian: Endian) -> Self {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            dir: dir.into(),
            stem,
            endian,
        }
    }

    pub fn path(&self, segment: Segment) -> PathBuf {
        self.dir.join(format!("{}{}", self.stem, segment.suffix()))
    }
}

impl Sink for FileSink {
    fn emit(&mut self, segment: Segment, words: &[u32]) -> io::Result<()> {
        let path = self.path(segment);
        let mut output = BufWriter::new(
            File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        );
        for word in words {
            output.write_all(&self.endian.bytes(*word))?;
        }
        output.flush()?;
        tracing::info!(
            "creating file {} with a size of ${:X}",
            path.display(),
            words.len()
        );
        Ok(())
    }
}

/// Word count of the last flush of each segment, in first-flush order.
pub type Report = IndexMap<Segment, usize>;

pub struct Converter<S> {
    sink: S,
    width: usize,
    segment: Option<Segment>,
    need_addr: bool,
    words: Vec<u32>,
    report: Report,
    line: usize,
}

impl<S: Sink> Converter<S> {
    pub fn new(sink: S, width: usize) -> Self {
        Self {
            sink,
            width,
            segment: None,
            need_addr: false,
            words: Vec::new(),
            report: Report::new(),
            line: 0,
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn run<R: BufRead>(&mut self, reader: R) -> Result<(), DumpError> {
        for line in reader.split(b'\n') {
            self.feed(&line?)?;
        }
        Ok(())
    }

    pub fn feed(&mut self, line: &[u8]) -> Result<(), DumpError> {
        self.line += 1;
        let line = line.trim_ascii_end();
        let line = &line[..line.len().min(self.width)];
        if line.is_empty() {
            return Ok(());
        }
        if line[0] == b'[' {
            if let Some(segment) = self.segment {
                return self.continuation(segment, line);
            }
            tracing::trace!("line {}: no active section, skipping", self.line);
            return Ok(());
        }
        if let Some(segment) = Segment::detect(line) {
            self.flush()?;
            tracing::trace!("line {}: starting section {segment}", self.line);
            self.segment = Some(segment);
            self.need_addr = true;
        }
        Ok(())
    }

    /// Hands the active segment to the sink. Does nothing without one.
    pub fn flush(&mut self) -> Result<(), DumpError> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        self.sink.emit(segment, &self.words)?;
        self.report.insert(segment, self.words.len());
        self.words.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<(S, Report), DumpError> {
        self.flush()?;
        Ok((self.sink, self.report))
    }

    fn expected(&self, cursor: &Cursor<'_>, expected: &'static str) -> DumpError {
        DumpError::Parse {
            line: self.line,
            column: cursor.pos() + 1,
            expected,
        }
    }

    fn hex(&self, cursor: &mut Cursor<'_>, expected: &'static str) -> Result<u32, DumpError> {
        cursor.read_hex().ok_or_else(|| self.expected(cursor, expected))
    }

    fn continuation(&mut self, segment: Segment, line: &[u8]) -> Result<(), DumpError> {
        let mut cursor = Cursor::new(line);
        if self.need_addr {
            cursor.seek(1);
            let addr = self.hex(&mut cursor, "section address")?;
            self.words.push(addr);
            self.need_addr = false;
            tracing::debug!(
                "{segment} has address ${addr:08X} ({})",
                self.words.len()
            );
        }

        cursor.seek(0);
        cursor
            .skip_past(b']')
            .ok_or_else(|| self.expected(&cursor, "`]`"))?;

        if segment.is_text() {
            let inst = Inst(self.hex(&mut cursor, "instruction word")?);
            let corrected = inst.correct_branch();
            if corrected != inst {
                tracing::trace!("line {}: branch {inst} -> {corrected}", self.line);
            }
            self.words.push(corrected.0);
            return Ok(());
        }

        if cursor.peek() == Some(b'.') {
            return self.padding(segment, &mut cursor);
        }
        for _ in 0..4 {
            match cursor.read_hex() {
                Some(word) => self.words.push(word),
                None => break,
            }
        }
        Ok(())
    }

    // [start]..[end] fill
    fn padding(&mut self, segment: Segment, cursor: &mut Cursor<'_>) -> Result<(), DumpError> {
        cursor
            .skip_past(b'[')
            .ok_or_else(|| self.expected(cursor, "`[` before padding end"))?;
        let end = self.hex(cursor, "padding end address")?;
        cursor
            .skip_past(b']')
            .ok_or_else(|| self.expected(cursor, "`]` after padding end"))?;
        let fill = self.hex(cursor, "padding fill word")?;
        cursor.seek(1);
        let start = self.hex(cursor, "padding start address")?;

        let span = end.wrapping_sub(start).wrapping_add(1);
        if span % 4 != 0 {
            return Err(DumpError::Alignment {
                line: self.line,
                segment,
                start,
                end,
            });
        }
        let count = (span / 4) as usize;
        tracing::trace!(
            "line {}: padding {count} words of ${fill:08X} from ${start:08X}",
            self.line
        );
        self.words.resize(self.words.len() + count, fill);
        Ok(())
    }
}
