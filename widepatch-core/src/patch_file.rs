use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::{Result, WidepatchError};

const BLANK: &[char] = &[' ', '\t'];
const ROOT_POS_TAG: &str = "[rootPos: ";

/// Virtual address the reference build is loaded at; listing addresses are
/// relative to it.
pub const LISTING_IMAGE_BASE: i32 = 0x0040_0000;

/// How the four bytes at a record's position encode a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Literal horizontal value.
    H,
    /// Literal vertical value.
    V,
    /// Horizontal value folded into some other constant.
    DeltaH,
    /// Vertical value folded into some other constant.
    DeltaV,
    /// Literal value used for both axes; the axis is picked per run.
    HV,
}

impl PatchKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "H" => Some(Self::H),
            "V" => Some(Self::V),
            "dH" => Some(Self::DeltaH),
            "dV" => Some(Self::DeltaV),
            "HV" => Some(Self::HV),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::H => "H",
            Self::V => "V",
            Self::DeltaH => "dH",
            Self::DeltaV => "dV",
            Self::HV => "HV",
        }
    }

    pub fn is_delta(self) -> bool {
        matches!(self, Self::DeltaH | Self::DeltaV)
    }
}

/// One positional edit against the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// Byte offset in the binary. Negative means relocation failed and the
    /// record must not be applied.
    pub position: i32,
    pub reference_value: i32,
    pub kind: PatchKind,
    /// Expected current value for delta kinds; 0 means unchecked.
    pub parameter: i32,
    pub comment: String,
    /// Offset of the record in the build it was derived from.
    pub original_position: i32,
    /// Disassembly line the record was annotated with, if any.
    pub asm: Option<String>,
}

impl PatchRecord {
    pub fn is_resolved(&self) -> bool {
        self.position >= 0
    }
}

/// Parsed patch file: the binary it targets plus its edit records, in file
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchFile {
    pub expected_file_size: u64,
    pub expected_md5: String,
    pub version: String,
    pub archive_ref_position: i32,
    /// 0 when the binary only carries a single archive reference.
    pub archive_ref_position_secondary: i32,
    pub records: Vec<PatchRecord>,
}

impl PatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        Self::parse(&String::from_utf8_lossy(&raw))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::locate::write_file(path, self.to_text().as_bytes())
    }

    /// True when the patch was derived for exactly this binary image.
    pub fn matches_image(&self, size: u64, md5: &str) -> bool {
        self.expected_file_size == size && self.expected_md5.eq_ignore_ascii_case(md5)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut patch = PatchFile::default();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim_end_matches('\r');

            if let Some(v) = line.strip_prefix("size=") {
                patch.expected_file_size = v.trim().parse().map_err(|_| {
                    syntax(line_no, format!("invalid file size '{}'", v.trim()))
                })?;
                continue;
            }
            if let Some(v) = line.strip_prefix("md5=") {
                patch.expected_md5 = v.trim().to_ascii_lowercase();
                continue;
            }
            if let Some(v) = line.strip_prefix("version=") {
                patch.version = v.trim().to_string();
                continue;
            }
            if let Some(v) = line.strip_prefix("drspos2=") {
                patch.archive_ref_position_secondary = parse_offset(line_no, v.trim())?;
                continue;
            }
            if let Some(v) = line.strip_prefix("drspos=") {
                patch.archive_ref_position = parse_offset(line_no, v.trim())?;
                continue;
            }

            if line.starts_with('[') || line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            if let Some(record) = parse_record(line_no, line)? {
                patch.records.push(record);
            }
        }

        Ok(patch)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("[header]\n");
        out.push_str(&format!("size={}\n", self.expected_file_size));
        out.push_str(&format!("md5={}\n", self.expected_md5));
        out.push_str(&format!("version={}\n", self.version));
        out.push_str(&format!(
            "drspos={}\n",
            format_offset(self.archive_ref_position)
        ));
        if self.archive_ref_position_secondary != 0 {
            out.push_str(&format!(
                "drspos2={}\n",
                format_offset(self.archive_ref_position_secondary)
            ));
        }
        out.push_str("[data]\n");
        for record in &self.records {
            out.push_str(&format_record(record));
            out.push('\n');
        }
        out
    }
}

fn syntax(line: usize, reason: String) -> WidepatchError {
    WidepatchError::PatchSyntax { line, reason }
}

fn parse_hex(line: usize, token: &str) -> Result<i32> {
    i32::from_str_radix(token, 16)
        .map_err(|_| syntax(line, format!("invalid hexadecimal offset '{token}'")))
}

/// Hex offset, or `!!!` followed by the hex root offset for one that could
/// not be relocated.
fn parse_offset(line: usize, token: &str) -> Result<i32> {
    match token.strip_prefix("!!!") {
        Some(unresolved) => Ok(-parse_hex(line, unresolved)?),
        None => parse_hex(line, token),
    }
}

fn format_offset(position: i32) -> String {
    if position >= 0 {
        format!("{position:08X}")
    } else {
        format!("!!!{:08X}", position.unsigned_abs())
    }
}

/// Splits a trailing `[rootPos: XXXXXXXX, offset N]` off a comment.
fn split_root_pos(comment: &str) -> (&str, Option<i32>) {
    let Some(at) = comment.rfind(ROOT_POS_TAG) else {
        return (comment, None);
    };
    let hex = comment[at + ROOT_POS_TAG.len()..]
        .split(|c: char| c == ',' || c == ']')
        .next()
        .unwrap_or_default()
        .trim();
    match i32::from_str_radix(hex, 16) {
        Ok(root) => (comment[..at].trim_end(), Some(root)),
        Err(_) => (comment, None),
    }
}

/// Splits on runs of blanks into at most `max` fields; the last field keeps
/// the remainder of the line verbatim.
fn split_fields(line: &str, max: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(max);
    let mut rest = line.trim_start_matches(BLANK);
    while !rest.is_empty() {
        if fields.len() + 1 == max {
            fields.push(rest);
            break;
        }
        match rest.find(BLANK) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start_matches(BLANK);
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }
    fields
}

fn parse_record(line_no: usize, line: &str) -> Result<Option<PatchRecord>> {
    let (body, asm) = match line.split_once('|') {
        Some((body, asm)) => {
            let asm = asm.trim();
            (body, (!asm.is_empty()).then(|| asm.to_string()))
        }
        None => (line, None),
    };

    let words = split_fields(body, 4);
    if words.len() < 3 {
        log::trace!("line {line_no}: no patch kind, skipped");
        return Ok(None);
    }

    let Some(kind) = PatchKind::from_tag(words[2]) else {
        log::trace!("line {line_no}: inactive kind '{}', skipped", words[2]);
        return Ok(None);
    };

    let position = parse_offset(line_no, words[0])?;

    let reference_value = words[1].parse::<i32>().map_err(|_| {
        syntax(line_no, format!("invalid reference value '{}'", words[1]))
    })?;

    let mut parameter = 0;
    let mut comment = String::new();
    if let Some(rest) = words.get(3) {
        let tail = split_fields(rest, 2);
        match tail.first().map(|t| t.parse::<i32>()) {
            Some(Ok(value)) => {
                parameter = value;
                comment = tail.get(1).map(|c| c.trim_end().to_string()).unwrap_or_default();
            }
            _ => comment = rest.trim_end().to_string(),
        }
    }

    let (text, root_pos) = split_root_pos(&comment);
    let original_position = root_pos.unwrap_or(position);
    let comment = text.to_string();

    Ok(Some(PatchRecord {
        position,
        reference_value,
        kind,
        parameter,
        comment,
        original_position,
        asm,
    }))
}

fn format_record(record: &PatchRecord) -> String {
    let pos = format_offset(record.position);

    let root_pos = if record.original_position != 0 && record.original_position != record.position {
        format!(
            "[rootPos: {:08X}, offset {:<8}]",
            record.original_position,
            record.position - record.original_position
        )
    } else {
        String::new()
    };

    let param = if record.parameter != 0 {
        record.parameter.to_string()
    } else {
        String::new()
    };

    let asm = match &record.asm {
        Some(asm) if !asm.is_empty() => format!(" | {asm}"),
        _ => String::new(),
    };

    let line = format!(
        "{}  {:>4}  {:>3}  {:>4}  {:<60}{}{}",
        pos,
        record.reference_value,
        record.kind.tag(),
        param,
        record.comment,
        root_pos,
        asm
    );
    line.trim_end().to_string()
}

/// Disassembly listing of the reference build, keyed by file offset.
#[derive(Debug, Default)]
pub struct Listing {
    lines: BTreeMap<i32, String>,
}

impl Listing {
    /// Reads an IDA-style listing where columns 6..14 hold the virtual
    /// address of the line.
    pub fn parse(text: &str) -> Self {
        let mut lines = BTreeMap::new();
        for line in text.lines() {
            let code = line.split(';').next().unwrap_or_default().trim_end();
            if code.len() <= 14 {
                continue;
            }
            let Some(addr) = code.get(6..14) else {
                continue;
            };
            let Ok(addr) = i32::from_str_radix(addr, 16) else {
                continue;
            };
            if addr < LISTING_IMAGE_BASE {
                continue;
            }
            lines.insert(addr - LISTING_IMAGE_BASE, line.to_string());
        }
        Self { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Nearest listing line starting at or within 9 bytes before `position`.
    pub fn lookup(&self, position: i32) -> Option<&str> {
        (position - 9..=position)
            .rev()
            .find_map(|p| self.lines.get(&p))
            .map(String::as_str)
    }
}

pub fn annotate(records: &mut [PatchRecord], listing: &Listing) {
    for record in records {
        record.asm = listing.lookup(record.position).map(str::to_string);
    }
}
