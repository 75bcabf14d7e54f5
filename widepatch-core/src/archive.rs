use crate::remap::Resolution;
use crate::{layout_table, sprite, Result, WidepatchError};

/// Table of run-length encoded sprites ("slp ").
pub const SPRITE_TABLE: u32 = 0x736C_7020;
/// Table of binary blobs ("bina"), which include the interface layouts.
pub const LAYOUT_TABLE: u32 = 0x6269_6E61;

/// Copyright text (40), version (4) and archive type (12), kept verbatim.
const PREAMBLE_LEN: usize = 56;
const HEADER_LEN: usize = PREAMBLE_LEN + 8;
const TABLE_ENTRY_LEN: usize = 12;
const ITEM_ENTRY_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: u32,
    pub start: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub type_tag: u32,
    /// Offset of this table's item directory.
    pub start: u32,
    pub items: Vec<Item>,
}

/// Table-of-contents archive: header, table headers, per-table item
/// directories, then item data back to back in table-then-item order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub preamble: Vec<u8>,
    pub first_data_offset: u32,
    pub tables: Vec<Table>,
    /// Bytes after the last item, carried over as-is.
    pub trailer: Vec<u8>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                WidepatchError::Layout(format!(
                    "unexpected end of archive reading {len} bytes at {:#X}",
                    self.pos
                ))
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn expect_at(&self, declared: u32, what: impl FnOnce() -> String) -> Result<()> {
        if self.pos as u64 != declared as u64 {
            return Err(WidepatchError::Layout(format!(
                "{} declared at {:#X} but found at {:#X}",
                what(),
                declared,
                self.pos
            )));
        }
        Ok(())
    }
}

fn to_offset(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| WidepatchError::Layout("archive grew past 4 GiB".to_string()))
}

impl Archive {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, pos: 0 };

        let preamble = r.bytes(PREAMBLE_LEN)?.to_vec();
        let table_count = r.u32()? as usize;
        let first_data_offset = r.u32()?;

        let mut tables = Vec::new();
        let mut item_counts = Vec::new();
        for _ in 0..table_count {
            let type_tag = r.u32()?;
            let start = r.u32()?;
            let count = r.u32()? as usize;
            tables.push(Table {
                type_tag,
                start,
                items: Vec::new(),
            });
            item_counts.push(count);
        }

        for (index, (table, &count)) in tables.iter_mut().zip(&item_counts).enumerate() {
            r.expect_at(table.start, || format!("directory of table {index}"))?;
            for _ in 0..count {
                let id = r.u32()?;
                let start = r.u32()?;
                let size = r.u32()?;
                table.items.push(Item {
                    id,
                    start,
                    size,
                    data: Vec::new(),
                });
            }
        }

        r.expect_at(first_data_offset, || "first item data".to_string())?;
        for item in tables.iter_mut().flat_map(|t| t.items.iter_mut()) {
            r.expect_at(item.start, || format!("data of item {}", item.id))?;
            item.data = r.bytes(item.size as usize)?.to_vec();
        }

        let trailer = data[r.pos..].to_vec();
        if !trailer.is_empty() {
            log::debug!("{} bytes after the last item", trailer.len());
        }

        Ok(Self {
            preamble,
            first_data_offset,
            tables,
            trailer,
        })
    }

    pub fn item_count(&self) -> usize {
        self.tables.iter().map(|t| t.items.len()).sum()
    }

    /// Recomputes every declared offset and size from one running cursor,
    /// after item data has changed length.
    pub fn relayout(&mut self) -> Result<()> {
        let mut cursor = HEADER_LEN + self.tables.len() * TABLE_ENTRY_LEN;
        for table in &mut self.tables {
            table.start = to_offset(cursor)?;
            cursor += table.items.len() * ITEM_ENTRY_LEN;
        }

        self.first_data_offset = to_offset(cursor)?;
        for item in self.tables.iter_mut().flat_map(|t| t.items.iter_mut()) {
            item.start = to_offset(cursor)?;
            item.size = to_offset(item.data.len())?;
            cursor += item.data.len();
        }
        to_offset(cursor)?;
        Ok(())
    }

    /// Serialises the archive, checking as it goes that every declared
    /// offset matches where the bytes actually land.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let check = |out: &[u8], declared: u32, what: &dyn Fn() -> String| {
            if out.len() as u64 != declared as u64 {
                return Err(WidepatchError::Layout(format!(
                    "{} declared at {:#X} but written at {:#X}",
                    what(),
                    declared,
                    out.len()
                )));
            }
            Ok(())
        };

        if self.preamble.len() != PREAMBLE_LEN {
            return Err(WidepatchError::Layout(format!(
                "header text is {} bytes, expected {}",
                self.preamble.len(),
                PREAMBLE_LEN
            )));
        }

        let mut out = Vec::with_capacity(
            self.first_data_offset as usize
                + self
                    .tables
                    .iter()
                    .flat_map(|t| &t.items)
                    .map(|i| i.data.len())
                    .sum::<usize>()
                + self.trailer.len(),
        );

        out.extend_from_slice(&self.preamble);
        out.extend_from_slice(&to_offset(self.tables.len())?.to_le_bytes());
        out.extend_from_slice(&self.first_data_offset.to_le_bytes());

        for table in &self.tables {
            out.extend_from_slice(&table.type_tag.to_le_bytes());
            out.extend_from_slice(&table.start.to_le_bytes());
            out.extend_from_slice(&to_offset(table.items.len())?.to_le_bytes());
        }

        for (index, table) in self.tables.iter().enumerate() {
            check(&out, table.start, &|| format!("directory of table {index}"))?;
            for item in &table.items {
                out.extend_from_slice(&item.id.to_le_bytes());
                out.extend_from_slice(&item.start.to_le_bytes());
                out.extend_from_slice(&item.size.to_le_bytes());
            }
        }

        check(&out, self.first_data_offset, &|| "first item data".to_string())?;
        for item in self.tables.iter().flat_map(|t| &t.items) {
            check(&out, item.start, &|| format!("data of item {}", item.id))?;
            if item.size as usize != item.data.len() {
                return Err(WidepatchError::Layout(format!(
                    "item {} declares {} bytes but holds {}",
                    item.id,
                    item.size,
                    item.data.len()
                )));
            }
            out.extend_from_slice(&item.data);
        }

        out.extend_from_slice(&self.trailer);
        Ok(out)
    }
}

fn transform_item(type_tag: u32, item: &Item, old: Resolution, new: Resolution) -> Result<Vec<u8>> {
    match type_tag {
        SPRITE_TABLE => sprite::resize(&item.data, old, new).map_err(|source| {
            WidepatchError::ItemTransform {
                id: item.id,
                source: Box::new(source),
            }
        }),
        LAYOUT_TABLE => Ok(layout_table::patch(&item.data, item.id, old, new)),
        _ => Ok(item.data.clone()),
    }
}

/// Rewrites every sprite and layout table drawn for `old` so that it fits
/// `new`, and returns the re-laid-out archive.
pub fn transcode(data: &[u8], old: Resolution, new: Resolution) -> Result<Vec<u8>> {
    let mut archive = Archive::parse(data)?;
    log::debug!(
        "archive has {} tables, {} items",
        archive.tables.len(),
        archive.item_count()
    );

    let mut changed = 0usize;
    for table in &mut archive.tables {
        for item in &mut table.items {
            let converted = transform_item(table.type_tag, item, old, new)?;
            if converted != item.data {
                log::trace!(
                    "item {} rewritten ({} -> {} bytes)",
                    item.id,
                    item.data.len(),
                    converted.len()
                );
                changed += 1;
                item.data = converted;
            }
        }
    }
    log::info!("rewrote {} of {} archive items", changed, archive.item_count());

    archive.relayout()?;
    archive.to_bytes()
}
