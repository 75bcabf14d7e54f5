use std::borrow::Cow;

use crate::remap::Resolution;
use crate::{Result, WidepatchError};

/// "2.0N" read as a little-endian dword.
pub const SPRITE_MAGIC: u32 = 0x4E30_2E32;

const HEADER_LEN: usize = 64;
const COMMENT_LEN: usize = 24;
/// Run-length opcode "fill with one colour".
const BLIT_SOLID: u8 = 0x07;

#[derive(Debug, Clone)]
struct FrameHeader {
    frame_count: u32,
    comment: [u8; COMMENT_LEN],
    lines_offset: u32,
    mask_offset: u32,
    palette_offset: u32,
    properties: u32,
    width: i32,
    height: i32,
    center_x: i32,
    center_y: i32,
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    read_u32(data, offset).map(|v| v as i32)
}

fn malformed(reason: impl Into<String>) -> WidepatchError {
    WidepatchError::Sprite {
        reason: reason.into(),
    }
}

impl FrameHeader {
    fn read(data: &[u8]) -> Option<Self> {
        let mut comment = [0u8; COMMENT_LEN];
        comment.copy_from_slice(data.get(8..8 + COMMENT_LEN)?);
        Some(Self {
            frame_count: read_u32(data, 4)?,
            comment,
            lines_offset: read_u32(data, 32)?,
            mask_offset: read_u32(data, 36)?,
            palette_offset: read_u32(data, 40)?,
            properties: read_u32(data, 44)?,
            width: read_i32(data, 48)?,
            height: read_i32(data, 52)?,
            center_x: read_i32(data, 56)?,
            center_y: read_i32(data, 60)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&SPRITE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.frame_count.to_le_bytes());
        out.extend_from_slice(&self.comment);
        out.extend_from_slice(&self.lines_offset.to_le_bytes());
        out.extend_from_slice(&self.mask_offset.to_le_bytes());
        out.extend_from_slice(&self.palette_offset.to_le_bytes());
        out.extend_from_slice(&self.properties.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.center_x.to_le_bytes());
        out.extend_from_slice(&self.center_y.to_le_bytes());
    }
}

/// Source row for every output scanline when going from `old_height` to
/// `new_height` rows.
///
/// Shrinking drops a run of rows ending at the centre row. Growing repeats
/// rows of a block centred on the middle row, each at most `factor` times,
/// until exactly the missing number of rows has been added.
pub fn row_plan(old_height: usize, new_height: usize) -> Vec<usize> {
    let mut plan = Vec::with_capacity(new_height);
    if old_height == 0 || new_height == 0 {
        return plan;
    }
    let center = old_height / 2;

    if new_height <= old_height {
        let drop = old_height - new_height;
        let start = center.saturating_sub(drop);
        let dropped = start..start + drop;
        plan.extend((0..old_height).filter(|row| !dropped.contains(row)));
        return plan;
    }

    let extra = new_height - old_height;
    let half = (old_height / 2).max(1);
    let factor = 1 + (extra + 1) / half;
    let block = extra.div_ceil(factor);
    let start = center.saturating_sub(block / 2).min(old_height - block);
    let duplicated = start..start + block;

    let mut remaining = extra;
    for row in 0..old_height {
        plan.push(row);
        if duplicated.contains(&row) {
            let copies = factor.min(remaining);
            plan.extend(std::iter::repeat(row).take(copies));
            remaining -= copies;
        }
    }
    plan
}

/// Run-length opcodes painting `amount` pixels of `color`.
pub fn blit_color(amount: i32, color: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut amount = amount;
    while amount > 15 {
        let count = amount.min(255);
        out.extend_from_slice(&[BLIT_SOLID, count as u8, color]);
        amount -= count;
    }
    while amount > 0 {
        let count = amount.min(15);
        out.extend_from_slice(&[BLIT_SOLID | ((count as u8) << 4), color]);
        amount -= count;
    }
    out
}

/// Widens one encoded scanline by filling with its last colour just before
/// the end-of-line byte.
pub fn stretch_line(line: &[u8], old_width: i32, new_width: i32) -> Cow<'_, [u8]> {
    if line.len() <= 1 {
        return Cow::Borrowed(line);
    }
    let fill = blit_color(new_width - old_width, line[line.len() - 2]);
    if fill.is_empty() {
        return Cow::Borrowed(line);
    }
    let (body, eol) = line.split_at(line.len() - 1);
    Cow::Owned([body, &fill, eol].concat())
}

/// Re-encodes a single-frame sprite drawn at `old` so that it covers `new`.
///
/// Anything that is not a single-frame sprite of exactly `old` size is
/// returned unchanged.
pub fn resize(data: &[u8], old: Resolution, new: Resolution) -> Result<Vec<u8>> {
    if read_u32(data, 0) != Some(SPRITE_MAGIC) {
        return Ok(data.to_vec());
    }
    if read_u32(data, 4) != Some(1) {
        return Ok(data.to_vec());
    }
    let Some(header) = FrameHeader::read(data) else {
        return Err(malformed("truncated frame header"));
    };
    if header.width != old.width || header.height != old.height {
        return Ok(data.to_vec());
    }
    if old == new {
        return Ok(data.to_vec());
    }
    if new.width <= 0 || new.height <= 0 {
        return Err(malformed(format!("cannot resize to {new}")));
    }
    if header.mask_offset as usize != HEADER_LEN {
        return Err(malformed(format!(
            "row masks start at {:#X}, expected {:#X}",
            header.mask_offset, HEADER_LEN
        )));
    }

    let old_height = old.height as usize;
    let new_height = new.height as usize;

    let masks = (0..old_height)
        .map(|row| read_u32(data, header.mask_offset as usize + row * 4))
        .collect::<Option<Vec<u32>>>()
        .ok_or_else(|| malformed("row mask table runs past the end"))?;

    let mut starts = (0..old_height)
        .map(|row| read_u32(data, header.lines_offset as usize + row * 4).map(|v| v as usize))
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(|| malformed("row offset table runs past the end"))?;
    starts.push(data.len());

    let mut rows = Vec::with_capacity(old_height);
    for (row, pair) in starts.windows(2).enumerate() {
        let (start, end) = (pair[0], pair[1]);
        if start > end || end > data.len() {
            return Err(malformed(format!("row {row} spans {start:#X}..{end:#X}")));
        }
        rows.push(stretch_line(&data[start..end], old.width, new.width));
    }

    let plan = row_plan(old_height, new_height);
    if plan.len() != new_height {
        return Err(malformed(format!(
            "produced {} rows for a {} row sprite",
            plan.len(),
            new_height
        )));
    }

    let table_len = (new_height * 4) as u32;
    let new_lines_offset = header.mask_offset + table_len;
    let data_start = new_lines_offset + table_len;

    let out_header = FrameHeader {
        lines_offset: new_lines_offset,
        width: new.width,
        height: new.height,
        ..header
    };

    let pixel_len: usize = plan.iter().map(|&row| rows[row].len()).sum();
    let mut out = Vec::with_capacity(data_start as usize + pixel_len);
    out_header.write(&mut out);

    for &row in &plan {
        out.extend_from_slice(&masks[row].to_le_bytes());
    }

    let mut next_start = data_start;
    for &row in &plan {
        out.extend_from_slice(&next_start.to_le_bytes());
        next_start += rows[row].len() as u32;
    }

    if out.len() != data_start as usize {
        return Err(malformed("row tables do not end where pixel data starts"));
    }
    for &row in &plan {
        out.extend_from_slice(&rows[row]);
    }
    if out.len() != next_start as usize {
        return Err(malformed("pixel data length does not match row offsets"));
    }

    Ok(out)
}

#[cfg(test)]
pub(crate) fn encode_sprite(width: i32, rows: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let height = rows.len() as u32;
    let mask_offset = HEADER_LEN as u32;
    let lines_offset = mask_offset + height * 4;
    let data_start = lines_offset + height * 4;

    let mut comment = [0u8; COMMENT_LEN];
    comment[..23].copy_from_slice(b"ArtDesk 1.00 SLP Writer");
    let header = FrameHeader {
        frame_count: 1,
        comment,
        lines_offset,
        mask_offset,
        palette_offset: 0,
        properties: 0x10,
        width,
        height: height as i32,
        center_x: 0,
        center_y: 0,
    };

    let mut out = Vec::new();
    header.write(&mut out);
    for (mask, _) in rows {
        out.extend_from_slice(&mask.to_le_bytes());
    }
    let mut next = data_start;
    for (_, line) in rows {
        out.extend_from_slice(&next.to_le_bytes());
        next += line.len() as u32;
    }
    for (_, line) in rows {
        out.extend_from_slice(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn rows(height: usize) -> Vec<(u32, Vec<u8>)> {
        (0..height)
            .map(|i| {
                let line = if i % 5 == 4 {
                    vec![0x0F]
                } else {
                    vec![0x12, i as u8, 0x0F]
                };
                (i as u32 * 0x0001_0001, line)
            })
            .collect()
    }

    struct Decoded {
        width: i32,
        height: i32,
        lines_offset: u32,
        masks: Vec<u32>,
        lines: Vec<Vec<u8>>,
    }

    fn decode(data: &[u8]) -> Decoded {
        let header = FrameHeader::read(data).unwrap();
        let height = header.height as usize;
        let masks = (0..height)
            .map(|r| read_u32(data, header.mask_offset as usize + r * 4).unwrap())
            .collect();
        let mut starts: Vec<usize> = (0..height)
            .map(|r| read_u32(data, header.lines_offset as usize + r * 4).unwrap() as usize)
            .collect();
        starts.push(data.len());
        let lines = starts.windows(2).map(|p| data[p[0]..p[1]].to_vec()).collect();
        Decoded {
            width: header.width,
            height: header.height,
            lines_offset: header.lines_offset,
            masks,
            lines,
        }
    }

    #[test]
    fn blit_color_encodings() {
        assert!(blit_color(0, 0x56).is_empty());
        assert!(blit_color(-3, 0x56).is_empty());
        assert_eq!(blit_color(5, 0x56), vec![0x57, 0x56]);
        assert_eq!(blit_color(15, 0x56), vec![0xF7, 0x56]);
        assert_eq!(blit_color(20, 0x56), vec![0x07, 20, 0x56]);
        assert_eq!(blit_color(270, 0x56), vec![0x07, 0xFF, 0x56, 0xF7, 0x56]);
        assert_eq!(
            blit_color(300, 0x56),
            vec![0x07, 0xFF, 0x56, 0x07, 45, 0x56]
        );
    }

    #[test]
    fn stretch_line_inserts_fill_before_eol() {
        let line = [0x12, 0x34, 0x56, 0x0F];
        assert_eq!(
            stretch_line(&line, 1024, 1044).as_ref(),
            &[0x12, 0x34, 0x56, 0x07, 20, 0x56, 0x0F]
        );
        assert_eq!(stretch_line(&line, 1024, 1024).as_ref(), &line);
        assert_eq!(stretch_line(&line, 1024, 1000).as_ref(), &line);
        assert_eq!(stretch_line(&[0x0F], 1024, 1920).as_ref(), &[0x0F]);
    }

    #[test]
    fn row_plan_always_yields_requested_height() {
        for old in 1..=64usize {
            for new in 1..=(4 * old + 50) {
                let plan = row_plan(old, new);
                assert_eq!(plan.len(), new, "{old} -> {new}");
                assert!(plan.windows(2).all(|w| w[0] <= w[1]), "{old} -> {new}");
                assert!(plan.iter().all(|&r| r < old));
                if new >= old {
                    assert!((0..old).all(|r| plan.contains(&r)), "{old} -> {new}");
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(0x5EED_0002);
        for _ in 0..200 {
            let old = rng.gen_range(100..1600);
            let new = rng.gen_range(1..3 * old);
            assert_eq!(row_plan(old, new).len(), new, "{old} -> {new}");
        }
    }

    #[test]
    fn shrinking_drops_rows_just_above_centre() {
        let plan = row_plan(10, 7);
        assert_eq!(plan, vec![0, 1, 5, 6, 7, 8, 9]);

        for old in 2..=40usize {
            let center = old / 2;
            for drop in 1..=center {
                let plan = row_plan(old, old - drop);
                let kept: Vec<usize> = (0..old)
                    .filter(|r| *r < center - drop || *r >= center)
                    .collect();
                assert_eq!(plan, kept);
            }
        }
    }

    #[test]
    fn growing_duplicates_a_centred_block() {
        let plan = row_plan(768, 800);
        let mut expected: Vec<usize> = Vec::new();
        for row in 0..768 {
            expected.push(row);
            if (368..400).contains(&row) {
                expected.push(row);
            }
        }
        assert_eq!(plan, expected);

        // More rows than half the image: several copies per block row.
        let plan = row_plan(10, 100);
        let copies = |row: usize| plan.iter().filter(|&&r| r == row).count();
        assert_eq!(copies(0), 1);
        assert_eq!(copies(3), 20);
        assert_eq!(copies(7), 15);
        assert_eq!(copies(8), 1);
    }

    #[test]
    fn resize_leaves_unrelated_items_alone() {
        let sprite = encode_sprite(1024, &rows(8));
        let old = Resolution::new(1024, 8);
        let new = Resolution::new(1920, 12);

        assert_eq!(resize(&sprite, Resolution::new(800, 8), new).unwrap(), sprite);
        assert_eq!(resize(&sprite, Resolution::new(1024, 9), new).unwrap(), sprite);
        assert_eq!(resize(&sprite, old, old).unwrap(), sprite);

        let mut two_frames = sprite.clone();
        two_frames[4] = 2;
        assert_eq!(resize(&two_frames, old, new).unwrap(), two_frames);

        let text = b"Item Name\tX\tY".to_vec();
        assert_eq!(resize(&text, old, new).unwrap(), text);
    }

    #[test]
    fn resize_grows_both_axes() {
        let source = rows(8);
        let sprite = encode_sprite(1024, &source);
        let out = resize(
            &sprite,
            Resolution::new(1024, 8),
            Resolution::new(1044, 11),
        )
        .unwrap();
        let decoded = decode(&out);

        assert_eq!(decoded.width, 1044);
        assert_eq!(decoded.height, 11);
        assert_eq!(decoded.lines_offset, 64 + 11 * 4);
        assert_eq!(decoded.masks.len(), 11);
        assert_eq!(decoded.lines.len(), 11);

        let plan = row_plan(8, 11);
        for (out_row, &src_row) in plan.iter().enumerate() {
            assert_eq!(decoded.masks[out_row], source[src_row].0);
            let expected = stretch_line(&source[src_row].1, 1024, 1044);
            assert_eq!(decoded.lines[out_row], expected.as_ref());
        }
        // The comment survives untouched.
        assert_eq!(&out[8..31], b"ArtDesk 1.00 SLP Writer");
    }

    #[test]
    fn resize_shrinks_height() {
        let source = rows(10);
        let sprite = encode_sprite(800, &source);
        let out = resize(&sprite, Resolution::new(800, 10), Resolution::new(800, 7)).unwrap();
        let decoded = decode(&out);

        assert_eq!(decoded.height, 7);
        let kept = [0usize, 1, 5, 6, 7, 8, 9];
        for (out_row, &src_row) in kept.iter().enumerate() {
            assert_eq!(decoded.masks[out_row], source[src_row].0);
            assert_eq!(decoded.lines[out_row], source[src_row].1);
        }
    }

    #[test]
    fn resize_emits_one_mask_and_offset_per_scanline() {
        let mut rng = StdRng::seed_from_u64(0x5EED_0003);
        for _ in 0..100 {
            let old_h = rng.gen_range(1..40);
            let new_h = rng.gen_range(1..120);
            let sprite = encode_sprite(640, &rows(old_h));
            let out = resize(
                &sprite,
                Resolution::new(640, old_h as i32),
                Resolution::new(700, new_h as i32),
            )
            .unwrap();
            let decoded = decode(&out);
            assert_eq!(decoded.masks.len(), new_h);
            assert_eq!(decoded.lines.len(), new_h);
        }
    }

    #[test]
    fn corrupt_row_offsets_are_rejected() {
        let mut sprite = encode_sprite(1024, &rows(4));
        let lines_offset = 64 + 4 * 4;
        sprite[lines_offset..lines_offset + 4].copy_from_slice(&0xFFFFu32.to_le_bytes());

        let err = resize(&sprite, Resolution::new(1024, 4), Resolution::new(1024, 6)).unwrap_err();
        assert!(matches!(err, WidepatchError::Sprite { .. }));
    }
}
