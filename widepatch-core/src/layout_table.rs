use crate::remap::Resolution;

const HEADER_NAME: &str = "Item Name";
const SIGNATURE: &[u8] = b"Item Name\t";

// Column layout of the interface tables: a name, then x/y/w/h for each of the
// three stock resolutions, then free-form notes.
const NAME: usize = 0;
const FIRST_X_800: usize = 1;
const FIRST_X_1024: usize = 5;
const FIRST_X_1280: usize = 9;
const H_1280: usize = 12;

/// Moves and stretches interface elements laid out for `old` so they fit
/// `new`. Data that is not an interface table comes back unchanged.
pub fn patch(data: &[u8], id: u32, old: Resolution, new: Resolution) -> Vec<u8> {
    let first_col = match old.width {
        800 => FIRST_X_800,
        1024 => FIRST_X_1024,
        1280 => FIRST_X_1280,
        _ => return data.to_vec(),
    };
    if !data.starts_with(SIGNATURE) {
        return data.to_vec();
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return data.to_vec();
    };

    match rewrite(text, first_col, old, new) {
        Ok(out) => {
            log::info!("Patched Gui Table #{id}");
            out.into_bytes()
        }
        Err(err) => {
            log::warn!("Failed to patch Gui Table #{id}; leaving it unchanged. ({err})");
            data.to_vec()
        }
    }
}

fn rewrite(
    text: &str,
    first_col: usize,
    old: Resolution,
    new: Resolution,
) -> std::result::Result<String, std::num::ParseIntError> {
    let higher = new.height - old.height;
    let center = old.height / 2;

    let mut table: Vec<Vec<String>> = text
        .split(&['\r', '\n'][..])
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect();

    for row in &mut table {
        if row.len() <= H_1280
            || row[NAME].is_empty()
            || row[NAME] == HEADER_NAME
            || row[H_1280].is_empty()
        {
            continue;
        }

        let x: i32 = row[first_col].trim().parse()?;
        let mut y: i32 = row[first_col + 1].trim().parse()?;
        let mut w: i32 = row[first_col + 2].trim().parse()?;
        let mut h: i32 = row[first_col + 3].trim().parse()?;

        if y < center && y + h > center {
            // straddles the centre line: stretch
            h += higher;
        } else if y > center {
            y += higher;
        }
        if w == old.width {
            w = new.width;
        }

        row[first_col] = x.to_string();
        row[first_col + 1] = y.to_string();
        row[first_col + 2] = w.to_string();
        row[first_col + 3] = h.to_string();
    }

    Ok(table
        .iter()
        .map(|row| row.join("\t"))
        .collect::<Vec<_>>()
        .join("\r\n"))
}
