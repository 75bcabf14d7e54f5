use serde::{Deserialize, Serialize};

use crate::locate::md5_hex;
use crate::patch_file::{PatchFile, PatchRecord};

/// Tunables for the fuzzy window search.
///
/// The defaults reproduce the behaviour the shipped patch files were
/// converted with; changing them can move or drop relocated records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    /// Window sizes in bytes, tried smallest first.
    pub window_sizes: Vec<usize>,
    /// Leading bytes that must match exactly (key dword plus opcode).
    pub anchor_len: usize,
    /// Leading bytes that never count as an excusing opcode.
    pub key_len: usize,
    /// How far back from a mismatch to look for an excusing opcode.
    pub max_backscan: usize,
    /// A window of `n` bytes tolerates at most `n / error_divisor`
    /// mismatches.
    pub error_divisor: usize,
    /// Opcodes whose operand may legitimately differ between builds.
    pub excusing_opcodes: Vec<u8>,
    /// Window size at which a miss is retried with the window moved left.
    pub retry_window: usize,
    pub retry_shift: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            window_sizes: vec![4, 8, 12, 16, 20],
            anchor_len: 5,
            key_len: 4,
            max_backscan: 4,
            error_divisor: 3,
            // call rel32, jmp rel32
            excusing_opcodes: vec![0xE8, 0xE9],
            retry_window: 8,
            retry_shift: 4,
        }
    }
}

/// True when the mismatch at `index` sits inside the operand of a call or
/// jump, i.e. an excusing opcode appears at most `max_backscan` bytes
/// before it without reaching into the key bytes.
pub fn is_excusable_mismatch(window: &[u8], index: usize, policy: &MatchPolicy) -> bool {
    (1..=policy.max_backscan)
        .map_while(|back| index.checked_sub(back).filter(|&p| p >= policy.key_len))
        .any(|p| policy.excusing_opcodes.contains(&window[p]))
}

/// Fuzzy comparison of a root window against an equally long candidate
/// slice of the target image.
pub fn window_matches(window: &[u8], candidate: &[u8], policy: &MatchPolicy) -> bool {
    let max_errors = window.len() / policy.error_divisor.max(1);
    let mut errors = Vec::new();

    for (i, (&w, &c)) in window.iter().zip(candidate).enumerate() {
        if w == c {
            continue;
        }
        if i < policy.anchor_len || errors.len() >= max_errors {
            return false;
        }
        errors.push(i);
    }

    errors
        .iter()
        .all(|&i| is_excusable_mismatch(window, i, policy))
}

/// Maps byte offsets in a verified root build onto another build of the same
/// program.
pub struct Relocator<'a> {
    root: &'a [u8],
    target: &'a [u8],
    policy: &'a MatchPolicy,
}

impl<'a> Relocator<'a> {
    pub fn new(root: &'a [u8], target: &'a [u8], policy: &'a MatchPolicy) -> Self {
        Self {
            root,
            target,
            policy,
        }
    }

    /// Returns the matching offset in the target image, or `-root_offset`
    /// when no unique match exists.
    pub fn locate(&self, root_offset: i32) -> i32 {
        self.find(root_offset).unwrap_or(-root_offset)
    }

    pub fn find(&self, root_offset: i32) -> Option<i32> {
        let mut sizes = self.policy.window_sizes.clone();
        sizes.sort_unstable();
        sizes.dedup();

        for size in sizes {
            let Some(shift) = self.window_shift(root_offset, size) else {
                log::warn!(
                    "block {:08X} does not fit a {} byte window in the root image",
                    root_offset,
                    size
                );
                return None;
            };

            let hits = self.search(root_offset, shift, size);
            match hits.len() {
                1 => return Some(hits[0] - shift),
                0 => {
                    if size == self.policy.retry_window && shift == 0 {
                        let shift = -(self.policy.retry_shift as i32);
                        if root_offset + shift >= 0 {
                            let hits = self.search(root_offset, shift, size);
                            if hits.len() == 1 {
                                return Some(hits[0] - shift);
                            }
                        }
                    }
                    log::warn!(
                        "found no matches for block {:08X} {}",
                        root_offset,
                        size
                    );
                    return None;
                }
                n => log::trace!(
                    "block {:08X}: {} candidates at window size {}",
                    root_offset,
                    n,
                    size
                ),
            }
        }

        log::warn!("found too many matches for block {:08X}", root_offset);
        None
    }

    /// Leftward shift that keeps a `size` byte window at `offset` inside the
    /// root image.
    fn window_shift(&self, offset: i32, size: usize) -> Option<i32> {
        let len = self.root.len();
        if offset < 0 || offset as usize >= len || size > len {
            return None;
        }
        let end = offset as usize + size;
        if end > len {
            Some(len as i32 - end as i32)
        } else {
            Some(0)
        }
    }

    fn search(&self, offset: i32, shift: i32, size: usize) -> Vec<i32> {
        let start = (offset + shift) as usize;
        let window = &self.root[start..start + size];

        if window.len() > self.target.len() {
            return Vec::new();
        }

        (0..=self.target.len() - size)
            .filter(|&pos| window_matches(window, &self.target[pos..pos + size], self.policy))
            .map(|pos| pos as i32)
            .collect()
    }
}

/// Ports a patch file derived against `root` onto `target`.
///
/// Records that cannot be placed keep a negative position so that they are
/// reported and skipped when applied.
pub fn convert_patch(
    root: &[u8],
    target: &[u8],
    patch: &PatchFile,
    policy: &MatchPolicy,
    version: &str,
) -> PatchFile {
    let relocator = Relocator::new(root, target, policy);

    // Offset 0 cannot carry the negative "unresolved" marker, so it is
    // copied through like records that already failed.
    let locate_ref = |position: i32| {
        if position > 0 {
            relocator.locate(position)
        } else {
            position
        }
    };

    let records: Vec<PatchRecord> = patch
        .records
        .iter()
        .map(|record| PatchRecord {
            position: locate_ref(record.position),
            original_position: record.position,
            asm: None,
            ..record.clone()
        })
        .collect();

    let resolved = records.iter().filter(|r| r.is_resolved()).count();
    log::info!(
        "relocated {} of {} records onto the target build",
        resolved,
        records.len()
    );

    PatchFile {
        expected_file_size: target.len() as u64,
        expected_md5: md5_hex(target),
        version: version.to_string(),
        archive_ref_position: locate_ref(patch.archive_ref_position),
        archive_ref_position_secondary: locate_ref(patch.archive_ref_position_secondary),
        records,
    }
}
