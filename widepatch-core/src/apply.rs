use crate::patch_file::{PatchFile, PatchKind, PatchRecord};
use crate::remap::{Axis, Resolution, ResolutionMap};
use crate::{Result, WidepatchError};

/// Values worth looking at when drafting a patch for a new build.
pub const KNOWN_RESOLUTION_VALUES: [u32; 11] =
    [200, 320, 480, 640, 600, 768, 800, 1024, 1200, 1280, 1600];

/// Outcome counts of one `PatchApplier::apply` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub patched: usize,
    pub skipped: usize,
}

/// Rewrites dimension constants in a binary image for one old/new
/// resolution pair.
#[derive(Debug, Clone)]
pub struct PatchApplier {
    old: Resolution,
    horizontal: ResolutionMap,
    vertical: ResolutionMap,
}

impl PatchApplier {
    pub fn new(old: Resolution, new: Resolution) -> Self {
        let horizontal = ResolutionMap::horizontal(old.width, new.width);
        let vertical = ResolutionMap::vertical(old.height, new.height);

        for (from, to) in horizontal.pairs() {
            log::trace!("Horizontal {from} => {to}");
        }
        for (from, to) in vertical.pairs() {
            log::trace!("Vertical {from} => {to}");
        }

        Self {
            old,
            horizontal,
            vertical,
        }
    }

    /// Applies every record it can; records that fail validation are
    /// reported and left untouched.
    pub fn apply(&self, image: &mut [u8], records: &[PatchRecord]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for record in records {
            if self.apply_record(image, record) {
                report.patched += 1;
            } else {
                report.skipped += 1;
            }
        }
        log::info!(
            "patched {} locations, skipped {}",
            report.patched,
            report.skipped
        );
        report
    }

    fn axis_for(&self, record: &PatchRecord) -> Axis {
        match record.kind {
            PatchKind::H | PatchKind::DeltaH => Axis::Horizontal,
            PatchKind::V | PatchKind::DeltaV => Axis::Vertical,
            // Prefer the axis being patched: 1024 HV while patching 1024x768
            // is a width.
            PatchKind::HV if record.reference_value == self.old.width => Axis::Horizontal,
            PatchKind::HV => Axis::Vertical,
        }
    }

    fn apply_record(&self, image: &mut [u8], record: &PatchRecord) -> bool {
        let kind = record.kind.tag();

        if !record.is_resolved() {
            log::warn!(
                "{} action at unresolved location !!!{:08X} [NOT PATCHED]",
                kind,
                record.position.unsigned_abs()
            );
            return false;
        }

        let pos = record.position as usize;
        let Some(slot) = image.get_mut(pos..pos + 4) else {
            log::warn!(
                "Error in input: Invalid location {:08X}. [NOT PATCHED]",
                record.position
            );
            return false;
        };

        let map = match self.axis_for(record) {
            Axis::Horizontal => &self.horizontal,
            Axis::Vertical => &self.vertical,
        };
        let old_value = record.reference_value;
        let mapped = map.map(old_value);
        if record.kind == PatchKind::HV {
            log::trace!("{old_value} HV: Mapping to {mapped}");
        }

        let current = i32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);

        let new_value = if record.kind.is_delta() {
            if record.parameter == 0 {
                log::warn!(
                    "{} action is safer if you mention the expected original value. Encountered {} @ {:08X}",
                    kind,
                    current,
                    pos
                );
            } else if record.parameter != current {
                log::warn!(
                    "{} action expected value mismatch: {} expected, {} encountered @ {:08X} [NOT PATCHED]",
                    kind,
                    record.parameter,
                    current,
                    pos
                );
                return false;
            }
            current.wrapping_add(mapped - old_value)
        } else {
            if current != old_value {
                log::warn!(
                    "{} action expected value mismatch: {} expected, {} encountered @ {:08X} [NOT PATCHED]",
                    kind,
                    old_value,
                    current,
                    pos
                );
                return false;
            }
            mapped
        };

        slot.copy_from_slice(&new_value.to_le_bytes());
        true
    }
}

pub fn apply(
    image: &mut [u8],
    old_width: i32,
    old_height: i32,
    new_width: i32,
    new_height: i32,
    records: &[PatchRecord],
) -> ApplyReport {
    PatchApplier::new(
        Resolution::new(old_width, old_height),
        Resolution::new(new_width, new_height),
    )
    .apply(image, records)
}

/// Name of the generated interface archive, e.g. `19201080.drs`. It has the
/// same length as `interfac.drs` for any four-digit resolution.
pub fn archive_file_name(target: Resolution) -> String {
    format!("{:04}{:04}.drs", target.width, target.height)
}

/// Overwrites the archive file name embedded in the binary at `position`.
///
/// The byte there must be the leading `i` of the stock name; anything else
/// means the patch does not belong to this binary.
pub fn patch_archive_reference(image: &mut [u8], position: i32, name: &str) -> Result<()> {
    let wrong_binary = || WidepatchError::ArchiveReference { position };

    let pos = usize::try_from(position).map_err(|_| wrong_binary())?;
    if image.get(pos) != Some(&b'i') {
        return Err(wrong_binary());
    }

    let bytes = name.as_bytes();
    let slot = image.get_mut(pos..pos + bytes.len()).ok_or_else(wrong_binary)?;
    slot.copy_from_slice(bytes);
    Ok(())
}

/// Rewrites the primary and, when present, the secondary archive reference.
pub fn patch_archive_references(image: &mut [u8], patch: &PatchFile, name: &str) -> Result<()> {
    patch_archive_reference(image, patch.archive_ref_position, name)?;
    if patch.archive_ref_position_secondary != 0 {
        patch_archive_reference(image, patch.archive_ref_position_secondary, name)?;
    }
    Ok(())
}

/// Every offset holding one of `KNOWN_RESOLUTION_VALUES` as a little-endian
/// dword.
pub fn scan_resolutions(image: &[u8]) -> Vec<(usize, u32)> {
    image
        .windows(4)
        .enumerate()
        .filter_map(|(offset, w)| {
            let value = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            KNOWN_RESOLUTION_VALUES
                .contains(&value)
                .then_some((offset, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(position: i32, reference_value: i32, kind: PatchKind, parameter: i32) -> PatchRecord {
        PatchRecord {
            position,
            reference_value,
            kind,
            parameter,
            comment: String::new(),
            original_position: position,
            asm: None,
        }
    }

    fn put(image: &mut [u8], pos: usize, value: i32) {
        image[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get(image: &[u8], pos: usize) -> i32 {
        i32::from_le_bytes(image[pos..pos + 4].try_into().unwrap())
    }

    #[test]
    fn absolute_values_are_remapped() {
        let mut image = vec![0u8; 64];
        put(&mut image, 8, 1024);
        put(&mut image, 16, 768);
        put(&mut image, 24, 1280);
        put(&mut image, 32, 800);

        let records = [
            record(8, 1024, PatchKind::H, 0),
            record(16, 768, PatchKind::V, 0),
            record(24, 1280, PatchKind::H, 0),
            record(32, 800, PatchKind::H, 0),
        ];
        let report = apply(&mut image, 1024, 768, 1920, 1080, &records);

        assert_eq!(report, ApplyReport { patched: 4, skipped: 0 });
        assert_eq!(get(&image, 8), 1920);
        assert_eq!(get(&image, 16), 1080);
        assert_eq!(get(&image, 24), 1921);
        assert_eq!(get(&image, 32), 800);
    }

    #[test]
    fn absolute_mismatch_is_skipped() {
        let mut image = vec![0u8; 16];
        put(&mut image, 4, 800);

        let records = [record(4, 1024, PatchKind::H, 0)];
        let report = apply(&mut image, 1024, 768, 1920, 1080, &records);

        assert_eq!(report, ApplyReport { patched: 0, skipped: 1 });
        assert_eq!(get(&image, 4), 800);
    }

    #[test]
    fn hv_prefers_width_being_patched() {
        let mut image = vec![0u8; 16];
        put(&mut image, 0, 1024);
        put(&mut image, 8, 1024);

        let records = [record(0, 1024, PatchKind::HV, 0)];
        apply(&mut image, 1024, 768, 1920, 1080, &records);
        assert_eq!(get(&image, 0), 1920);

        // Patching 800x600: 1024 is the second height above 600.
        let records = [record(8, 1024, PatchKind::HV, 0)];
        apply(&mut image, 800, 600, 1000, 700, &records);
        assert_eq!(get(&image, 8), 702);
    }

    #[test]
    fn delta_applies_difference_to_encoded_value() {
        let mut image = vec![0u8; 16];
        // 768 - 156: a status-bar offset derived from the height.
        put(&mut image, 4, 612);

        let report = apply(
            &mut image,
            1024,
            768,
            1920,
            1080,
            &[record(4, 768, PatchKind::DeltaV, 612)],
        );
        assert_eq!(report.patched, 1);
        assert_eq!(get(&image, 4), 612 + 312);

        // Unchecked delta still applies.
        put(&mut image, 8, -1024);
        let records = [record(8, 1024, PatchKind::DeltaH, 0)];
        apply(&mut image, 1024, 768, 1280, 800, &records);
        assert_eq!(get(&image, 8), -1024 + 256);
    }

    #[test]
    fn delta_mismatch_leaves_bytes_and_other_records_alone() {
        let mut image = vec![0u8; 16];
        put(&mut image, 0, 600);
        put(&mut image, 8, 768);

        let records = [
            record(0, 768, PatchKind::DeltaV, 612),
            record(8, 768, PatchKind::V, 0),
        ];
        let report = apply(&mut image, 1024, 768, 1920, 1080, &records);

        assert_eq!(report, ApplyReport { patched: 1, skipped: 1 });
        assert_eq!(get(&image, 0), 600);
        assert_eq!(get(&image, 8), 1080);
    }

    #[test]
    fn offset_zero_is_patched() {
        let mut image = vec![0u8; 8];
        put(&mut image, 0, 768);

        let records = [record(0, 768, PatchKind::V, 0)];
        let report = apply(&mut image, 1024, 768, 1280, 800, &records);

        assert_eq!(report, ApplyReport { patched: 1, skipped: 0 });
        assert_eq!(get(&image, 0), 800);
    }

    #[test]
    fn out_of_range_and_unresolved_positions_are_skipped() {
        let mut image = vec![0u8; 16];
        put(&mut image, 12, 1024);
        let before = image.clone();

        let records = [
            record(16, 1024, PatchKind::H, 0),
            record(14, 1024, PatchKind::H, 0),
            record(-12, 1024, PatchKind::H, 0),
        ];
        let report = apply(&mut image, 1024, 768, 1920, 1080, &records);

        assert_eq!(report, ApplyReport { patched: 0, skipped: 3 });
        assert_eq!(image, before);
    }

    #[test]
    fn archive_reference_is_renamed() {
        let mut image = b"....interfac.drs....".to_vec();
        let name = archive_file_name(Resolution::new(1920, 1080));
        assert_eq!(name, "19201080.drs");

        patch_archive_reference(&mut image, 4, &name).unwrap();
        assert_eq!(&image, b"....19201080.drs....");

        let err = patch_archive_reference(&mut image, 4, &name).unwrap_err();
        assert!(matches!(err, WidepatchError::ArchiveReference { position: 4 }));
        assert!(patch_archive_reference(&mut image, 400, &name).is_err());
        assert!(patch_archive_reference(&mut image, -4, &name).is_err());
    }

    #[test]
    fn scan_finds_known_values() {
        let mut image = vec![0xFFu8; 24];
        put(&mut image, 2, 1024);
        put(&mut image, 12, 600);
        put(&mut image, 18, 1023);

        assert_eq!(scan_resolutions(&image), vec![(2, 1024), (12, 600)]);
    }
}
