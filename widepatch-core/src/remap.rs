use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, WidepatchError};

/// Widths the game compares against somewhere in its code.
pub const REFERENCE_WIDTHS: [i32; 4] = [800, 1024, 1280, 1600];
/// Heights the game compares against somewhere in its code.
pub const REFERENCE_HEIGHTS: [i32; 4] = [600, 768, 1024, 1200];

/// Stock resolutions the interface archive carries layouts for.
pub const SOURCE_RESOLUTIONS: [Resolution; 3] = [
    Resolution::new(800, 600),
    Resolution::new(1024, 768),
    Resolution::new(1280, 1024),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: i32,
    pub height: i32,
}

impl Resolution {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = WidepatchError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || WidepatchError::Config(format!("'{s}' is not a WIDTHxHEIGHT resolution"));
        let (w, h) = s.split_once(&['x', 'X'][..]).ok_or_else(bad)?;
        let width = w.trim().parse::<i32>().map_err(|_| bad())?;
        let height = h.trim().parse::<i32>().map_err(|_| bad())?;
        if width <= 0 || height <= 0 {
            return Err(bad());
        }
        Ok(Self { width, height })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Old-to-new mapping of the reference dimensions along one axis.
///
/// The dimension being replaced maps to the new value; every larger
/// reference maps to new+1, new+2, ... so that `if width > X` chains in the
/// binary keep their order. Smaller references are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionMap {
    axis: Axis,
    mapping: Vec<(i32, i32)>,
}

impl ResolutionMap {
    pub fn build(axis: Axis, references: &[i32], old: i32, new: i32) -> Self {
        let mut refs = references.to_vec();
        refs.sort_unstable();
        refs.dedup();

        let mut next = new;
        let mapping = refs
            .into_iter()
            .filter_map(|r| {
                if r == old {
                    Some((r, new))
                } else if r > old {
                    next += 1;
                    Some((r, next))
                } else {
                    None
                }
            })
            .collect();

        Self { axis, mapping }
    }

    pub fn horizontal(old: i32, new: i32) -> Self {
        Self::build(Axis::Horizontal, &REFERENCE_WIDTHS, old, new)
    }

    pub fn vertical(old: i32, new: i32) -> Self {
        Self::build(Axis::Vertical, &REFERENCE_HEIGHTS, old, new)
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn pairs(&self) -> &[(i32, i32)] {
        &self.mapping
    }

    /// Mapped value, or `value` itself when it is not a mapped reference.
    pub fn map(&self, value: i32) -> i32 {
        self.mapping
            .iter()
            .find(|(old, _)| *old == value)
            .map_or(value, |(_, new)| *new)
    }
}

/// Picks the largest stock resolution that fits inside `target`; its
/// layouts are the ones stretched to the new size.
pub fn source_resolution(target: Resolution) -> Result<Resolution> {
    for source in SOURCE_RESOLUTIONS.iter().rev() {
        if target.width >= source.width && target.height >= source.height {
            if *source == target {
                return Err(WidepatchError::Config(format!(
                    "{target} is a stock resolution; there is nothing to patch"
                )));
            }
            return Ok(*source);
        }
    }
    Err(WidepatchError::Config(format!(
        "{target} is smaller than 800x600, which is not supported"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn maps_old_value_and_shifts_larger_ones() {
        let map = ResolutionMap::horizontal(1024, 1920);
        assert_eq!(map.axis(), Axis::Horizontal);
        assert_eq!(map.pairs(), &[(1024, 1920), (1280, 1921), (1600, 1922)]);
        assert_eq!(map.map(800), 800);
        assert_eq!(map.map(1024), 1920);
        assert_eq!(map.map(1600), 1922);
        assert_eq!(map.map(640), 640);

        let map = ResolutionMap::vertical(600, 900);
        assert_eq!(map.pairs(), &[(600, 900), (768, 901), (1024, 902), (1200, 903)]);
    }

    #[test]
    fn larger_references_keep_their_order() {
        let mut rng = StdRng::seed_from_u64(0x5EED_0001);
        for _ in 0..500 {
            let old = REFERENCE_WIDTHS[rng.gen_range(0..REFERENCE_WIDTHS.len())];
            let new = rng.gen_range(old..old + 3000);
            let map = ResolutionMap::horizontal(old, new);

            for a in REFERENCE_WIDTHS.iter().copied().filter(|&a| a > old) {
                for b in REFERENCE_WIDTHS.iter().copied().filter(|&b| b > a) {
                    assert!(map.map(a) < map.map(b), "{a} vs {b} for {old}->{new}");
                }
                assert!(map.map(a) > map.map(old));
            }
        }
    }

    #[test]
    fn picks_largest_fitting_stock_resolution() {
        let pick = |w, h| source_resolution(Resolution::new(w, h)).unwrap();
        assert_eq!(pick(1920, 1080), Resolution::new(1280, 1024));
        assert_eq!(pick(1920, 1200), Resolution::new(1280, 1024));
        assert_eq!(pick(1600, 900), Resolution::new(1024, 768));
        assert_eq!(pick(1280, 800), Resolution::new(1024, 768));
        assert_eq!(pick(1024, 600), Resolution::new(800, 600));

        assert!(source_resolution(Resolution::new(1024, 768)).is_err());
        assert!(source_resolution(Resolution::new(640, 480)).is_err());
        assert!(source_resolution(Resolution::new(1920, 500)).is_err());
    }

    #[test]
    fn parses_resolution_strings() {
        assert_eq!("1920x1080".parse::<Resolution>().unwrap(), Resolution::new(1920, 1080));
        assert_eq!("1680X1050".parse::<Resolution>().unwrap().to_string(), "1680x1050");
        assert!("1920".parse::<Resolution>().is_err());
        assert!("0x1080".parse::<Resolution>().is_err());
    }
}
