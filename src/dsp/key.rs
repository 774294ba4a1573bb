//! Musical key estimation.
//!
//! Implements the Krumhansl-Schmuckler key-finding algorithm: a 12-bin
//! histogram of note onsets per pitch class is correlated against all
//! twelve rotations of a major and a minor key profile, and the best
//! scoring rotations are reported.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Krumhansl-Kessler major key profile, indexed from the tonic.
pub const MAJOR_PROFILE: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];

/// Krumhansl-Kessler minor key profile, indexed from the tonic.
pub const MINOR_PROFILE: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// The mode of a key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Major,
    Minor,
    Unknown,
}

/// A musical key: root pitch class and mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    /// Root pitch class, 0 (C) to 11 (B).
    pub root: u8,
    /// Major, minor or unknown.
    pub mode: Mode,
}

impl Key {
    /// Creates a key, wrapping the root into 0..12.
    pub const fn new(root: u8, mode: Mode) -> Self {
        Self {
            root: root % 12,
            mode,
        }
    }

    /// The key used before any analysis has run.
    pub const UNKNOWN: Key = Key::new(0, Mode::Unknown);

    /// Packs the key into one byte for atomic publication.
    pub fn to_bits(self) -> u8 {
        let mode = match self.mode {
            Mode::Major => 0,
            Mode::Minor => 1,
            Mode::Unknown => 2,
        };
        (mode << 4) | self.root
    }

    /// Unpacks a key produced by [`to_bits`](Self::to_bits).
    pub fn from_bits(bits: u8) -> Self {
        let mode = match bits >> 4 {
            0 => Mode::Major,
            1 => Mode::Minor,
            _ => Mode::Unknown,
        };
        Key::new(bits & 0x0F, mode)
    }
}

impl Default for Key {
    fn default() -> Self {
        Key::UNKNOWN
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = PITCH_NAMES[self.root as usize % 12];
        match self.mode {
            Mode::Major => write!(f, "{name} Major"),
            Mode::Minor => write!(f, "{name} Minor"),
            Mode::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Result of a key analysis: the best and second-best distinct keys.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KeyEstimate {
    pub best: Key,
    pub best_score: f64,
    pub second: Key,
    pub second_score: f64,
}

/// Builds a pitch-class histogram from a stream of note numbers.
pub fn pitch_class_histogram(notes: impl IntoIterator<Item = u8>) -> [f64; 12] {
    let mut histogram = [0.0; 12];
    for note in notes {
        histogram[(note % 12) as usize] += 1.0;
    }
    histogram
}

/// Pearson correlation of two 12-element series.
///
/// Returns None when either series has zero variance.
fn correlate(x: &[f64; 12], y: &[f64; 12]) -> Option<f64> {
    let mean_x = x.iter().sum::<f64>() / 12.0;
    let mean_y = y.iter().sum::<f64>() / 12.0;

    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }

    let den = (den_x * den_y).sqrt();
    (den > f64::EPSILON).then(|| num / den)
}

fn rotated(profile: &[f64; 12], root: usize) -> [f64; 12] {
    std::array::from_fn(|pc| profile[(pc + 12 - root) % 12])
}

/// Estimates the key of a pitch-class onset histogram.
///
/// Returns None when the histogram has no onsets or every pitch class has
/// the same count; callers keep their previous estimate in that case.
/// Ties are broken in favour of major keys, then lower roots.
pub fn estimate_key(histogram: &[f64; 12]) -> Option<KeyEstimate> {
    if histogram.iter().sum::<f64>() <= 0.0 {
        return None;
    }

    let mut best: Option<(Key, f64)> = None;
    let mut second: Option<(Key, f64)> = None;

    let candidates = (0..12)
        .map(|root| (Key::new(root as u8, Mode::Major), rotated(&MAJOR_PROFILE, root)))
        .chain((0..12).map(|root| (Key::new(root as u8, Mode::Minor), rotated(&MINOR_PROFILE, root))));

    for (key, profile) in candidates {
        let score = correlate(histogram, &profile)?;
        match best {
            Some((_, best_score)) if score <= best_score => {
                // A key tied with the best is never the runner-up
                if score < best_score && second.map_or(true, |(_, s)| score > s) {
                    second = Some((key, score));
                }
            }
            _ => {
                second = best;
                best = Some((key, score));
            }
        }
    }

    let (best, best_score) = best?;
    let (second, second_score) = second?;
    Some(KeyEstimate {
        best,
        best_score,
        second,
        second_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_major_triad() {
        let histogram = pitch_class_histogram([60, 64, 67]);
        let estimate = estimate_key(&histogram).unwrap();
        assert_eq!(estimate.best, Key::new(0, Mode::Major));
        assert_eq!(estimate.second, Key::new(4, Mode::Minor));
        assert!(estimate.best_score > estimate.second_score);
    }

    #[test]
    fn test_g_major_triad_across_octaves() {
        let histogram = pitch_class_histogram([43, 59, 74, 67]);
        let estimate = estimate_key(&histogram).unwrap();
        assert_eq!(estimate.best, Key::new(7, Mode::Major));
        assert_eq!(estimate.second, Key::new(7, Mode::Minor));
    }

    #[test]
    fn test_c_minor_scale_prefers_relative_major() {
        // C D Eb F G Ab Bb
        let histogram = pitch_class_histogram([60, 62, 63, 65, 67, 68, 70]);
        let estimate = estimate_key(&histogram).unwrap();
        assert_eq!(estimate.best, Key::new(3, Mode::Major));
        assert_eq!(estimate.second, Key::new(0, Mode::Minor));
    }

    #[test]
    fn test_second_guess_scores_below_best() {
        // Tritone pairs are transposition-symmetric, so every key ties with
        // the key six semitones away.
        let histogram = pitch_class_histogram([60, 66, 60, 66]);
        let estimate = estimate_key(&histogram).unwrap();
        assert!(estimate.second_score < estimate.best_score);
        assert_ne!(estimate.second, estimate.best);
    }

    #[test]
    fn test_empty_histogram_is_degenerate() {
        assert_eq!(estimate_key(&[0.0; 12]), None);
    }

    #[test]
    fn test_flat_histogram_is_degenerate() {
        assert_eq!(estimate_key(&[2.0; 12]), None);
    }

    #[test]
    fn test_key_bits_round_trip() {
        for key in [Key::new(11, Mode::Minor), Key::new(5, Mode::Major), Key::UNKNOWN] {
            assert_eq!(Key::from_bits(key.to_bits()), key);
        }
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::new(1, Mode::Minor).to_string(), "C# Minor");
        assert_eq!(Key::UNKNOWN.to_string(), "Unknown");
    }
}
