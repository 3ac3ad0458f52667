//! In-band DTMF tone generation.
//!
//! A tone is rendered as 45ms of silence, 150ms of the tone's two summed
//! sinusoids and another 45ms of silence.

use std::f64::consts::PI;
use std::fmt;

use crate::format::SampleDepth;

/// Duration of the tone itself, in milliseconds.
const TONE_DURATION_MS: usize = 150;

/// Silence before and after the tone, in milliseconds.
const INTER_DIGIT_INTERVAL_MS: usize = 45;

const ROW_FREQUENCIES: [f64; 4] = [697.0, 770.0, 852.0, 941.0];
const COLUMN_FREQUENCIES: [f64; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// One of the sixteen DTMF keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfTone {
    /// Key `0`.
    Digit0,
    /// Key `1`.
    Digit1,
    /// Key `2`.
    Digit2,
    /// Key `3`.
    Digit3,
    /// Key `4`.
    Digit4,
    /// Key `5`.
    Digit5,
    /// Key `6`.
    Digit6,
    /// Key `7`.
    Digit7,
    /// Key `8`.
    Digit8,
    /// Key `9`.
    Digit9,
    /// Key `*`.
    Star,
    /// Key `#`.
    Pound,
    /// Key `A`.
    A,
    /// Key `B`.
    B,
    /// Key `C`.
    C,
    /// Key `D`.
    D,
}

impl DtmfTone {
    /// Row and column index on the keypad grid.
    fn grid(self) -> (usize, usize) {
        match self {
            Self::Digit1 => (0, 0),
            Self::Digit2 => (0, 1),
            Self::Digit3 => (0, 2),
            Self::A => (0, 3),
            Self::Digit4 => (1, 0),
            Self::Digit5 => (1, 1),
            Self::Digit6 => (1, 2),
            Self::B => (1, 3),
            Self::Digit7 => (2, 0),
            Self::Digit8 => (2, 1),
            Self::Digit9 => (2, 2),
            Self::C => (2, 3),
            Self::Star => (3, 0),
            Self::Digit0 => (3, 1),
            Self::Pound => (3, 2),
            Self::D => (3, 3),
        }
    }

    /// Low (row) and high (column) frequencies in Hz.
    pub fn frequencies(self) -> (f64, f64) {
        let (row, column) = self.grid();
        (ROW_FREQUENCIES[row], COLUMN_FREQUENCIES[column])
    }

    /// The keypad character.
    pub fn as_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    /// Number of frames [`render_into`](Self::render_into) produces at a rate.
    pub fn frame_count(sample_rate: u32) -> usize {
        let khz = (sample_rate / 1000) as usize;
        khz * (INTER_DIGIT_INTERVAL_MS * 2 + TONE_DURATION_MS)
    }

    /// Renders the tone as interleaved samples, replacing `out`.
    ///
    /// Every channel of a frame carries the same value. Amplitude is scaled
    /// to `2^(bits-1) - 1` for the given depth.
    pub fn render_into(self, sample_rate: u32, depth: SampleDepth, channels: u16, out: &mut Vec<i32>) {
        let khz = (sample_rate / 1000) as usize;
        let lead = khz * INTER_DIGIT_INTERVAL_MS;
        let tone_end = lead + khz * TONE_DURATION_MS;
        let frames = Self::frame_count(sample_rate);
        let channels = usize::from(channels.max(1));

        let (f1, f2) = self.frequencies();
        let rate = f64::from(sample_rate);
        let u1 = 2.0 * PI * f1 / rate;
        let u2 = 2.0 * PI * f2 / rate;
        let amplitude = depth.max_sample() as f64;

        out.clear();
        out.resize(frames * channels, 0);
        for n in lead..tone_end {
            let x = n as f64;
            let value = ((u1 * x).sin() * 0.5 + (u2 * x).sin() * 0.5) * amplitude;
            let sample = value as i32;
            out[n * channels..(n + 1) * channels].fill(sample);
        }
    }

    /// Renders the tone into a new buffer.
    pub fn render(self, sample_rate: u32, depth: SampleDepth, channels: u16) -> Vec<i32> {
        let mut out = Vec::new();
        self.render_into(sample_rate, depth, channels, &mut out);
        out
    }
}

impl TryFrom<char> for DtmfTone {
    type Error = char;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        Ok(match c.to_ascii_uppercase() {
            '0' => Self::Digit0,
            '1' => Self::Digit1,
            '2' => Self::Digit2,
            '3' => Self::Digit3,
            '4' => Self::Digit4,
            '5' => Self::Digit5,
            '6' => Self::Digit6,
            '7' => Self::Digit7,
            '8' => Self::Digit8,
            '9' => Self::Digit9,
            '*' => Self::Star,
            '#' => Self::Pound,
            'A' => Self::A,
            'B' => Self::B,
            'C' => Self::C,
            'D' => Self::D,
            other => return Err(other),
        })
    }
}

impl fmt::Display for DtmfTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}
