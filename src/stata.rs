//! Stata `.dta` files, releases 104 to 115 (binary header) and 117 to 119
//! (tagged header).

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

pub mod file;
pub mod values;

pub const RELEASES: &[u32] = &[104, 105, 108, 110, 111, 112, 113, 114, 115, 117, 118, 119];

/// Field sizes that change between format releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release(pub u32);

impl Release {
    pub fn is_tagged(self) -> bool {
        self.0 >= 117
    }

    /// Extended missing values `.a` to `.z` exist from 113 on.
    pub fn has_extended_missing(self) -> bool {
        self.0 >= 113
    }

    pub fn data_label_len(self) -> usize {
        if self.0 < 108 {
            32
        } else {
            81
        }
    }

    pub fn timestamp_len(self) -> usize {
        if self.0 < 105 {
            0
        } else {
            18
        }
    }

    pub fn name_len(self) -> usize {
        match self.0 {
            ..=109 => 9,
            110..=117 => 33,
            _ => 129,
        }
    }

    pub fn format_len(self) -> usize {
        match self.0 {
            ..=104 => 7,
            105..=113 => 12,
            114..=117 => 49,
            _ => 57,
        }
    }

    pub fn variable_label_len(self) -> usize {
        match self.0 {
            ..=107 => 32,
            108..=117 => 81,
            _ => 321,
        }
    }

    /// Width of the length word of an expansion field.
    pub fn expansion_len_size(self) -> usize {
        if self.0 < 110 {
            2
        } else {
            4
        }
    }

    /// Value-label tables before 106 are fixed 8-byte label arrays.
    pub fn has_old_value_labels(self) -> bool {
        self.0 < 106
    }

    pub fn encoding(self) -> &'static Encoding {
        if self.0 >= 118 {
            UTF_8
        } else {
            WINDOWS_1252
        }
    }
}
