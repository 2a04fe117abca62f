//! SPSS system files (`.sav`, `.zsav`) and portable files (`.por`).

pub mod por;
pub mod sav;

/// Value SPSS writes for system missing, unless a file says otherwise.
pub const SYSMIS: f64 = -f64::MAX;
