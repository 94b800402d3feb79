//! Checks on images read back from a chip.

/// Value of every byte of an erased EPROM
pub const ERASED: u8 = 0xFF;

/// Offset of the first programmed byte, `None` if the image is blank
pub fn blank_check(image: &[u8]) -> Option<usize> {
    image.iter().position(|b| *b != ERASED)
}

/// How a read-back byte differs from the intended one
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mismatch {
    /// Only needs bits cleared, programming again can fix it
    Writable,
    /// Needs a bit raised back to 1, only an erase can fix it
    Unwritable,
}

/// Classify a single byte, `None` when it matches
pub fn classify(expected: u8, actual: u8) -> Option<Mismatch> {
    if (actual ^ expected) & expected != 0 {
        Some(Mismatch::Unwritable)
    } else if actual != expected {
        Some(Mismatch::Writable)
    } else {
        None
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct VerifyReport {
    /// Bytes compared, the shorter of both images
    pub compared: usize,
    pub writable: usize,
    pub unwritable: usize,
    pub first_writable: Option<usize>,
    pub first_unwritable: Option<usize>,
    /// Images differ in length
    pub length_mismatch: bool,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.writable == 0 && self.unwritable == 0 && !self.length_mismatch
    }
}

/// Compare a chip image read back against the image that was written
pub fn verify(expected: &[u8], actual: &[u8]) -> VerifyReport {
    let mut report = VerifyReport {
        compared: expected.len().min(actual.len()),
        length_mismatch: expected.len() != actual.len(),
        ..Default::default()
    };

    for (offset, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        match classify(*e, *a) {
            Some(Mismatch::Unwritable) => {
                report.unwritable += 1;
                report.first_unwritable.get_or_insert(offset);
            }
            Some(Mismatch::Writable) => {
                report.writable += 1;
                report.first_writable.get_or_insert(offset);
            }
            None => (),
        }
    }

    report
}
