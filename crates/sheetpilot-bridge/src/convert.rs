//! Excel constants to and from client values. Pure functions, so they are
//! tested on every platform.

#![cfg_attr(not(windows), allow(dead_code))]

use sheetpilot_protocol::{Alignment, CellError, HorizontalAlignment, VerticalAlignment};

/// `CVErr` number to write for an error cell.
pub fn cverr_for(error: &CellError) -> Result<i32, String> {
    error
        .xl_code()
        .ok_or_else(|| format!("Cannot write unknown error value {:?}", error.code))
}

/// Error cell for a `CVErr` number read back from Excel.
pub fn error_for(number: i32) -> Result<CellError, String> {
    CellError::from_xl_code(number).ok_or_else(|| format!("Unknown Excel error value {number}"))
}

pub fn alignment_from_xl(horizontal: i32, vertical: i32) -> Result<Alignment, String> {
    let h = HorizontalAlignment::from_xl_constant(horizontal)
        .ok_or_else(|| format!("Unknown horizontal alignment constant {horizontal}"))?;
    let v = VerticalAlignment::from_xl_constant(vertical)
        .ok_or_else(|| format!("Unknown vertical alignment constant {vertical}"))?;
    Ok(Alignment::new(h, v))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_error_cells_use_cverr_numbers() {
        assert_eq!(cverr_for(&CellError::new("#DIV/0!")), Ok(2007));
        assert_eq!(cverr_for(&CellError::new("#n/a")), Ok(2042));
        assert_eq!(error_for(2023), Ok(CellError::new("#REF!")));
    }

    #[test]
    fn test_unknown_error_values_fail() {
        let err = cverr_for(&CellError::new("#BOGUS")).unwrap_err();
        assert!(err.contains("#BOGUS"), "{err}");
        assert!(error_for(1999).is_err());
    }

    #[test]
    fn test_alignment_constants() {
        // xlLeft, xlTop
        assert_eq!(
            alignment_from_xl(-4131, -4160),
            Ok(Alignment::new(HorizontalAlignment::Left, VerticalAlignment::Top))
        );
    }

    #[test]
    fn test_unknown_alignment_constant_fails() {
        let err = alignment_from_xl(12345, -4160).unwrap_err();
        assert_eq!(err, "Unknown horizontal alignment constant 12345");
        assert!(alignment_from_xl(-4131, 0).is_err());
    }
}
