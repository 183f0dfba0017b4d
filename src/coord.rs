/// Zero-omission mode from the %FS (Format Specification) command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroOmission {
    /// `L`: leading zeros may be omitted (the common case).
    Leading,
    /// `T`: trailing zeros may be omitted; short literals are right-padded
    /// before conversion.
    Trailing,
}

/// Coordinate notation from the %FS command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notation {
    Absolute,
    Incremental,
}

/// Unit system from the %MO command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Inches,
    Millimeters,
}

/// Coordinate format from the %FS command.
///
/// Example: `%FSLAX24Y24*%` means leading-zero omission, absolute notation,
/// 2 integer digits + 4 decimal digits for both X and Y. The X and Y digit
/// counts must agree; that is validated at parse time, so a single pair is
/// stored here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateFormat {
    pub integer_digits: u8,
    pub decimal_digits: u8,
    pub zero_omission: ZeroOmission,
    pub notation: Notation,
}

impl CoordinateFormat {
    /// The smallest representable coordinate increment, `10^-decimals`.
    pub fn precision(&self) -> f64 {
        10f64.powi(-(self.decimal_digits as i32))
    }

    /// Convert a raw coordinate literal (optional sign plus digits) to a
    /// value in file units.
    ///
    /// With trailing-zero omission, literals shorter than
    /// `integer_digits + decimal_digits` are right-padded with `'0'` before
    /// conversion. Literals longer than the format allows are rejected.
    pub fn scale_literal(&self, literal: &str) -> Result<f64, String> {
        let (negative, digits) = match literal.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, literal.strip_prefix('+').unwrap_or(literal)),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("malformed coordinate literal `{literal}`"));
        }

        let total = (self.integer_digits + self.decimal_digits) as usize;
        if digits.len() > total {
            return Err(format!(
                "coordinate literal `{literal}` has {} digits but the format allows {total}",
                digits.len()
            ));
        }

        let padded;
        let digits = match self.zero_omission {
            ZeroOmission::Leading => digits,
            ZeroOmission::Trailing => {
                padded = format!("{digits:0<total$}");
                &padded
            }
        };

        // Total digit count is bounded by 14, so this cannot overflow i64.
        let value: i64 = digits.parse().map_err(|_| {
            format!("malformed coordinate literal `{literal}`")
        })?;
        let value = value as f64 * self.precision();
        Ok(if negative { -value } else { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn format_24(zero_omission: ZeroOmission) -> CoordinateFormat {
        CoordinateFormat {
            integer_digits: 2,
            decimal_digits: 4,
            zero_omission,
            notation: Notation::Absolute,
        }
    }

    #[test]
    fn test_leading_omission_scale() {
        let fmt = format_24(ZeroOmission::Leading);
        assert_relative_eq!(fmt.scale_literal("10000").unwrap(), 1.0);
        assert_relative_eq!(fmt.scale_literal("123").unwrap(), 0.0123);
        assert_relative_eq!(fmt.scale_literal("-25000").unwrap(), -2.5);
        assert_relative_eq!(fmt.scale_literal("0").unwrap(), 0.0);
    }

    #[test]
    fn test_trailing_omission_pads_right() {
        let fmt = format_24(ZeroOmission::Trailing);
        // Total width is 6, so "123" pads to "123000" = 12.3 in 2.4 format.
        assert_relative_eq!(fmt.scale_literal("123").unwrap(), 12.3);
        assert_relative_eq!(fmt.scale_literal("-5").unwrap(), -50.0);
        // A full-width literal is unchanged.
        assert_relative_eq!(fmt.scale_literal("123456").unwrap(), 12.3456);
    }

    #[test]
    fn test_precision() {
        assert_relative_eq!(format_24(ZeroOmission::Leading).precision(), 1e-4);
        let fmt = CoordinateFormat {
            integer_digits: 3,
            decimal_digits: 6,
            zero_omission: ZeroOmission::Leading,
            notation: Notation::Absolute,
        };
        assert_relative_eq!(fmt.precision(), 1e-6);
    }

    #[test]
    fn test_too_many_digits_rejected() {
        let fmt = format_24(ZeroOmission::Leading);
        assert!(fmt.scale_literal("1234567").is_err());
    }

    #[test]
    fn test_zero_width_format_rejects_any_digit() {
        let fmt = CoordinateFormat {
            integer_digits: 0,
            decimal_digits: 0,
            zero_omission: ZeroOmission::Leading,
            notation: Notation::Absolute,
        };
        assert!(fmt.scale_literal("1").is_err());
    }

    #[test]
    fn test_malformed_literals_rejected() {
        let fmt = format_24(ZeroOmission::Leading);
        assert!(fmt.scale_literal("").is_err());
        assert!(fmt.scale_literal("-").is_err());
        assert!(fmt.scale_literal("1.5").is_err());
    }

    #[test]
    fn test_scale_round_trip() {
        // For every literal V in a (d, f) format, scale(V) == V * 10^-f.
        let fmt = CoordinateFormat {
            integer_digits: 3,
            decimal_digits: 5,
            zero_omission: ZeroOmission::Leading,
            notation: Notation::Absolute,
        };
        for v in [0i64, 1, 99, 12345, -98765, 10000000] {
            let literal = v.to_string();
            assert_relative_eq!(
                fmt.scale_literal(&literal).unwrap(),
                v as f64 * 1e-5,
                max_relative = 1e-12
            );
        }
    }
}
