use super::ParseError;
use std::fmt;

/// Binary memory units understood by spark-submit and the JVM heap flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeUnit {
    Byte,
    Kibi,
    Mebi,
    Gibi,
    Tebi,
    Pebi,
}

impl SizeUnit {
    pub const ALL: [SizeUnit; 6] = [
        SizeUnit::Byte,
        SizeUnit::Kibi,
        SizeUnit::Mebi,
        SizeUnit::Gibi,
        SizeUnit::Tebi,
        SizeUnit::Pebi,
    ];

    /// single letter suffix, e.g. `k`. These are JVM `-Xmx` style, not `kb`
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Byte => "b",
            Self::Kibi => "k",
            Self::Mebi => "m",
            Self::Gibi => "g",
            Self::Tebi => "t",
            Self::Pebi => "p",
        }
    }

    pub fn bytes(self) -> u64 {
        1u64 << (10 * self as u32)
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix.to_ascii_lowercase().as_str() {
            "" | "b" | "byte" | "bytes" => Some(Self::Byte),
            "k" | "kb" | "kib" => Some(Self::Kibi),
            "m" | "mb" | "mib" => Some(Self::Mebi),
            "g" | "gb" | "gib" => Some(Self::Gibi),
            "t" | "tb" | "tib" => Some(Self::Tebi),
            "p" | "pb" | "pib" => Some(Self::Pebi),
            _ => None,
        }
    }
}

impl fmt::Display for SizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Parse a memory size such as `512`, `4k`, `2 GiB` or `1.5g` into bytes.
///
/// All units are binary. A bare number is a byte count. Fractional
/// magnitudes are truncated to whole bytes after scaling.
pub fn parse_size(raw: &str) -> Result<u64, ParseError> {
    let trimmed = raw.trim();
    let invalid = || ParseError::InvalidSize(raw.to_string());

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(invalid());
    }

    let unit = SizeUnit::from_suffix(suffix.trim_start()).ok_or_else(invalid)?;

    match number.split_once('.') {
        None => number
            .parse::<u64>()
            .ok()
            .and_then(|value| value.checked_mul(unit.bytes()))
            .ok_or_else(invalid),
        Some((_, fraction)) if fraction.contains('.') => Err(invalid()),
        Some(_) => {
            let value = number.parse::<f64>().map_err(|_| invalid())? * unit.bytes() as f64;

            if value.is_finite() && value < u64::MAX as f64 {
                Ok(value as u64)
            } else {
                Err(invalid())
            }
        }
    }
}

/// Format a byte count with an integral magnitude and a unit suffix.
///
/// Without a forced unit the largest unit that divides the count exactly is
/// chosen, so `parse_size` always gives the same count back: `4g`, `1025b`,
/// `4319744k`. A forced unit is ignored once the magnitude would drop below
/// 1024 or become inexact with at most four digits, so
/// `format_size(4 GiB, Some(Tebi))` is still `4g`. Forced magnitudes are
/// truncated, never rounded up, so a formatted value never exceeds the
/// input.
pub fn format_size(num_bytes: u64, unit: Option<SizeUnit>) -> String {
    let Some(unit) = unit else {
        let exact = SizeUnit::ALL
            .iter()
            .rev()
            .copied()
            .find(|unit| num_bytes >= unit.bytes() && num_bytes % unit.bytes() == 0)
            .unwrap_or(SizeUnit::Byte);

        return format!("{}{}", num_bytes / exact.bytes(), exact);
    };

    let mut divisor = 1u64;

    for candidate in &SizeUnit::ALL[..5] {
        let exact = num_bytes % divisor == 0;

        if *candidate == unit
            || num_bytes < 1024 * divisor
            || (!exact && num_bytes <= 9999 * divisor)
        {
            return format!("{}{}", num_bytes / divisor, candidate);
        }

        divisor *= 1024;
    }

    format!("{}{}", num_bytes / divisor, SizeUnit::Pebi)
}

/// Like `format_size` but for values computed in floating point, which
/// must still represent a whole, non-negative number of bytes.
pub fn format_size_checked(num_bytes: f64, unit: Option<SizeUnit>) -> Result<String, ParseError> {
    if !num_bytes.is_finite()
        || num_bytes < 0.0
        || num_bytes.fract() != 0.0
        || num_bytes >= u64::MAX as f64
    {
        return Err(ParseError::NonIntegralBytes(num_bytes));
    }

    Ok(format_size(num_bytes as u64, unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;
    const PIB: u64 = TIB * 1024;

    #[test]
    fn format_chooses_unit() {
        assert_eq!(format_size(0, None), "0b");
        assert_eq!(format_size(5, None), "5b");
        assert_eq!(format_size(KIB, None), "1k");
        assert_eq!(format_size(10 * KIB, None), "10k");
        assert_eq!(format_size(MIB, None), "1m");
        assert_eq!(format_size(22 * MIB, None), "22m");
        assert_eq!(format_size(4 * GIB, None), "4g");
        assert_eq!(format_size(4218 * MIB + 512 * KIB, None), "4319744k");
        assert_eq!(format_size(4 * TIB, None), "4t");
        assert_eq!(format_size(4218 * GIB, None), "4218g");
        assert_eq!(format_size(4 * PIB, None), "4p");
        assert_eq!(format_size(4096 * PIB, None), "4096p");
        assert_eq!(format_size(1025, None), "1025b");
    }

    #[test]
    fn format_forced_unit() {
        assert_eq!(format_size(4 * GIB, Some(SizeUnit::Byte)), "4294967296b");
        assert_eq!(format_size(4 * GIB, Some(SizeUnit::Kibi)), "4194304k");
        assert_eq!(format_size(4 * GIB, Some(SizeUnit::Mebi)), "4096m");
        assert_eq!(format_size(4 * GIB, Some(SizeUnit::Gibi)), "4g");
        assert_eq!(format_size(4 * GIB, Some(SizeUnit::Tebi)), "4g");
        assert_eq!(format_size(4 * GIB, Some(SizeUnit::Pebi)), "4g");
        assert_eq!(format_size(4 * PIB, Some(SizeUnit::Tebi)), "4096t");
        assert_eq!(format_size(4 * PIB, Some(SizeUnit::Pebi)), "4p");
        // kibibyte rounding truncates
        assert_eq!(format_size(12000, Some(SizeUnit::Kibi)), "11k");
    }

    #[test]
    fn format_rejects_fractional_bytes() {
        assert!(matches!(
            format_size_checked(GIB as f64 * 4.12, None),
            Err(ParseError::NonIntegralBytes(_))
        ));
        assert!(format_size_checked(-1.0, None).is_err());
        assert!(format_size_checked(f64::NAN, None).is_err());
        assert_eq!(format_size_checked(2048.0, None).unwrap(), "2k");
    }

    #[test]
    fn parse_units() {
        assert_eq!(parse_size("4").unwrap(), 4);
        assert_eq!(parse_size("4b").unwrap(), 4);
        assert_eq!(parse_size("4k").unwrap(), 4 * KIB);
        assert_eq!(parse_size("4KB").unwrap(), 4 * KIB);
        assert_eq!(parse_size("4 KiB").unwrap(), 4 * KIB);
        assert_eq!(parse_size("250mb").unwrap(), 250 * MIB);
        assert_eq!(parse_size("2g").unwrap(), 2 * GIB);
        assert_eq!(parse_size("3t").unwrap(), 3 * TIB);
        assert_eq!(parse_size("1p").unwrap(), PIB);
        assert_eq!(parse_size("1.5k").unwrap(), 1536);
    }

    #[test]
    fn parse_rejects_garbage() {
        for raw in ["", "k", "oops", "7oops", "4;5", "1.2.3k", ".5k", "5.k", "4 x"] {
            assert!(parse_size(raw).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn sizes_round_trip() {
        let samples = [
            0,
            1,
            1023,
            KIB,
            3 * KIB,
            1023 * KIB,
            MIB,
            512 * MIB,
            7 * GIB,
            9 * TIB,
            2 * PIB,
            9999 * PIB,
            1025,
            1_000_000,
            4_424_509_931,
            GIB + 1,
            3 * TIB + 7 * KIB,
            u64::MAX,
        ];

        for bytes in samples {
            let formatted = format_size(bytes, None);
            assert_eq!(parse_size(&formatted).unwrap(), bytes, "{formatted}");
        }
    }
}
