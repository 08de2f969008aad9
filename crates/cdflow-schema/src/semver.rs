use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid version '{0}', expected [v]MAJOR[.MINOR[.PATCH]]")]
pub struct SemverError(pub String);

/// A `MAJOR.MINOR.PATCH` triple. Missing minor or patch parts read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Semver {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Semver {
    type Err = SemverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_semver(s)
    }
}

/// Parse `[v]MAJOR[.MINOR[.PATCH]]`.
///
/// Every part is a non-negative decimal integer; a part with more than one
/// digit may not start with `0`. Anything else, including trailing text, is
/// rejected.
pub fn parse_semver(input: &str) -> Result<Semver, SemverError> {
    let invalid = || SemverError(input.to_owned());
    let body = input.strip_prefix('v').unwrap_or(input);
    let mut parts = [0u64; 3];
    let mut count = 0;
    for part in body.split('.') {
        if count == parts.len() {
            return Err(invalid());
        }
        parts[count] = parse_part(part).ok_or_else(invalid)?;
        count += 1;
    }
    Ok(Semver::new(parts[0], parts[1], parts[2]))
}

fn parse_part(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_full_and_partial_versions() {
        assert_eq!(parse_semver("1.2.3"), Ok(Semver::new(1, 2, 3)));
        assert_eq!(parse_semver("v1.2.3"), Ok(Semver::new(1, 2, 3)));
        assert_eq!(parse_semver("v10.20"), Ok(Semver::new(10, 20, 0)));
        assert_eq!(parse_semver("7"), Ok(Semver::new(7, 0, 0)));
        assert_eq!(parse_semver("0.0.0"), Ok(Semver::new(0, 0, 0)));
    }

    #[test]
    fn rejects_leading_zeros_on_multi_digit_parts() {
        assert!(parse_semver("01").is_err());
        assert!(parse_semver("1.02").is_err());
        assert!(parse_semver("1.2.003").is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        for input in [
            "", "v", "1.", ".1", "1..2", "1.2.3.4", "a.b.c", "-1", "1.2.3-rc1", "V1", "1.2.x",
            " 1",
        ] {
            assert!(parse_semver(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_semver("99999999999999999999999").is_err());
    }

    #[test]
    fn roundtrips_generated_inputs() {
        for major in [0u64, 1, 9, 10, 123] {
            for minor in [0u64, 5, 42] {
                for patch in [0u64, 7, 100] {
                    let full = format!("v{major}.{minor}.{patch}");
                    assert_eq!(
                        parse_semver(&full),
                        Ok(Semver::new(major, minor, patch))
                    );
                    let short = format!("{major}.{minor}");
                    assert_eq!(parse_semver(&short), Ok(Semver::new(major, minor, 0)));
                }
            }
        }
    }

    #[test]
    fn orders_numerically() {
        assert!(parse_semver("0.15").unwrap() > parse_semver("0.14.11").unwrap());
        assert!(parse_semver("1.0").unwrap() >= Semver::new(0, 15, 0));
        assert!(parse_semver("0.9.9").unwrap() < Semver::new(0, 15, 0));
    }

    #[test]
    fn displays_triple() {
        assert_eq!(Semver::new(1, 2, 0).to_string(), "1.2.0");
    }
}
