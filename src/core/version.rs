//! OS package version ordering
//!
//! Distribution package versions are not semver: `1.2.10`, `2.34`, `1.1.1k`
//! and `9.18.0` all occur. Versions compare segment by segment on `.`,
//! numerically where both segments are numbers. Missing trailing segments
//! count as zero, so `1.2` and `1.2.0` are equal.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A dotted, mostly numeric package version
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageVersion(String);

impl PackageVersion {
    /// Wrap a version string
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The version as written
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl From<&str> for PackageVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PackageVersion {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.segments();
        let mut right = other.segments();
        loop {
            let ordering = match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (Some(l), None) => compare_segment(l, "0"),
                (None, Some(r)) => compare_segment("0", r),
                (Some(l), Some(r)) => compare_segment(l, r),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
    }
}

/// Compare one version segment
///
/// Segments that are both numeric compare as integers. Otherwise the
/// leading digits compare numerically and the remaining suffix
/// lexicographically, so `1k` sorts after `1` and `1j`.
fn compare_segment(left: &str, right: &str) -> Ordering {
    let (left_num, left_rest) = split_numeric(left);
    let (right_num, right_rest) = split_numeric(right);
    compare_digits(left_num, right_num).then_with(|| left_rest.cmp(right_rest))
}

fn split_numeric(segment: &str) -> (&str, &str) {
    let end = segment
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(segment.len());
    segment.split_at(end)
}

/// Compare two digit strings of arbitrary length numerically
fn compare_digits(left: &str, right: &str) -> Ordering {
    let left = left.trim_start_matches('0');
    let right = right.trim_start_matches('0');
    left.len().cmp(&right.len()).then_with(|| left.cmp(right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::new(s)
    }

    #[test]
    fn test_numeric_segments_compare_numerically() {
        assert!(v("1.2.10") > v("1.2.9"));
        assert!(v("10.0") > v("9.99"));
        assert!(v("2.34") > v("2.4"));
    }

    #[test]
    fn test_missing_segments_are_zero() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert_eq!(v("1.2.0"), v("1.2"));
        assert!(v("1.2.1") > v("1.2"));
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(v("1.02"), v("1.2"));
        assert!(v("1.010") > v("1.9"));
    }

    #[test]
    fn test_alphanumeric_suffix() {
        assert!(v("1.1.1k") > v("1.1.1j"));
        assert!(v("1.1.1k") > v("1.1.1"));
        assert!(v("1.1.2") > v("1.1.1k"));
    }

    #[test]
    fn test_display_preserves_input() {
        assert_eq!(v("1.02").to_string(), "1.02");
    }

    proptest! {
        #[test]
        fn prop_ordering_is_antisymmetric(
            a in proptest::collection::vec(0u32..200, 1..5),
            b in proptest::collection::vec(0u32..200, 1..5),
        ) {
            let join = |parts: &[u32]| parts.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
            let left = v(&join(&a));
            let right = v(&join(&b));
            prop_assert_eq!(left.cmp(&right), right.cmp(&left).reverse());
        }

        #[test]
        fn prop_trailing_zero_is_equal(parts in proptest::collection::vec(0u32..1000, 1..5)) {
            let base = parts.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
            prop_assert_eq!(v(&base), v(&format!("{base}.0")));
        }
    }
}
