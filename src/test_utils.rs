//! Test utilities for property-based testing
//!
//! This module provides generators and helpers for proptest.

#[cfg(test)]
pub mod generators {
    use proptest::prelude::*;

    use crate::core::lock::{ArchLock, Architecture, LockFile, UnchangingContainerReference};
    use crate::core::package::{Packages, PinnedPackage};

    /// Generate a valid package name (lowercase alphanumeric with hyphens)
    pub fn package_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,20}[a-z0-9]?".prop_filter("Name must not be empty", |s| !s.is_empty())
    }

    /// Generate a dotted numeric package version
    pub fn package_version() -> impl Strategy<Value = String> {
        proptest::collection::vec(0u32..300, 1..4).prop_map(|parts| {
            parts
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(".")
        })
    }

    /// Generate a distribution release, possibly empty
    pub fn release() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[0-9]{1,2}\\.el[7-9]",
            "[0-9]ubuntu[0-9]\\.[0-9]",
            "r[0-9]{1,2}",
        ]
    }

    /// Generate a supported architecture
    pub fn architecture() -> impl Strategy<Value = Architecture> {
        prop_oneof![Just(Architecture::X86_64), Just(Architecture::Aarch64)]
    }

    /// Generate a pinned package
    pub fn pinned_package() -> impl Strategy<Value = PinnedPackage> {
        (package_name(), package_version(), release(), architecture()).prop_map(
            |(name, version, release, arch)| {
                PinnedPackage::new(name, version, release, arch.as_str())
            },
        )
    }

    /// Generate a list of pinned packages where names may repeat
    pub fn pinned_package_list() -> impl Strategy<Value = Vec<PinnedPackage>> {
        let names = prop_oneof![Just("jq"), Just("curl"), Just("bash"), Just("zlib")];
        proptest::collection::vec(
            (names, package_version(), release()).prop_map(|(name, version, release)| {
                PinnedPackage::new(name, version, release, "x86_64")
            }),
            0..12,
        )
    }

    /// Generate a package collection with unique names
    pub fn packages() -> impl Strategy<Value = Packages> {
        proptest::collection::btree_map(package_name(), pinned_package(), 0..8).prop_map(|map| {
            let unique = map
                .into_iter()
                .map(|(name, pkg)| PinnedPackage { name, ..pkg })
                .collect();
            Packages::new(unique).unwrap_or_default()
        })
    }

    /// Generate a valid SHA256 hash (64 hex characters)
    pub fn sha256_hash() -> impl Strategy<Value = String> {
        "[0-9a-f]{64}"
    }

    /// Generate a resolved base image reference
    pub fn container_reference() -> impl Strategy<Value = UnchangingContainerReference> {
        (
            "[a-z]{2,10}(/[a-z]{2,10})?",
            "v?[0-9]{1,2}(\\.[0-9]{1,2}){0,2}",
            sha256_hash(),
        )
            .prop_map(|(repo, tag, hash)| {
                UnchangingContainerReference::new(repo, tag, format!("sha256:{hash}"))
            })
    }

    /// Generate a lock file
    pub fn lock_file() -> impl Strategy<Value = LockFile> {
        proptest::collection::btree_map(
            architecture(),
            (packages(), proptest::option::of(container_reference())),
            0..3,
        )
        .prop_map(|entries| {
            let mut lock = LockFile::new();
            for (arch, (packages, base)) in entries {
                lock.insert(arch, ArchLock::new(packages, base));
            }
            lock
        })
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_package_name_generator(name in package_name()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }

        #[test]
        fn test_package_version_generator(version in package_version()) {
            for part in version.split('.') {
                prop_assert!(part.parse::<u32>().is_ok());
            }
        }

        #[test]
        fn test_sha256_hash_generator(hash in sha256_hash()) {
            prop_assert_eq!(hash.len(), 64);
            prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
