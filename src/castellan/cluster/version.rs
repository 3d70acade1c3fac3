/*
 * Copyright (C) 2026 The Castellan Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::castellan::util::error::with_context;
use std::error::Error;
use std::fmt;

/// Versioned cluster information: the container image reference a
/// component runs, with its tag parsed as semver for comparisons.
///
/// Image tags cannot contain `+`, so build metadata is carried with
/// `_` on the wire and substituted during parsing; the original tag is
/// preserved so the image reference round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    repo: String,
    tag: String,
    semver: semver::Version,
}

impl Version {
    /// Parses a version from a container image reference, splitting at
    /// the last `:`. A reference without a repository is just a tag.
    pub fn parse_from_image(image: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let (repo, tag) = match image.rsplit_once(':') {
            Some((repo, tag)) => (repo.to_string(), tag.to_string()),
            None => (String::new(), image.to_string()),
        };

        let normalized = tag.replace('_', "+");
        let normalized = normalized.strip_prefix('v').unwrap_or(&normalized);
        let semver = semver::Version::parse(normalized)
            .map_err(|err| with_context(err, format!("unable to parse version: {image}")))?;

        Ok(Self { repo, tag, semver })
    }

    pub fn semver(&self) -> &semver::Version {
        &self.semver
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The image reference this version was parsed from. The inverse
    /// of [`Version::parse_from_image`].
    pub fn image_string(&self) -> String {
        if self.repo.is_empty() {
            self.tag.clone()
        } else {
            format!("{}:{}", self.repo, self.tag)
        }
    }

    /// Version equality for update purposes: the repository is ignored
    /// so registry-mirror migrations do not read as version changes.
    pub fn same_version(&self, other: &Version) -> bool {
        self.semver == other.semver
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.image_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repo_and_tag() {
        let version = Version::parse_from_image("quay.io/coreos/hyperkube:v1.2.3").expect("parse");
        assert_eq!(version.repo(), "quay.io/coreos/hyperkube");
        assert_eq!(version.tag(), "v1.2.3");
        assert_eq!(version.semver(), &semver::Version::parse("1.2.3").unwrap());
    }

    #[test]
    fn reference_without_repo_is_a_bare_tag() {
        let version = Version::parse_from_image("v1.3.0").expect("parse");
        assert_eq!(version.repo(), "");
        assert_eq!(version.image_string(), "v1.3.0");
    }

    #[test]
    fn splits_at_last_colon() {
        let version = Version::parse_from_image("registry:5000/img:v1.2.3").expect("parse");
        assert_eq!(version.repo(), "registry:5000/img");
        assert_eq!(version.tag(), "v1.2.3");
    }

    #[test]
    fn underscore_becomes_build_metadata() {
        let version = Version::parse_from_image("img:v1.2.3-rc.1_20240101").expect("parse");
        assert_eq!(
            version.semver(),
            &semver::Version::parse("1.2.3-rc.1+20240101").unwrap()
        );

        let newer = Version::parse_from_image("img:v1.3.0").expect("parse");
        assert!(newer.semver() > version.semver());
    }

    #[test]
    fn image_reference_round_trips() {
        for reference in [
            "quay.io/coreos/hyperkube:v1.2.3",
            "img:v1.2.3-rc.1_20240101",
            "v1.0.0",
        ] {
            let version = Version::parse_from_image(reference).expect("parse");
            assert_eq!(version.image_string(), reference);
            let reparsed = Version::parse_from_image(&version.image_string()).expect("reparse");
            assert_eq!(reparsed, version);
        }
    }

    #[test]
    fn same_version_ignores_repo() {
        let a = Version::parse_from_image("registry-a/img:v1.2.3").expect("parse");
        let b = Version::parse_from_image("registry-b/mirror:v1.2.3").expect("parse");
        assert!(a.same_version(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_unparseable_tags() {
        assert!(Version::parse_from_image("img:latest").is_err());
        assert!(Version::parse_from_image("img:").is_err());
    }
}
