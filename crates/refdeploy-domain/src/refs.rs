//! Ref identifiers: `kind/id/arch/branch`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    App,
    Runtime,
}

impl RefKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefKind {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(Self::App),
            "runtime" => Ok(Self::Runtime),
            other => Err(DeployError::InvalidRef {
                value: other.to_string(),
                reason: "kind must be 'app' or 'runtime'".into(),
            }),
        }
    }
}

/// An installable unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    kind: RefKind,
    id: String,
    arch: String,
    branch: String,
}

impl Ref {
    pub fn new(
        kind: RefKind,
        id: impl Into<String>,
        arch: impl Into<String>,
        branch: impl Into<String>,
    ) -> Result<Self, DeployError> {
        let candidate = Self {
            kind,
            id: id.into(),
            arch: arch.into(),
            branch: branch.into(),
        };
        validate_id(&candidate.id).map_err(|reason| candidate.invalid(reason))?;
        validate_arch(&candidate.arch).map_err(|reason| candidate.invalid(reason))?;
        validate_branch(&candidate.branch).map_err(|reason| candidate.invalid(reason))?;
        Ok(candidate)
    }

    pub fn app(id: &str, arch: &str, branch: &str) -> Result<Self, DeployError> {
        Self::new(RefKind::App, id, arch, branch)
    }

    pub fn runtime(id: &str, arch: &str, branch: &str) -> Result<Self, DeployError> {
        Self::new(RefKind::Runtime, id, arch, branch)
    }

    fn invalid(&self, reason: String) -> DeployError {
        DeployError::InvalidRef {
            value: self.to_string(),
            reason,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RefKind {
        self.kind
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn arch(&self) -> &str {
        &self.arch
    }

    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    #[must_use]
    pub fn is_app(&self) -> bool {
        self.kind == RefKind::App
    }

    /// Same id/branch on a different architecture.
    #[must_use]
    pub fn with_arch(&self, arch: &str) -> Self {
        Self {
            arch: arch.to_string(),
            ..self.clone()
        }
    }

    /// Relative deployment base, `kind/id/arch/branch`.
    #[must_use]
    pub fn deploy_subdir(&self) -> std::path::PathBuf {
        [self.kind.as_str(), &self.id, &self.arch, &self.branch]
            .iter()
            .collect()
    }

    /// Parse the short runtime form used in metadata (`id/arch/branch`).
    pub fn parse_partial(kind: RefKind, value: &str) -> Result<Self, DeployError> {
        let parts: Vec<&str> = value.split('/').collect();
        match parts.as_slice() {
            [id, arch, branch] => Self::new(kind, *id, *arch, *branch),
            _ => Err(DeployError::InvalidRef {
                value: value.to_string(),
                reason: "expected id/arch/branch".into(),
            }),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.kind, self.id, self.arch, self.branch)
    }
}

impl FromStr for Ref {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [kind, id, arch, branch] = parts.as_slice() else {
            return Err(DeployError::InvalidRef {
                value: s.to_string(),
                reason: "expected kind/id/arch/branch".into(),
            });
        };
        Self::new(kind.parse()?, *id, *arch, *branch)
    }
}

/// A ref as advertised in a collection-addressed listing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub collection_id: Option<String>,
    pub reference: Ref,
}

/// Whether `value` is a full lowercase SHA-256 hex checksum.
#[must_use]
pub fn is_valid_checksum(value: &str) -> bool {
    value.len() == 64
        && !value.bytes().any(|b| b.is_ascii_uppercase())
        && hex::decode(value).is_ok()
}

fn validate_id(id: &str) -> Result<(), String> {
    if id.len() > 255 {
        return Err("id is longer than 255 characters".into());
    }
    let elements: Vec<&str> = id.split('.').collect();
    if elements.len() < 3 {
        return Err("id must contain at least 3 dot-separated elements".into());
    }
    let last = elements.len() - 1;
    for (index, element) in elements.iter().enumerate() {
        let Some(first) = element.chars().next() else {
            return Err("id contains an empty element".into());
        };
        if first.is_ascii_digit() {
            return Err("id elements must not start with a digit".into());
        }
        for c in element.chars() {
            let allowed = c.is_ascii_alphanumeric() || c == '_' || (c == '-' && index == last);
            if !allowed {
                return Err(format!("id contains invalid character '{c}'"));
            }
        }
    }
    Ok(())
}

fn validate_arch(arch: &str) -> Result<(), String> {
    if arch.is_empty() {
        return Err("arch is empty".into());
    }
    if let Some(c) = arch
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!("arch contains invalid character '{c}'"));
    }
    Ok(())
}

fn validate_branch(branch: &str) -> Result<(), String> {
    let Some(first) = branch.chars().next() else {
        return Err("branch is empty".into());
    };
    if first == '-' {
        return Err("branch must not start with '-'".into());
    }
    if let Some(c) = branch
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!("branch contains invalid character '{c}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_canonical_form() {
        let r: Ref = "app/org.test.App/x86_64/stable".parse().unwrap();
        assert_eq!(r.kind(), RefKind::App);
        assert_eq!(r.id(), "org.test.App");
        assert_eq!(r.to_string(), "app/org.test.App/x86_64/stable");
        assert_eq!(
            r.deploy_subdir(),
            std::path::PathBuf::from("app/org.test.App/x86_64/stable")
        );
    }

    #[test]
    fn rejects_malformed_refs() {
        for bad in [
            "app/org.test/x86_64/stable",
            "app/org.1test.App/x86_64/stable",
            "bundle/org.test.App/x86_64/stable",
            "app/org.test.App/x86 64/stable",
            "app/org.test.App/x86_64/-stable",
            "app/org.test.App/x86_64",
        ] {
            assert!(bad.parse::<Ref>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn partial_runtime_refs_parse() {
        let r = Ref::parse_partial(RefKind::Runtime, "org.test.Platform/x86_64/1.0").unwrap();
        assert_eq!(r.to_string(), "runtime/org.test.Platform/x86_64/1.0");
        assert_eq!(r.with_arch("i386").arch(), "i386");
    }

    #[test]
    fn checksums_are_lowercase_sha256_hex() {
        assert!(is_valid_checksum(&"ab".repeat(32)));
        assert!(!is_valid_checksum(&"AB".repeat(32)));
        assert!(!is_valid_checksum("abc"));
    }

    #[test]
    fn dash_is_only_allowed_in_last_id_element() {
        assert!(Ref::app("org.test.my-app", "x86_64", "stable").is_ok());
        assert!(Ref::app("org.my-test.app", "x86_64", "stable").is_err());
    }
}
