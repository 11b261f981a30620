//! Canonical target labels.

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// A canonical target label of the form `//relative/dir:name`.
///
/// The package part is a forward-slash relative directory under the workspace
/// root (possibly empty for the root package); the name identifies one target
/// within that package. Labels are the identity of targets everywhere in the
/// engine: node lookups, fingerprints, and event correlation all key on the
/// canonical string form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("//{package}:{name}")]
#[serde(try_from = "String", into = "String")]
pub struct Label {
    package: String,
    name: String,
}

impl Label {
    /// Parse a label from its canonical form.
    pub fn parse(text: impl AsRef<str>) -> Result<Self, GraphError> {
        let text = text.as_ref();
        let invalid = |reason: &str| GraphError::InvalidLabel {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let rest = text.strip_prefix("//").ok_or_else(|| invalid("must start with //"))?;
        let (package, name) = rest
            .split_once(':')
            .ok_or_else(|| invalid("must contain a : separating package and name"))?;

        if name.is_empty() {
            return Err(invalid("target name cannot be empty"));
        }
        if name.contains([':', '/']) {
            return Err(invalid("target name cannot contain : or /"));
        }
        if package.starts_with('/') || package.ends_with('/') {
            return Err(invalid("package cannot start or end with /"));
        }
        for segment in package.split('/').filter(|segment| !segment.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(invalid("package cannot contain . or .. segments"));
            }
        }
        if package.contains("//") {
            return Err(invalid("package cannot contain empty segments"));
        }

        Ok(Self {
            package: package.to_string(),
            name: name.to_string(),
        })
    }

    /// The package directory, relative to the workspace root.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The target name within the package.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for Label {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Label {
    type Error = GraphError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.to_string()
    }
}

impl AsRef<Label> for Label {
    fn as_ref(&self) -> &Label {
        self
    }
}

impl Label {
    /// Parse a label, panicking on failure.
    ///
    /// Intended for literals in tests and examples.
    pub fn must(text: impl AsRef<str>) -> Self {
        let text = text.as_ref();
        Self::parse(text).unwrap_or_else(|err| panic!("parse label {text:?}: {err}"))
    }
}
