//! Changes to roll out, and the concrete versions a job runs with.

use crate::application::{Application, Deployment};
use crate::version::{RevisionId, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A platform upgrade and/or an application revision an instance is rolling out.
///
/// A pinned change prevents the platform from being changed or removed by new changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub platform: Option<Version>,
    #[serde(default)]
    pub revision: Option<RevisionId>,
    #[serde(default)]
    pub pinned: bool,
}

impl Change {
    /// A change with no targets, and no pin.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of_platform(platform: Version) -> Self {
        Self::empty().with_platform(platform)
    }

    pub fn of_revision(revision: RevisionId) -> Self {
        Self::empty().with_revision(revision)
    }

    /// Whether this has a platform or a revision to roll out.
    pub fn has_targets(&self) -> bool {
        self.platform.is_some() || self.revision.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether this is both without targets and without a pin.
    pub fn is_empty(&self) -> bool {
        !self.has_targets() && !self.pinned
    }

    pub fn with_platform(mut self, platform: Version) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_revision(mut self, revision: RevisionId) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn without_platform(&self) -> Self {
        Self {
            platform: None,
            ..self.clone()
        }
    }

    pub fn without_revision(&self) -> Self {
        Self {
            revision: None,
            ..self.clone()
        }
    }

    pub fn with_pin(&self) -> Self {
        Self {
            pinned: true,
            ..self.clone()
        }
    }

    pub fn without_pin(&self) -> Self {
        Self {
            pinned: false,
            ..self.clone()
        }
    }

    /// This change, with any part it lacks taken from `other`. Pinned if either is.
    pub fn on_top_of(&self, other: &Change) -> Self {
        Self {
            platform: self.platform.clone().or_else(|| other.platform.clone()),
            revision: self.revision.or(other.revision),
            pinned: self.pinned || other.pinned,
        }
    }

    /// Whether this has a platform newer than the given one.
    pub fn upgrades_platform(&self, version: &Version) -> bool {
        self.platform.as_ref().is_some_and(|platform| platform > version)
    }

    /// Whether this has a revision newer than the given one.
    pub fn upgrades_revision(&self, revision: &RevisionId) -> bool {
        self.revision.is_some_and(|own| own > *revision)
    }

    pub fn downgrades_platform(&self, version: &Version) -> bool {
        self.platform.as_ref().is_some_and(|platform| platform < version)
    }

    pub fn downgrades_revision(&self, revision: &RevisionId) -> bool {
        self.revision.is_some_and(|own| own < *revision)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.pinned {
            parts.push("pin".to_string());
        }
        if let Some(platform) = &self.platform {
            parts.push(format!("upgrade to {platform}"));
        }
        if let Some(revision) = &self.revision {
            parts.push(format!("revision change to {revision}"));
        }
        if parts.is_empty() {
            f.write_str("no change")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Source and target versions for a job run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Versions {
    pub target_platform: Version,
    pub target_revision: RevisionId,
    #[serde(default)]
    pub source_platform: Option<Version>,
    #[serde(default)]
    pub source_revision: Option<RevisionId>,
}

impl Versions {
    pub fn new(
        target_platform: Version,
        target_revision: RevisionId,
        source_platform: Option<Version>,
        source_revision: Option<RevisionId>,
    ) -> Self {
        Self {
            target_platform,
            target_revision,
            source_platform,
            source_revision,
        }
    }

    /// Versions to run the given change with, against the given existing deployment.
    ///
    /// Targets never go below what is already deployed, unless the change is a pinned platform.
    /// Missing parts fall back to the oldest deployed in production, then to `default_platform`
    /// and the latest submission, respectively.
    pub fn from(
        change: &Change,
        application: &Application,
        deployment: Option<&Deployment>,
        default_platform: &Version,
    ) -> Self {
        let target_platform = match (&change.platform, change.pinned) {
            (Some(platform), true) => platform.clone(),
            _ => max(change.platform.clone(), deployment.map(|d| d.platform.clone()))
                .or_else(|| application.oldest_deployed_platform())
                .unwrap_or_else(|| default_platform.clone()),
        };
        let target_revision = max(change.revision, deployment.map(|d| d.revision))
            .or_else(|| application.oldest_deployed_revision())
            .or(application.latest_revision)
            .unwrap_or(RevisionId::INITIAL);

        Self {
            target_platform,
            target_revision,
            source_platform: deployment.map(|d| d.platform.clone()),
            source_revision: deployment.map(|d| d.revision),
        }
    }

    pub fn targets_match(&self, other: &Versions) -> bool {
        self.target_platform == other.target_platform
            && self.target_revision == other.target_revision
    }

    /// Whether the sources of this and `other` agree, wherever both have one.
    pub fn sources_match_if_present(&self, other: &Versions) -> bool {
        let platform = match (&self.source_platform, &other.source_platform) {
            (Some(own), Some(theirs)) => own == theirs,
            _ => true,
        };
        let revision = match (&self.source_revision, &other.source_revision) {
            (Some(own), Some(theirs)) => own == theirs,
            _ => true,
        };
        platform && revision
    }
}

impl fmt::Display for Versions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform {}", self.target_platform)?;
        if let Some(source) = &self.source_platform {
            write!(f, " <-- {source}")?;
        }
        write!(f, ", revision {}", self.target_revision)?;
        if let Some(source) = &self.source_revision {
            write!(f, " <-- {source}")?;
        }
        Ok(())
    }
}

fn max<T: Ord>(first: Option<T>, second: Option<T>) -> Option<T> {
    match (first, second) {
        (Some(first), Some(second)) => Some(first.max(second)),
        (first, second) => first.or(second),
    }
}
