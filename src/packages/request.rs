//! Resolution request, response and cache key

use crate::graph::PackageId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Target platform and build tags
///
/// Empty `goos`/`goarch` mean "whatever the toolchain defaults to".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildContext {
    pub goos: String,
    pub goarch: String,
    pub tags: BTreeSet<String>,
}

impl BuildContext {
    pub fn new(goos: impl Into<String>, goarch: impl Into<String>) -> Self {
        Self {
            goos: goos.into(),
            goarch: goarch.into(),
            tags: BTreeSet::new(),
        }
    }

    /// Build context of the machine running this process
    pub fn host() -> Self {
        let goos = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let goarch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self::new(goos, goarch)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// A request to resolve one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Import path or pattern to resolve
    pub import_path: String,

    /// Platform and tags
    #[serde(default)]
    pub build: BuildContext,

    /// Working directory the pattern is relative to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Environment variables that influence resolution
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ResolveRequest {
    pub fn new(import_path: impl Into<String>) -> Self {
        Self {
            import_path: import_path.into(),
            build: BuildContext::default(),
            dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_build(mut self, build: BuildContext) -> Self {
        self.build = build;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Result of resolving one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResponse {
    /// Canonical identity of the resolved package
    pub package: PackageId,

    /// Direct dependencies
    #[serde(default)]
    pub imports: Vec<PackageId>,

    /// Resolver-specific details (source dir, export data, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ResolveResponse {
    pub fn new(package: impl Into<PackageId>) -> Self {
        Self {
            package: package.into(),
            imports: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_import(mut self, import: impl Into<PackageId>) -> Self {
        self.imports.push(import.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Identity of a resolution: equal keys always denote the same result
///
/// Combines the import path with a SHA-256 digest over every input that can
/// change the outcome. Ordered collections keep the digest deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    import_path: String,
    digest: String,
}

impl ResolutionKey {
    pub fn derive(request: &ResolveRequest) -> Self {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            // Length-prefix every field so adjacent values cannot run together
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };

        field(request.import_path.as_bytes());
        field(request.build.goos.as_bytes());
        field(request.build.goarch.as_bytes());
        field(&(request.build.tags.len() as u64).to_le_bytes());
        for tag in &request.build.tags {
            field(tag.as_bytes());
        }
        match &request.dir {
            Some(dir) => field(dir.to_string_lossy().as_bytes()),
            None => field(&[]),
        }
        field(&(request.env.len() as u64).to_le_bytes());
        for (key, value) in &request.env {
            field(key.as_bytes());
            field(value.as_bytes());
        }

        Self {
            import_path: request.import_path.clone(),
            digest: hex::encode(hasher.finalize()),
        }
    }

    pub fn import_path(&self) -> &str {
        &self.import_path
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        write!(f, "{}@{}", self.import_path, short)
    }
}
