//! Package snapshots and batch work descriptions.
//!
//! Both the snapshot and the batch computation belong to the host's package
//! manager. The driver only needs to hold a snapshot for the duration of a
//! job and to hand the resolved batch across the version boundary as bytes.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A consistent view of installed packages.
///
/// The snapshot is released when the value is dropped.
pub trait PackageSnapshot: Send {
    /// Number of packages visible in this snapshot.
    fn package_count(&self) -> usize;
}

/// Hands out scoped package snapshots.
pub trait PackageSnapshotProvider: Send + Sync {
    /// Takes a new snapshot.
    fn acquire(&self) -> Result<Box<dyn PackageSnapshot>>;
}

/// Computes the unit of work for a job from a snapshot.
pub trait BatchParameterResolver: Send + Sync {
    /// Resolves batch parameters for `reason`.
    ///
    /// Implementations may stop early and return
    /// [`Error::Cancelled`](crate::error::Error::Cancelled) once
    /// `cancellation` fires.
    fn resolve(
        &self,
        snapshot: &dyn PackageSnapshot,
        reason: &str,
        cancellation: &CancellationToken,
    ) -> Result<BatchWorkDescription>;
}

/// Work-item description handed to the new version's entry point.
///
/// The driver never looks inside. It only encodes it before the call, and the
/// entry point decodes its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchWorkDescription {
    /// Packages to recompile, in priority order.
    pub packages: Vec<String>,
    /// Compiler filter to apply.
    pub compiler_filter: String,
    /// Scheduling priority class for the compiler processes.
    pub priority_class: i32,
    /// Bit flags forwarded to the compiler service.
    pub flags: u32,
}

impl BatchWorkDescription {
    /// Returns true if there is nothing to recompile.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Encodes the description into a flat byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a description produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Snapshot provider for callers that have no package manager, such as the
/// command-line tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySnapshotProvider;

struct EmptySnapshot;

impl PackageSnapshot for EmptySnapshot {
    fn package_count(&self) -> usize {
        0
    }
}

impl PackageSnapshotProvider for EmptySnapshotProvider {
    fn acquire(&self) -> Result<Box<dyn PackageSnapshot>> {
        Ok(Box::new(EmptySnapshot))
    }
}

/// Resolver that always returns the same, precomputed description.
#[derive(Debug, Clone, Default)]
pub struct FixedBatchResolver {
    description: BatchWorkDescription,
}

impl FixedBatchResolver {
    /// Creates a resolver returning `description`.
    pub fn new(description: BatchWorkDescription) -> Self {
        Self { description }
    }
}

impl BatchParameterResolver for FixedBatchResolver {
    fn resolve(
        &self,
        _snapshot: &dyn PackageSnapshot,
        reason: &str,
        _cancellation: &CancellationToken,
    ) -> Result<BatchWorkDescription> {
        tracing::debug!(
            reason = %reason,
            packages = self.description.packages.len(),
            "resolved fixed batch parameters"
        );
        Ok(self.description.clone())
    }
}
