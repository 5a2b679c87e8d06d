//! Pulls the compatibility document from a source into the shared store.
//!
//! Each fetch is fingerprinted with SHA-256 and only re-parsed when the
//! content changed. The digest is recorded only after a successful refresh,
//! so a rejected document keeps being reported on every poll until it is
//! fixed. Overlapping refreshes run one at a time, so an older fetch is never
//! applied over a newer one.

use crate::error::RefreshError;
use crate::source::ConfigSource;
use nodelabel_core::{CompatibilityStore, RefreshSummary};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// SHA-256 fingerprint of a raw compatibility document.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentDigest([u8; 32]);

impl DocumentDigest {
    pub fn of(raw: &[u8]) -> Self {
        let result = Sha256::digest(raw);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        DocumentDigest(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Truncated display (first 12 chars).
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Debug for DocumentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentDigest({}...)", self.short())
    }
}

impl fmt::Display for DocumentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Result of a refresh attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new mapping was parsed and swapped in.
    Applied {
        summary: RefreshSummary,
        digest: DocumentDigest,
    },
    /// The document is identical to the last applied one.
    Unchanged,
}

impl RefreshOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RefreshOutcome::Applied { .. })
    }
}

/// Keeps a [`CompatibilityStore`] in step with a [`ConfigSource`].
pub struct CompatibilityRefresher<S: ConfigSource> {
    source: Arc<S>,
    store: Arc<CompatibilityStore>,
    applied: Mutex<Option<DocumentDigest>>,
    // Held from fetch until the digest is recorded.
    in_flight: AsyncMutex<()>,
}

impl<S: ConfigSource> CompatibilityRefresher<S> {
    pub fn new(source: Arc<S>, store: Arc<CompatibilityStore>) -> Self {
        Self {
            source,
            store,
            applied: Mutex::new(None),
            in_flight: AsyncMutex::new(()),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn store(&self) -> &Arc<CompatibilityStore> {
        &self.store
    }

    /// Digest of the last successfully applied document.
    pub fn applied_digest(&self) -> Option<DocumentDigest> {
        *self.applied.lock()
    }

    /// Fetch the document and apply it if it changed.
    ///
    /// An absent document applies an empty mapping.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let _in_flight = self.in_flight.lock().await;
        let raw = match self.source.fetch().await {
            Ok(raw) => raw.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(location = %self.source.location(), error = %err, "failed to fetch compatibility document");
                return Err(err.into());
            }
        };

        let digest = DocumentDigest::of(&raw);
        if *self.applied.lock() == Some(digest) {
            tracing::trace!(digest = %digest.short(), "compatibility document unchanged");
            return Ok(RefreshOutcome::Unchanged);
        }

        let summary = self.store.refresh(&raw)?;
        *self.applied.lock() = Some(digest);

        tracing::info!(
            location = %self.source.location(),
            digest = %digest.short(),
            families = summary.families,
            generation = summary.generation,
            "applied compatibility mapping"
        );
        Ok(RefreshOutcome::Applied { summary, digest })
    }

    /// Forget the applied digest so the next refresh re-parses unconditionally.
    pub fn invalidate(&self) {
        *self.applied.lock() = None;
    }
}
