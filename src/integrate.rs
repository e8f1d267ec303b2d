//! Orchestrates one inbound batch: transform, apply, record.
//!
//! The caller owns the group's write transaction; the integrator mutates
//! the group and the history inside it and surfaces the first error, at
//! which point the caller aborts the transaction and the history is
//! rolled back to its pre-batch length. Reciprocal-transform updates made
//! along the way are kept; they are idempotent on content and the next
//! attempt recomputes them.

use crate::changeset::Changeset;
use crate::clock::Clock;
use crate::codec;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::history::{compact, SyncHistory};
use crate::id::{FileIdent, Timestamp, Version};
use crate::transform::{Reporter, Transformer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A remote changeset as delivered by the transport.
#[derive(Clone, Debug)]
pub struct RemoteChangeset {
    /// Encoded changeset bytes.
    pub data: Vec<u8>,
    /// The producing peer's version for this changeset.
    pub remote_version: Version,
    /// The latest receiver-side version already reflected in `data`; the
    /// transformer merges only against entries after it.
    pub last_integrated_local_version: Version,
    /// Producing peer's file identity.
    pub origin_file: FileIdent,
    /// Producing peer's timestamp.
    pub origin_timestamp: Timestamp,
}

/// Caller-facing configuration knobs.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// Skip history compaction and merge the raw instruction stream.
    /// Compaction is a performance aid; outcomes are identical either
    /// way.
    pub disable_compaction: bool,
}

/// Cooperative cancellation flag checked between changesets. Once the
/// integrator has started on a changeset it runs that changeset to
/// completion or fails atomically.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Integrates inbound batches and records local commits.
pub struct Integrator<'a> {
    history: &'a mut SyncHistory,
    config: SyncConfig,
    reporter: Option<&'a mut dyn Reporter>,
}

impl<'a> Integrator<'a> {
    /// Creates an integrator over the peer's history.
    pub fn new(history: &'a mut SyncHistory, config: SyncConfig) -> Self {
        Self {
            history,
            config,
            reporter: None,
        }
    }

    /// Attaches a diagnostic reporter forwarded to the transformer.
    pub fn reporter(mut self, reporter: &'a mut dyn Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Integrates a batch of remote changesets into `group`, which the
    /// caller must hold under its write transaction. Returns the new
    /// local version. On error the history is rolled back to its
    /// pre-batch length and the caller must abort the group transaction.
    pub fn integrate_remote_changesets(
        &mut self,
        group: &mut Group,
        batch: &[RemoteChangeset],
        cancel: Option<&CancelToken>,
    ) -> Result<Version> {
        let base_version = self.history.current_version();
        let result = self.integrate_inner(group, batch, cancel);
        if result.is_err() {
            self.history.rollback_to(base_version);
        }
        result
    }

    fn integrate_inner(
        &mut self,
        group: &mut Group,
        batch: &[RemoteChangeset],
        cancel: Option<&CancelToken>,
    ) -> Result<Version> {
        if cancel.map_or(false, CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        let single_origin = batch
            .windows(2)
            .all(|w| w[0].origin_file == w[1].origin_file);
        for remote in batch {
            let mut changeset = codec::decode_changeset(&remote.data)?;
            changeset.version = remote.remote_version;
            changeset.origin_file = remote.origin_file;
            changeset.origin_timestamp = remote.origin_timestamp;
            changeset.last_integrated_remote_version = remote.last_integrated_local_version;
            if !self.config.disable_compaction && single_origin {
                compact(&mut changeset);
            }
            {
                let mut transformer = match self.reporter.as_deref_mut() {
                    Some(reporter) => Transformer::with_reporter(self.history, reporter),
                    None => Transformer::new(self.history),
                };
                transformer.transform_remote_changeset(&mut changeset)?;
            }
            crate::apply::apply_changeset(group, &changeset)?;
            let mut bytes = Vec::new();
            if !changeset.is_empty() {
                codec::encode_changeset(&changeset, &mut bytes);
            }
            let version = self.history.append(
                bytes,
                remote.origin_file,
                remote.origin_timestamp,
                remote.remote_version,
            );
            tracing::debug!(
                origin = %remote.origin_file,
                remote_version = remote.remote_version,
                version,
                "integrated remote changeset"
            );
        }
        Ok(self.history.current_version())
    }
}

/// Records a locally committed changeset. The applier already ran
/// implicitly as the user mutated the group, so the changeset is only
/// encoded and appended with origin 0 and a fresh clock timestamp.
pub fn record_local_changeset(
    history: &mut SyncHistory,
    changeset: &mut Changeset,
    clock: &dyn Clock,
) -> Version {
    let timestamp = clock.now();
    changeset.origin_file = FileIdent::LOCAL;
    changeset.origin_timestamp = timestamp;
    let mut bytes = Vec::new();
    if !changeset.is_empty() {
        codec::encode_changeset(changeset, &mut bytes);
    }
    let version = history.append(bytes, FileIdent::LOCAL, timestamp, 0);
    changeset.version = version;
    tracing::debug!(version, "recorded local changeset");
    version
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    #[test]
    fn cancelled_batch_leaves_history_unchanged() {
        let mut history = SyncHistory::new(FileIdent::new(2));
        let mut group = Group::new();
        let token = CancelToken::new();
        token.cancel();
        let mut integrator = Integrator::new(&mut history, SyncConfig::default());
        let err = integrator
            .integrate_remote_changesets(&mut group, &[], Some(&token))
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert_eq!(history.current_version(), 1);
    }

    #[test]
    fn bad_batch_rolls_history_back() {
        let mut history = SyncHistory::new(FileIdent::new(2));
        let mut group = Group::new();
        let remote = RemoteChangeset {
            data: vec![0xff, 0xff],
            remote_version: 2,
            last_integrated_local_version: 1,
            origin_file: FileIdent::COORDINATOR,
            origin_timestamp: Timestamp::new(0),
        };
        let mut integrator = Integrator::new(&mut history, SyncConfig::default());
        let err = integrator
            .integrate_remote_changesets(&mut group, &[remote], None)
            .unwrap_err();
        assert!(matches!(err, Error::BadFormat { .. }));
        assert_eq!(history.current_version(), 1);
    }

    #[test]
    fn local_commit_records_clock_timestamp() {
        let mut history = SyncHistory::new(FileIdent::new(2));
        let clock = TestClock::new();
        clock.set(42);
        let mut changeset = Changeset::new();
        let version = record_local_changeset(&mut history, &mut changeset, &clock);
        assert_eq!(version, 2);
        let entry = history.entry_at(2).unwrap();
        assert!(entry.origin_file.is_local());
        assert_eq!(entry.origin_timestamp, Timestamp::new(42));
        assert!(entry.changeset.is_empty());
    }
}
