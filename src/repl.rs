//! Views onto external collaborators: the replication coordinator, the
//! feature-compatibility document, the oplog manager and the snapshot
//! manager. The engine only ever consults these through trait objects;
//! [`StandaloneContext`] is the default wiring for a node that replicates
//! nothing.

use crate::core::{CoreConnection, CoreResult};
use crate::timestamps::Timestamp;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Standalone,
    Primary,
    Secondary,
    Arbiter,
}

impl MemberState {
    pub fn is_arbiter(self) -> bool {
        self == MemberState::Arbiter
    }
}

pub trait ReplicationView: Send + Sync {
    fn member_state(&self) -> MemberState;
    fn using_replsets(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcvVersion {
    FullyDowngraded,
    Latest,
}

pub trait FcvView: Send + Sync {
    fn is_initialized(&self) -> bool;
    fn version(&self) -> FcvVersion;
}

pub trait OplogManager: Send + Sync {
    /// Most recent timestamp all oplog readers can see. Null when no oplog
    /// is being tracked.
    fn oplog_read_timestamp(&self) -> Timestamp;
    fn fetch_all_committed(&self, conn: &Arc<dyn CoreConnection>) -> CoreResult<Timestamp>;
    fn start(&self, uri: &str);
    fn halt(&self);
    fn trigger_journal_flush(&self);
}

pub trait SnapshotView: Send + Sync {
    /// Timestamp local (secondary) reads are served at, when one is pinned.
    fn local_snapshot(&self) -> Option<Timestamp>;
}

/// Collaborator wiring for a standalone node: no replica set, no oplog
/// visibility constraints, no pinned local snapshot.
#[derive(Default)]
pub struct StandaloneContext;

impl ReplicationView for StandaloneContext {
    fn member_state(&self) -> MemberState {
        MemberState::Standalone
    }

    fn using_replsets(&self) -> bool {
        false
    }
}

impl FcvView for StandaloneContext {
    fn is_initialized(&self) -> bool {
        false
    }

    fn version(&self) -> FcvVersion {
        FcvVersion::Latest
    }
}

impl OplogManager for StandaloneContext {
    fn oplog_read_timestamp(&self) -> Timestamp {
        Timestamp::NULL
    }

    fn fetch_all_committed(&self, _conn: &Arc<dyn CoreConnection>) -> CoreResult<Timestamp> {
        Ok(Timestamp::NULL)
    }

    fn start(&self, _uri: &str) {}

    fn halt(&self) {}

    fn trigger_journal_flush(&self) {}
}

impl SnapshotView for StandaloneContext {
    fn local_snapshot(&self) -> Option<Timestamp> {
        None
    }
}

/// Bundle of collaborator handles passed to the engine at construction.
#[derive(Clone)]
pub struct EngineContext {
    pub repl: Arc<dyn ReplicationView>,
    pub fcv: Arc<dyn FcvView>,
    pub oplog: Arc<dyn OplogManager>,
    pub snapshots: Arc<dyn SnapshotView>,
}

impl EngineContext {
    pub fn standalone() -> Self {
        let ctx = Arc::new(StandaloneContext);
        Self {
            repl: ctx.clone(),
            fcv: ctx.clone(),
            oplog: ctx.clone(),
            snapshots: ctx,
        }
    }
}
