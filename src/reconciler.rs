// System
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// Third Party
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::catalog::ResourceKind;
use crate::error::{Result, SyncError};
use crate::record::{object_name, object_resource_version, object_uid, EventType, MirroredRecord};
use crate::recovery::{sleep_or_cancel, Backoff, RetryPolicy};
use crate::source::{Change, ResourceSource};
use crate::store::{DocumentStore, UidFilter};

/// Minimum pause between a cleanly closed watch and the next connection.
pub const WATCH_RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// In-memory position of a reconciler in its kind's change history. Never persisted: a restart
/// always begins with a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WatchCursor {
    /// No snapshot taken yet, or the last resource version expired.
    #[default]
    NeedsSnapshot,
    /// Streaming changes after a successful snapshot.
    Streaming { resource_version: Option<String> },
    /// The snapshot failed; watching from current state until the next cycle retries it.
    Degraded { resource_version: Option<String> },
}

impl WatchCursor {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchCursor::NeedsSnapshot => None,
            WatchCursor::Streaming { resource_version }
            | WatchCursor::Degraded { resource_version } => resource_version.as_deref(),
        }
    }

    pub fn needs_snapshot(&self) -> bool {
        matches!(self, WatchCursor::NeedsSnapshot | WatchCursor::Degraded { .. })
    }

    fn advance(&mut self, version: &str) {
        match self {
            WatchCursor::Streaming { resource_version }
            | WatchCursor::Degraded { resource_version } => {
                *resource_version = Some(version.to_string());
            }
            WatchCursor::NeedsSnapshot => {}
        }
    }

    fn degrade(&mut self) {
        let resource_version = self.resource_version().map(str::to_string);
        *self = WatchCursor::Degraded { resource_version };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub upserted: usize,
    pub skipped: usize,
    pub removed: u64,
    pub resource_version: Option<String>,
}

/// Why a watch connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Server-side timeout or close. Routine; reconnect.
    Closed,
    Cancelled,
}

/// Why `Reconciler::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerExit {
    Cancelled,
    /// The kind is not (or no longer) served by the API server.
    Retired,
    /// Too many consecutive failures.
    Exhausted,
}

/// Keeps one collection equal to the live set of objects of one resource kind.
pub struct Reconciler {
    source: Box<dyn ResourceSource>,
    store: Arc<dyn DocumentStore>,
    cluster: Arc<str>,
    watch_timeout_seconds: u32,
    policy: RetryPolicy,
    reconnect_pause: Duration,
    check_existence: bool,
}

impl Reconciler {
    pub fn new(
        source: Box<dyn ResourceSource>,
        store: Arc<dyn DocumentStore>,
        cluster: Arc<str>,
        watch_timeout_seconds: u32,
    ) -> Self {
        Self {
            source,
            store,
            cluster,
            watch_timeout_seconds,
            policy: RetryPolicy::default(),
            reconnect_pause: WATCH_RECONNECT_PAUSE,
            check_existence: true,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_reconnect_pause(mut self, pause: Duration) -> Self {
        self.reconnect_pause = pause;
        self
    }

    /// Skip the API discovery check, for kinds that are always served (namespaces).
    pub fn without_existence_check(mut self) -> Self {
        self.check_existence = false;
        self
    }

    pub fn kind(&self) -> &ResourceKind {
        self.source.kind()
    }

    fn collection(&self) -> &str {
        self.kind().collection_name()
    }

    /// Write one object's current state. Returns the uid, or `MissingUid`.
    pub async fn upsert(&self, event_type: EventType, object: Value) -> Result<String> {
        let record = MirroredRecord::from_object(self.kind(), &self.cluster, event_type, object)?;
        let uid = record.uid.clone();
        let name = record.name.clone();
        self.store
            .upsert(self.collection(), &uid, record.into_document())
            .await?;
        info!(kind = %self.kind(), name = ?name, uid = %uid, event = %event_type, "Synced");
        Ok(uid)
    }

    /// Remove the record of a deleted object. Returns the number of records removed.
    pub async fn delete(&self, object: &Value) -> Result<u64> {
        let Some(uid) = object_uid(object) else {
            return Err(SyncError::MissingUid {
                kind: self.kind().to_string(),
                name: object_name(object).map(str::to_string),
            });
        };
        let removed = self
            .store
            .delete_where(self.collection(), &UidFilter::Is(uid.to_string()))
            .await?;
        info!(kind = %self.kind(), name = ?object_name(object), uid, "Deleted");
        Ok(removed)
    }

    /// Apply one watch event. Failures are confined to this event.
    pub async fn apply(&self, event_type: EventType, object: Value) {
        let result = match event_type {
            EventType::Deleted => self.delete(&object).await.map(|_| ()),
            _ => self.upsert(event_type, object).await.map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(e @ SyncError::MissingUid { .. }) => warn!("Skipping object: {}", e),
            Err(e) => error!(kind = %self.kind(), event = %event_type, "Failed to apply event: {}", e),
        }
    }

    /// Import the full listing, then delete every record whose uid was not listed.
    /// A listing failure leaves the collection untouched.
    pub async fn reconcile_snapshot(&self) -> Result<SnapshotOutcome> {
        let snapshot = self.source.list().await?;
        info!(kind = %self.kind(), count = snapshot.items.len(), "Initial import");

        let mut outcome = SnapshotOutcome {
            resource_version: snapshot.resource_version,
            ..Default::default()
        };
        let mut seen: HashSet<String> = HashSet::with_capacity(snapshot.items.len());
        for object in snapshot.items {
            let listed_uid = object_uid(&object).map(str::to_string);
            match self.upsert(EventType::InitialImport, object).await {
                Ok(uid) => {
                    seen.insert(uid);
                    outcome.upserted += 1;
                }
                Err(e @ SyncError::MissingUid { .. }) => {
                    warn!("Skipping object: {}", e);
                    outcome.skipped += 1;
                }
                Err(e) => {
                    // Still listed upstream: keep its existing record out of the GC pass.
                    error!(kind = %self.kind(), uid = ?listed_uid, "Failed to import object: {}", e);
                    seen.extend(listed_uid);
                    outcome.skipped += 1;
                }
            }
        }

        outcome.removed = self
            .store
            .delete_where(self.collection(), &UidFilter::NotIn(seen))
            .await?;
        info!(
            kind = %self.kind(),
            removed = outcome.removed,
            "Removed stale records"
        );
        Ok(outcome)
    }

    /// Consume one watch connection until the server closes it.
    pub async fn watch_once(
        &self,
        cursor: &mut WatchCursor,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd> {
        let mut stream = self
            .source
            .watch(cursor.resource_version(), self.watch_timeout_seconds)
            .await?;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => return Ok(StreamEnd::Closed),
                Some(Ok(Change::Bookmark { resource_version })) => {
                    cursor.advance(&resource_version);
                }
                Some(Ok(Change::Object { event_type, object })) => {
                    if let Some(version) = object_resource_version(&object) {
                        cursor.advance(version);
                    }
                    self.apply(event_type, object).await;
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    async fn snapshot_into(&self, cursor: &mut WatchCursor) {
        match self.reconcile_snapshot().await {
            Ok(outcome) => {
                *cursor = WatchCursor::Streaming {
                    resource_version: outcome.resource_version,
                };
            }
            Err(e) => {
                error!(kind = %self.kind(), "Error during initial import: {}", e);
                cursor.degrade();
            }
        }
    }

    /// Snapshot, then watch until cancelled, retired or out of retries.
    pub async fn run(self, cancel: CancellationToken) -> ReconcilerExit {
        if self.check_existence {
            match self.source.exists().await {
                Ok(true) => {}
                Ok(false) => {
                    info!(kind = %self.kind(), "Resource kind is not installed, not watching it");
                    return ReconcilerExit::Retired;
                }
                Err(e) => {
                    warn!(kind = %self.kind(), "Could not check whether resource kind exists: {}", e);
                }
            }
        }

        let mut cursor = WatchCursor::default();
        let mut backoff = Backoff::new(self.policy);
        loop {
            if cancel.is_cancelled() {
                return ReconcilerExit::Cancelled;
            }
            if cursor.needs_snapshot() {
                self.snapshot_into(&mut cursor).await;
            }
            match self.watch_once(&mut cursor, &cancel).await {
                Ok(StreamEnd::Closed) => {
                    debug!(kind = %self.kind(), "Watch closed, reconnecting");
                    backoff.reset();
                    if !sleep_or_cancel(self.reconnect_pause, &cancel).await {
                        return ReconcilerExit::Cancelled;
                    }
                }
                Ok(StreamEnd::Cancelled) => return ReconcilerExit::Cancelled,
                Err(e) if e.is_permanent() => {
                    info!(kind = %self.kind(), "Resource kind no longer exists, stopping watch: {}", e);
                    return ReconcilerExit::Retired;
                }
                Err(e) => {
                    if e.invalidates_cursor() {
                        cursor = WatchCursor::NeedsSnapshot;
                    }
                    let Some(delay) = backoff.record_failure() else {
                        error!(
                            kind = %self.kind(),
                            failures = backoff.failures(),
                            "Max retries exceeded, giving up on resource kind: {}", e
                        );
                        return ReconcilerExit::Exhausted;
                    };
                    warn!(
                        kind = %self.kind(),
                        attempt = backoff.failures(),
                        max = backoff.max_failures(),
                        "Error watching resource, retrying in {:?}: {}", delay, e
                    );
                    if !backoff.wait(delay, &cancel).await {
                        return ReconcilerExit::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // System
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Third Party
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;

    // Local
    use super::*;
    use crate::source::{ChangeStream, Snapshot};
    use crate::store::MemoryStore;

    const COLLECTION: &str = "configauditreports";

    fn kind() -> ResourceKind {
        ResourceKind::new(
            "aquasecurity.github.io",
            "v1alpha1",
            "ConfigAuditReport",
            COLLECTION,
        )
    }

    fn object(uid: &str, version: &str) -> Value {
        json!({"metadata": {"uid": uid, "name": format!("report-{}", uid), "namespace": "apps", "resourceVersion": version}})
    }

    fn nameless() -> Value {
        json!({"metadata": {"name": "no-uid"}})
    }

    type Connection = std::result::Result<Vec<Result<Change>>, SyncError>;

    #[derive(Default)]
    struct FakeState {
        items: Vec<Value>,
        list_fails: bool,
        connections: VecDeque<Connection>,
        watch_calls: Vec<Option<String>>,
        list_calls: usize,
    }

    struct FakeSource {
        kind: ResourceKind,
        exists: bool,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeSource {
        fn new(state: Arc<Mutex<FakeState>>) -> Self {
            Self {
                kind: kind(),
                exists: true,
                state,
            }
        }
    }

    #[async_trait]
    impl ResourceSource for FakeSource {
        fn kind(&self) -> &ResourceKind {
            &self.kind
        }

        async fn exists(&self) -> Result<bool> {
            Ok(self.exists)
        }

        async fn list(&self) -> Result<Snapshot> {
            let mut state = self.state.lock().unwrap();
            state.list_calls += 1;
            if state.list_fails {
                return Err(SyncError::Store("apiserver unavailable".to_string()));
            }
            Ok(Snapshot {
                items: state.items.clone(),
                resource_version: Some("100".to_string()),
            })
        }

        async fn watch(
            &self,
            resource_version: Option<&str>,
            _timeout_seconds: u32,
        ) -> Result<ChangeStream> {
            let mut state = self.state.lock().unwrap();
            state.watch_calls.push(resource_version.map(str::to_string));
            match state.connections.pop_front() {
                Some(Ok(events)) => Ok(stream::iter(events).boxed()),
                Some(Err(e)) => Err(e),
                None => Err(SyncError::WatchStream {
                    kind: COLLECTION.to_string(),
                    message: "connection refused".to_string(),
                    code: 503,
                }),
            }
        }
    }

    fn fast_policy(max_failures: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_failures,
            jitter: Duration::ZERO,
        }
    }

    fn reconciler(state: &Arc<Mutex<FakeState>>, store: &Arc<MemoryStore>) -> Reconciler {
        Reconciler::new(
            Box::new(FakeSource::new(state.clone())),
            store.clone(),
            Arc::from("test-cluster"),
            60,
        )
        .with_retry_policy(fast_policy(3))
        .with_reconnect_pause(Duration::ZERO)
    }

    fn added(obj: Value) -> Result<Change> {
        Ok(Change::Object {
            event_type: EventType::Added,
            object: obj,
        })
    }

    #[tokio::test]
    async fn test_upsert_twice_keeps_one_record() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&state, &store);

        reconciler.upsert(EventType::Added, object("a", "1")).await.unwrap();
        let mut newer = object("a", "2");
        newer["report"] = json!({"summary": {"highCount": 1}});
        reconciler.upsert(EventType::Added, newer.clone()).await.unwrap();

        assert_eq!(store.uids(COLLECTION), vec!["a".to_string()]);
        let doc = store.get(COLLECTION, "a").unwrap();
        assert_eq!(doc["data"], newer);
        assert_eq!(doc["_cluster"], "test-cluster");
    }

    #[tokio::test]
    async fn test_snapshot_removes_stale_records() {
        let state = Arc::new(Mutex::new(FakeState {
            items: vec![object("a", "1"), object("c", "3"), nameless()],
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());
        for uid in ["a", "b", "zombie"] {
            store.seed(COLLECTION, uid, json!({"_uid": uid}));
        }
        let reconciler = reconciler(&state, &store);

        let outcome = reconciler.reconcile_snapshot().await.unwrap();
        assert_eq!(outcome.upserted, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.resource_version.as_deref(), Some("100"));
        assert_eq!(store.uids(COLLECTION), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(
            store.get(COLLECTION, "a").unwrap()["_event_type"],
            "INITIAL_IMPORT"
        );
    }

    #[tokio::test]
    async fn test_failed_listing_leaves_mirror_untouched() {
        let state = Arc::new(Mutex::new(FakeState {
            list_fails: true,
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());
        store.seed(COLLECTION, "old", json!({}));
        let reconciler = reconciler(&state, &store);

        assert!(reconciler.reconcile_snapshot().await.is_err());
        assert_eq!(store.uids(COLLECTION), vec!["old".to_string()]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_uid_never_written() {
        let state = Arc::new(Mutex::new(FakeState {
            items: vec![nameless()],
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&state, &store);

        reconciler.apply(EventType::Modified, nameless()).await;
        reconciler.apply(EventType::Deleted, nameless()).await;
        assert_eq!(store.write_count(), 0);

        // Only the GC pass writes; nothing is upserted.
        reconciler.reconcile_snapshot().await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(store.uids(COLLECTION).is_empty());
    }

    #[tokio::test]
    async fn test_delete_event_removes_only_that_uid() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let store = Arc::new(MemoryStore::new());
        for uid in ["a", "b", "c"] {
            store.seed(COLLECTION, uid, json!({}));
        }
        let reconciler = reconciler(&state, &store);

        reconciler.apply(EventType::Deleted, object("b", "9")).await;
        assert_eq!(store.uids(COLLECTION), vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_once_applies_events_and_tracks_version() {
        let state = Arc::new(Mutex::new(FakeState {
            connections: VecDeque::from(vec![Ok(vec![
                added(object("a", "101")),
                Ok(Change::Object {
                    event_type: EventType::Modified,
                    object: object("b", "102"),
                }),
                Ok(Change::Object {
                    event_type: EventType::Deleted,
                    object: object("a", "103"),
                }),
                Ok(Change::Bookmark {
                    resource_version: "110".to_string(),
                }),
            ])]),
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&state, &store);
        let mut cursor = WatchCursor::Streaming {
            resource_version: Some("100".to_string()),
        };

        let end = reconciler
            .watch_once(&mut cursor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Closed);
        assert_eq!(cursor.resource_version(), Some("110"));
        assert_eq!(store.uids(COLLECTION), vec!["b".to_string()]);
        assert_eq!(store.get(COLLECTION, "b").unwrap()["_event_type"], "MODIFIED");
        assert_eq!(
            state.lock().unwrap().watch_calls,
            vec![Some("100".to_string())]
        );
    }

    #[tokio::test]
    async fn test_run_retires_missing_kind() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let store = Arc::new(MemoryStore::new());
        let mut source = FakeSource::new(state.clone());
        source.exists = false;
        let reconciler = Reconciler::new(Box::new(source), store.clone(), Arc::from("c"), 60);

        let exit = reconciler.run(CancellationToken::new()).await;
        assert_eq!(exit, ReconcilerExit::Retired);
        assert_eq!(state.lock().unwrap().list_calls, 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_run_retires_on_not_found_during_watch() {
        let state = Arc::new(Mutex::new(FakeState {
            connections: VecDeque::from(vec![Ok(vec![
                added(object("a", "101")),
                Err(SyncError::KindNotFound(COLLECTION.to_string())),
            ])]),
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());

        let exit = reconciler(&state, &store).run(CancellationToken::new()).await;
        assert_eq!(exit, ReconcilerExit::Retired);
        assert_eq!(store.uids(COLLECTION), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_consecutive_failures() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let store = Arc::new(MemoryStore::new());

        let exit = reconciler(&state, &store).run(CancellationToken::new()).await;
        assert_eq!(exit, ReconcilerExit::Exhausted);
        let state = state.lock().unwrap();
        assert_eq!(state.watch_calls.len(), 3);
        // Snapshot is taken once; routine failures resume from the snapshot version.
        assert_eq!(state.list_calls, 1);
        assert!(state
            .watch_calls
            .iter()
            .all(|v| v.as_deref() == Some("100")));
    }

    #[tokio::test]
    async fn test_successful_stream_resets_failure_count() {
        let transient = || {
            Err(SyncError::WatchStream {
                kind: COLLECTION.to_string(),
                message: "reset".to_string(),
                code: 500,
            })
        };
        let state = Arc::new(Mutex::new(FakeState {
            connections: VecDeque::from(vec![
                transient(),
                transient(),
                Ok(vec![added(object("a", "120"))]),
                transient(),
                transient(),
            ]),
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());

        let exit = reconciler(&state, &store).run(CancellationToken::new()).await;
        assert_eq!(exit, ReconcilerExit::Exhausted);
        // 2 failures, 1 success, then 3 more failures (2 queued + default) before the ceiling.
        assert_eq!(state.lock().unwrap().watch_calls.len(), 6);
    }

    #[tokio::test]
    async fn test_expired_version_forces_new_snapshot() {
        let state = Arc::new(Mutex::new(FakeState {
            items: vec![object("a", "1")],
            connections: VecDeque::from(vec![
                Err(SyncError::Expired {
                    kind: COLLECTION.to_string(),
                    message: "too old".to_string(),
                }),
                Ok(vec![]),
            ]),
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());

        let exit = reconciler(&state, &store).run(CancellationToken::new()).await;
        assert_eq!(exit, ReconcilerExit::Exhausted);
        assert!(state.lock().unwrap().list_calls >= 2);
    }

    #[tokio::test]
    async fn test_failed_snapshot_is_retried_next_cycle() {
        let state = Arc::new(Mutex::new(FakeState {
            items: vec![object("a", "1")],
            list_fails: true,
            connections: VecDeque::from(vec![Ok(vec![])]),
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&state, &store);
        let mut cursor = WatchCursor::default();

        reconciler.snapshot_into(&mut cursor).await;
        assert_eq!(cursor, WatchCursor::Degraded { resource_version: None });
        assert!(cursor.needs_snapshot());
        let end = reconciler
            .watch_once(&mut cursor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Closed);

        state.lock().unwrap().list_fails = false;
        reconciler.snapshot_into(&mut cursor).await;
        assert_eq!(
            cursor,
            WatchCursor::Streaming {
                resource_version: Some("100".to_string())
            }
        );
        assert_eq!(store.uids(COLLECTION), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        token.cancel();

        let exit = reconciler(&state, &store).run(token).await;
        assert_eq!(exit, ReconcilerExit::Cancelled);
    }

    /// Passes writes through to a `MemoryStore` except upserts of the listed uids.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failing_uids: HashSet<String>,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn upsert(&self, collection: &str, uid: &str, document: Value) -> Result<()> {
            if self.failing_uids.contains(uid) {
                return Err(SyncError::Store("timeout".to_string()));
            }
            self.inner.upsert(collection, uid, document).await
        }

        async fn delete_where(&self, collection: &str, filter: &UidFilter) -> Result<u64> {
            self.inner.delete_where(collection, filter).await
        }

        async fn insert(&self, collection: &str, document: Value) -> Result<()> {
            self.inner.insert(collection, document).await
        }
    }

    fn flaky(store: &Arc<MemoryStore>, failing: &[&str]) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: store.clone(),
            failing_uids: failing.iter().map(|uid| uid.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_failed_import_write_keeps_existing_record() {
        let state = Arc::new(Mutex::new(FakeState {
            items: vec![object("a", "1"), object("c", "3")],
            ..Default::default()
        }));
        let memory = Arc::new(MemoryStore::new());
        memory.seed(COLLECTION, "a", json!({"_uid": "a", "stale": true}));
        memory.seed(COLLECTION, "b", json!({"_uid": "b"}));
        let reconciler = Reconciler::new(
            Box::new(FakeSource::new(state.clone())),
            flaky(&memory, &["a"]),
            Arc::from("test-cluster"),
            60,
        );

        let outcome = reconciler.reconcile_snapshot().await.unwrap();
        assert_eq!(outcome.upserted, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.removed, 1);
        assert_eq!(memory.uids(COLLECTION), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(memory.get(COLLECTION, "a").unwrap()["stale"], true);
    }

    #[tokio::test]
    async fn test_failed_event_write_does_not_stop_stream() {
        let state = Arc::new(Mutex::new(FakeState {
            connections: VecDeque::from(vec![Ok(vec![
                added(object("a", "101")),
                added(object("b", "102")),
                Ok(Change::Object {
                    event_type: EventType::Modified,
                    object: object("c", "103"),
                }),
            ])]),
            ..Default::default()
        }));
        let memory = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(
            Box::new(FakeSource::new(state.clone())),
            flaky(&memory, &["a"]),
            Arc::from("test-cluster"),
            60,
        );
        let mut cursor = WatchCursor::Streaming {
            resource_version: Some("100".to_string()),
        };

        let end = reconciler
            .watch_once(&mut cursor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Closed);
        assert_eq!(cursor.resource_version(), Some("103"));
        assert_eq!(memory.uids(COLLECTION), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_watch_pauses_before_reconnecting() {
        let state = Arc::new(Mutex::new(FakeState {
            connections: VecDeque::from(vec![Ok(vec![])]),
            ..Default::default()
        }));
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&state, &store).with_reconnect_pause(Duration::from_secs(3600));
        let token = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.lock().unwrap().watch_calls.len(), 1);
        token.cancel();
        assert_eq!(handle.await.unwrap(), ReconcilerExit::Cancelled);
        assert_eq!(state.lock().unwrap().watch_calls.len(), 1);
    }
}
