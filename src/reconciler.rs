//! History reconciliation.
//!
//! The client's copy of the history is advisory. After anything that can
//! change the message count, [`HistoryReconciler`] fetches the server's view
//! and brings the snapshot (and, when needed, the rendered conversation)
//! back in line.
//!
//! Triggers are debounced: each [`HistoryReconciler::trigger`] restarts a
//! timer, and only the last one in a window performs the fetch.

use crate::render::Renderer;
use crate::stores::HistoryStore;
use crate::types::{Message, TurnError, TurnErrorKind};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Client's best-known copy of the message sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistorySnapshot {
    messages: Vec<Message>,
}

impl HistorySnapshot {
    #[must_use]
    pub const fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }
}

/// What a reconciliation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The server matches the snapshot; nothing was touched.
    Unchanged,
    /// The server has exactly one more message on top of a matching prefix;
    /// the snapshot was adopted without re-rendering.
    FastForward,
    /// Anything else; the snapshot was replaced and the conversation
    /// re-rendered once.
    Replaced,
}

fn classify(current: &[Message], fetched: &[Message]) -> ReconcileOutcome {
    if current == fetched {
        return ReconcileOutcome::Unchanged;
    }
    let prefix_matches = current
        .iter()
        .zip(fetched)
        .all(|(local, remote)| local.same_text(remote));
    if fetched.len() == current.len() + 1 && prefix_matches {
        ReconcileOutcome::FastForward
    } else {
        ReconcileOutcome::Replaced
    }
}

/// Messages appended to `before` since it was taken, if they are all
/// unconfirmed echoes and nothing else changed.
fn echoes_since(before: &[Message], current: &[Message]) -> Option<Vec<Message>> {
    if current.len() <= before.len() || current[..before.len()] != *before {
        return None;
    }
    let tail = &current[before.len()..];
    tail.iter()
        .all(|m| m.timestamp.is_pending())
        .then(|| tail.to_vec())
}

pub struct HistoryReconciler<H, R> {
    store: Arc<H>,
    renderer: Arc<R>,
    snapshot: Mutex<HistorySnapshot>,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    fetches: AtomicU64,
}

impl<H, R> HistoryReconciler<H, R>
where
    H: HistoryStore + 'static,
    R: Renderer + 'static,
{
    #[must_use]
    pub fn new(store: Arc<H>, renderer: Arc<R>, debounce: Duration) -> Self {
        Self {
            store,
            renderer,
            snapshot: Mutex::new(HistorySnapshot::default()),
            debounce,
            pending: Mutex::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    fn snapshot_guard(&self) -> MutexGuard<'_, HistorySnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_guard(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        self.snapshot_guard().clone()
    }

    /// Cached history length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot_guard().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot_guard().is_empty()
    }

    /// Apply a speculative edit. It stands until the next reconciliation
    /// that does not fast-forward replaces the snapshot wholesale.
    pub fn apply_optimistic<T>(&self, edit: impl FnOnce(&mut Vec<Message>) -> T) -> T {
        edit(&mut self.snapshot_guard().messages)
    }

    /// Fetch the server's history now and reconcile against it.
    ///
    /// # Errors
    /// Returns a [`TurnErrorKind::Reconcile`] error if the fetch fails; the
    /// snapshot is left unchanged.
    pub async fn reconcile_now(&self) -> Result<ReconcileOutcome, TurnError> {
        let fetch_number = self.fetches.fetch_add(1, Ordering::Relaxed) + 1;
        let before = self.snapshot_guard().messages.clone();
        let fetched = self.store.history().await.map_err(|e| {
            warn!("History fetch failed, keeping cached snapshot fetch_number={fetch_number} error={e}");
            TurnError::new(TurnErrorKind::Reconcile, format!("Failed to fetch history: {e}"))
        })?;

        let mut snapshot = self.snapshot_guard();
        // Echoes pushed while the fetch was in flight are not on the server yet.
        let echoes = echoes_since(&before, &snapshot.messages);
        let outcome = match &echoes {
            Some(_) => classify(&before, &fetched),
            None => classify(&snapshot.messages, &fetched),
        };
        debug!(
            "Reconciled history outcome={outcome:?} cached_len={} server_len={} late_echoes={} fetch_number={fetch_number}",
            snapshot.len(),
            fetched.len(),
            echoes.as_ref().map_or(0, Vec::len)
        );

        let mut next = fetched;
        next.extend(echoes.unwrap_or_default());
        match outcome {
            ReconcileOutcome::Unchanged => {}
            ReconcileOutcome::FastForward => snapshot.messages = next,
            ReconcileOutcome::Replaced => {
                self.renderer.replace_history(&next);
                snapshot.messages = next;
            }
        }
        Ok(outcome)
    }

    /// Request a reconciliation after the debounce window, restarting the
    /// window if one is already armed.
    ///
    /// Outside a tokio runtime the request is dropped with a warning.
    pub fn trigger(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, skipping history reconciliation");
            return;
        };
        let this = Arc::clone(self);
        let delay = self.debounce;
        let mut pending = self.pending_guard();
        if let Some(previous) = pending.take() {
            if !previous.is_finished() {
                debug!("Restarting reconciliation debounce window");
            }
            previous.abort();
        }
        *pending = Some(runtime.spawn(async move {
            sleep(delay).await;
            if let Err(error) = this.reconcile_now().await {
                warn!("Debounced reconciliation failed error={error}");
            }
        }));
    }

    /// Whether a debounced reconciliation is armed or running.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.pending_guard()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait until no debounced reconciliation is armed.
    pub async fn settle(&self) {
        loop {
            let handle = self.pending_guard().take();
            let Some(handle) = handle else {
                break;
            };
            // An aborted handle resolves with a cancellation error.
            let _ = handle.await;
        }
    }

    /// Number of history fetches attempted so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::BufferRenderer;
    use crate::stores::InMemoryHistory;
    use crate::types::{MessageTimestamp, Role};

    type TestReconciler = HistoryReconciler<InMemoryHistory, BufferRenderer>;

    fn setup(debounce_ms: u64) -> (Arc<InMemoryHistory>, Arc<BufferRenderer>, Arc<TestReconciler>) {
        let store = Arc::new(InMemoryHistory::new());
        let renderer = Arc::new(BufferRenderer::new());
        let reconciler = Arc::new(HistoryReconciler::new(
            Arc::clone(&store),
            Arc::clone(&renderer),
            Duration::from_millis(debounce_ms),
        ));
        (store, renderer, reconciler)
    }

    #[tokio::test]
    async fn first_load_replaces_then_repeat_is_unchanged() -> anyhow::Result<()> {
        let (store, renderer, reconciler) = setup(10);
        store.append(Role::User, "Hello")?;
        store.append(Role::Assistant, "Hi there!")?;

        assert_eq!(reconciler.reconcile_now().await?, ReconcileOutcome::Replaced);
        let rendered = renderer.messages();

        assert_eq!(reconciler.reconcile_now().await?, ReconcileOutcome::Unchanged);
        assert_eq!(renderer.messages(), rendered);
        assert_eq!(renderer.replace_count(), 1);
        assert_eq!(reconciler.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn one_more_message_fast_forwards_without_render() -> anyhow::Result<()> {
        let (store, renderer, reconciler) = setup(10);
        reconciler.apply_optimistic(|messages| {
            messages.push(Message::user("Hello", MessageTimestamp::pending()));
        });
        store.append(Role::User, "Hello")?;
        store.append(Role::Assistant, "Hi there!")?;

        assert_eq!(reconciler.reconcile_now().await?, ReconcileOutcome::FastForward);
        assert_eq!(renderer.replace_count(), 0);
        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.messages()[0].timestamp.is_pending());
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_prefix_is_replaced() -> anyhow::Result<()> {
        let (store, renderer, reconciler) = setup(10);
        reconciler.apply_optimistic(|messages| {
            messages.push(Message::user("typo", MessageTimestamp::pending()));
        });
        store.append(Role::User, "Hello")?;
        store.append(Role::Assistant, "Hi")?;

        assert_eq!(reconciler.reconcile_now().await?, ReconcileOutcome::Replaced);
        assert_eq!(renderer.replace_count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_triggers_coalesce_into_one_fetch() {
        let (_store, _renderer, reconciler) = setup(100);
        for _ in 0..5 {
            reconciler.trigger();
            sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(reconciler.fetch_count(), 0);
        assert!(reconciler.pending());

        reconciler.settle().await;
        assert_eq!(reconciler.fetch_count(), 1);
        assert!(!reconciler.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_triggers_fetch_each_time() {
        let (_store, _renderer, reconciler) = setup(10);
        reconciler.trigger();
        sleep(Duration::from_millis(50)).await;
        reconciler.trigger();
        reconciler.settle().await;
        assert_eq!(reconciler.fetch_count(), 2);
    }

    struct FailingHistory;

    #[async_trait::async_trait]
    impl HistoryStore for FailingHistory {
        async fn history(&self) -> anyhow::Result<Vec<Message>> {
            anyhow::bail!("offline")
        }
        async fn raw_history(&self) -> anyhow::Result<Vec<Message>> {
            anyhow::bail!("offline")
        }
        async fn delete_from_user(&self, _anchor: &crate::stores::UserAnchor) -> anyhow::Result<()> {
            anyhow::bail!("offline")
        }
        async fn delete_from_assistant(&self, _timestamp: &MessageTimestamp) -> anyhow::Result<()> {
            anyhow::bail!("offline")
        }
        async fn delete_assistant_message(
            &self,
            _timestamp: &MessageTimestamp,
        ) -> anyhow::Result<()> {
            anyhow::bail!("offline")
        }
    }

    #[tokio::test]
    async fn fetch_failure_keeps_snapshot() {
        let renderer = Arc::new(BufferRenderer::new());
        let reconciler = HistoryReconciler::new(
            Arc::new(FailingHistory),
            Arc::clone(&renderer),
            Duration::from_millis(10),
        );
        reconciler.apply_optimistic(|messages| {
            messages.push(Message::user("Hello", MessageTimestamp::pending()));
        });

        let error = reconciler.reconcile_now().await.err();
        assert_eq!(error.map(|e| e.kind), Some(TurnErrorKind::Reconcile));
        assert_eq!(reconciler.len(), 1);
        assert_eq!(renderer.replace_count(), 0);
    }

    #[test]
    fn trigger_without_runtime_is_skipped() {
        let (_store, _renderer, reconciler) = setup(10);

        reconciler.trigger();

        assert!(!reconciler.pending());
        assert_eq!(reconciler.fetch_count(), 0);
    }

    /// Holds the next history fetch until released.
    #[derive(Default)]
    struct SlowHistory {
        inner: InMemoryHistory,
        hold_next: std::sync::atomic::AtomicBool,
        reached: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl HistoryStore for SlowHistory {
        async fn history(&self) -> anyhow::Result<Vec<Message>> {
            if self.hold_next.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.history().await
        }
        async fn raw_history(&self) -> anyhow::Result<Vec<Message>> {
            self.inner.raw_history().await
        }
        async fn delete_from_user(&self, anchor: &crate::stores::UserAnchor) -> anyhow::Result<()> {
            self.inner.delete_from_user(anchor).await
        }
        async fn delete_from_assistant(&self, timestamp: &MessageTimestamp) -> anyhow::Result<()> {
            self.inner.delete_from_assistant(timestamp).await
        }
        async fn delete_assistant_message(
            &self,
            timestamp: &MessageTimestamp,
        ) -> anyhow::Result<()> {
            self.inner.delete_assistant_message(timestamp).await
        }
    }

    #[tokio::test]
    async fn echo_added_during_fetch_survives() -> anyhow::Result<()> {
        let store = Arc::new(SlowHistory::default());
        store.inner.append(Role::User, "Hello")?;
        store.inner.append(Role::Assistant, "Hi!")?;
        let renderer = Arc::new(BufferRenderer::new());
        let reconciler = Arc::new(HistoryReconciler::new(
            Arc::clone(&store),
            Arc::clone(&renderer),
            Duration::from_millis(10),
        ));
        assert_eq!(reconciler.reconcile_now().await?, ReconcileOutcome::Replaced);

        store.hold_next.store(true, Ordering::SeqCst);
        let running = Arc::clone(&reconciler);
        let fetch = tokio::spawn(async move { running.reconcile_now().await });
        store.reached.notified().await;
        reconciler.apply_optimistic(|messages| {
            messages.push(Message::user("Next", MessageTimestamp::pending()));
        });
        store.release.notify_one();

        assert_eq!(fetch.await??, ReconcileOutcome::Unchanged);
        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.messages()[2].text(), "Next");
        assert_eq!(renderer.replace_count(), 1);
        Ok(())
    }

    #[test]
    fn echoes_since_requires_untouched_prefix() {
        let hello = Message::user("Hello", MessageTimestamp::new("t1"));
        let echo = Message::user("Next", MessageTimestamp::pending());
        let stored = Message::assistant("Hi!", MessageTimestamp::new("t2"));

        assert_eq!(
            echoes_since(&[hello.clone()], &[hello.clone(), echo.clone()]),
            Some(vec![echo.clone()])
        );
        assert_eq!(echoes_since(&[hello.clone()], &[hello.clone()]), None);
        assert_eq!(echoes_since(&[hello.clone()], &[hello.clone(), stored]), None);
        assert_eq!(echoes_since(&[hello], &[echo.clone(), echo]), None);
    }

}
