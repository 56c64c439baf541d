//! Live notification feed.
//!
//! A `FeedCache` holds the newest notifications of one subject plus the unread
//! count, and keeps them in line with the remote collection through its change
//! stream. The list is only ever mutated by the initial page fetch and by
//! change events; the mutation methods forward to the remote and wait for the
//! echo.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::notification::model::{ChangeEvent, Notification, NotificationError, NotificationPatch};
use crate::notification::remote::{ChangeStream, RemoteCollection};
use crate::notification::toast::{Toast, ToastSink};

/// What the presentation layer renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub loading: bool,
}

#[derive(Debug, PartialEq)]
enum Applied {
    Inserted,
    Updated,
    Removed,
    Ignored,
}

#[derive(Debug, Default)]
struct FeedState {
    subject_id: Option<String>,
    generation: u64,
    active_subscription: Option<u64>,
    notifications: Vec<Notification>,
    unread_count: usize,
    loading: bool,
    // Events applied while a page fetch is in flight, replayed onto the page
    pending: Vec<ChangeEvent>,
}

impl FeedState {
    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            notifications: self.notifications.clone(),
            unread_count: self.unread_count,
            loading: self.loading,
        }
    }

    fn load_page(&mut self, mut page: Vec<Notification>, max_items: Option<usize>) {
        if let Some(max) = max_items {
            page.truncate(max);
        }
        self.unread_count = page.iter().filter(|n| !n.is_read).count();
        self.notifications = page;
    }

    /// Re-apply events that raced with the page fetch. Changes the page
    /// already reflects are skipped so nothing is counted twice.
    fn replay_pending(&mut self, max_items: Option<usize>) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let mut replayed = 0;
        for event in &pending {
            if let ChangeEvent::Update(record) = event {
                if self.notifications.iter().any(|n| n == record) {
                    continue;
                }
            }
            if self.apply(event, max_items) != Applied::Ignored {
                replayed += 1;
            }
        }
        replayed
    }

    // Counting is deliberately asymmetric: an insert always adds one unread and
    // an update can only ever remove one.
    fn apply(&mut self, event: &ChangeEvent, max_items: Option<usize>) -> Applied {
        match event {
            ChangeEvent::Insert(record) => {
                if self.notifications.iter().any(|n| n.id == record.id) {
                    return Applied::Ignored;
                }
                self.notifications.insert(0, record.clone());
                self.unread_count += 1;

                if let Some(max) = max_items {
                    while self.notifications.len() > max {
                        match self.notifications.pop() {
                            Some(evicted) if !evicted.is_read => {
                                self.unread_count = self.unread_count.saturating_sub(1);
                            }
                            _ => {}
                        }
                    }
                }
                Applied::Inserted
            }
            ChangeEvent::Update(record) => {
                let mut found = false;
                if let Some(existing) = self.notifications.iter_mut().find(|n| n.id == record.id) {
                    *existing = record.clone();
                    found = true;
                }
                if record.is_read {
                    self.unread_count = self.unread_count.saturating_sub(1);
                }
                if found {
                    Applied::Updated
                } else {
                    Applied::Ignored
                }
            }
            ChangeEvent::Delete { id } => {
                match self.notifications.iter().position(|n| &n.id == id) {
                    Some(index) => {
                        let removed = self.notifications.remove(index);
                        if !removed.is_read {
                            self.unread_count = self.unread_count.saturating_sub(1);
                        }
                        Applied::Removed
                    }
                    None => Applied::Ignored,
                }
            }
        }
    }
}

/// State shared between the cache handle and its subscription task
struct FeedShared {
    remote: Arc<dyn RemoteCollection>,
    toasts: Arc<dyn ToastSink>,
    config: FeedConfig,
    state: Mutex<FeedState>,
    snapshot_tx: watch::Sender<FeedSnapshot>,
}

impl FeedShared {
    fn publish(&self, state: &FeedState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    /// Reset for `subject_id` and return the generation tag of the load
    async fn begin_load(&self, subject_id: Option<&str>) -> u64 {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.subject_id = subject_id.map(str::to_string);
        state.notifications.clear();
        state.unread_count = 0;
        state.loading = subject_id.is_some();
        state.pending.clear();
        self.publish(&state);
        state.generation
    }

    /// Fetch the page for `generation`. On failure the list is cleared when
    /// `reset_on_error` is set and kept otherwise.
    async fn finish_load(&self, generation: u64, subject_id: &str, reset_on_error: bool) {
        let result = self
            .remote
            .fetch_page(subject_id, self.config.page_size)
            .await;

        let mut state = self.state.lock().await;
        self.complete_load(&mut state, generation, subject_id, result, reset_on_error);
    }

    fn complete_load(
        &self,
        state: &mut FeedState,
        generation: u64,
        subject_id: &str,
        result: Result<Vec<Notification>, NotificationError>,
        reset_on_error: bool,
    ) {
        if state.generation != generation {
            debug!(
                "Discarding stale notification page for subject {} (generation {}, current {})",
                subject_id, generation, state.generation
            );
            return;
        }

        match result {
            Ok(page) => {
                info!(
                    "Loaded {} notifications for subject {}",
                    page.len(),
                    subject_id
                );
                state.load_page(page, self.config.max_items);
                let replayed = state.replay_pending(self.config.max_items);
                if replayed > 0 {
                    debug!(
                        "Replayed {} change events received during fetch for subject {}",
                        replayed, subject_id
                    );
                }
            }
            Err(e) => {
                error!(
                    "Failed to fetch notifications for subject {}: {}",
                    subject_id, e
                );
                if reset_on_error {
                    state.notifications.clear();
                    state.unread_count = 0;
                }
            }
        }
        state.pending.clear();
        state.loading = false;
        self.publish(state);
    }

    async fn is_active(&self, subscription_id: u64) -> bool {
        self.state.lock().await.active_subscription == Some(subscription_id)
    }

    async fn deactivate(&self, subscription_id: u64) {
        let mut state = self.state.lock().await;
        if state.active_subscription == Some(subscription_id) {
            state.active_subscription = None;
        }
    }

    /// Returns false once the subscription has been disposed
    async fn apply_event(&self, subscription_id: u64, subject_id: &str, event: ChangeEvent) -> bool {
        let toast = {
            let mut state = self.state.lock().await;
            if state.active_subscription != Some(subscription_id) {
                debug!(
                    "Dropping {} event for {} from disposed subscription {}",
                    event.kind(),
                    event.record_id(),
                    subscription_id
                );
                return false;
            }
            if state.subject_id.as_deref().map_or(false, |current| current != subject_id) {
                debug!(
                    "Dropping {} event for {}: feed now belongs to another subject",
                    event.kind(),
                    event.record_id()
                );
                return true;
            }

            let applied = state.apply(&event, self.config.max_items);
            if state.loading {
                state.pending.push(event.clone());
            }
            debug!(
                "Applied {} event for {}: {:?} (unread {})",
                event.kind(),
                event.record_id(),
                applied,
                state.unread_count
            );
            self.publish(&state);

            match (&applied, &event) {
                (Applied::Inserted, ChangeEvent::Insert(record)) => {
                    Some(Toast::for_new_notification(record))
                }
                _ => None,
            }
        };

        if let Some(toast) = toast {
            self.toasts.show(toast);
        }
        true
    }

    /// Mark a re-fetch after a reconnect, so changes made while the stream
    /// was down are not lost. From here on events are buffered for replay.
    async fn begin_resync(&self, subscription_id: u64, subject_id: &str) -> Option<u64> {
        let mut state = self.state.lock().await;
        if state.active_subscription != Some(subscription_id)
            || state.subject_id.as_deref() != Some(subject_id)
        {
            return None;
        }
        // An in-flight load keeps its own buffered events
        if !state.loading {
            state.loading = true;
            state.pending.clear();
            self.publish(&state);
        }
        info!("Resynchronizing notifications for subject {}", subject_id);
        Some(state.generation)
    }

    /// The current list stays visible until the fresh page lands; a failed
    /// fetch keeps it.
    async fn finish_resync(&self, subscription_id: u64, subject_id: &str, generation: u64) {
        let result = self
            .remote
            .fetch_page(subject_id, self.config.page_size)
            .await;

        let mut state = self.state.lock().await;
        if state.active_subscription != Some(subscription_id) {
            debug!(
                "Discarding resync page for subject {} from disposed subscription {}",
                subject_id, subscription_id
            );
            if state.generation == generation && state.loading {
                state.pending.clear();
                state.loading = false;
                self.publish(&state);
            }
            return;
        }
        self.complete_load(&mut state, generation, subject_id, result, false);
    }

    async fn run_subscription(
        self: Arc<Self>,
        subscription_id: u64,
        subject_id: String,
        mut stream: Option<ChangeStream>,
    ) {
        let mut failures: u32 = if stream.is_some() { 0 } else { 1 };

        loop {
            if let Some(mut changes) = stream.take() {
                while let Some(item) = changes.next().await {
                    match item {
                        Ok(event) => {
                            if !self.apply_event(subscription_id, &subject_id, event).await {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Dropping change event for subject {}: {}", subject_id, e);
                        }
                    }
                }
                warn!("Change stream for subject {} ended", subject_id);
            }

            if failures > self.config.max_reconnect_attempts {
                error!(
                    "Giving up on change stream for subject {} after {} failed attempts",
                    subject_id, failures
                );
                return;
            }

            tokio::time::sleep(self.config.reconnect_delay).await;
            if !self.is_active(subscription_id).await {
                return;
            }

            match self.remote.subscribe(&subject_id).await {
                Ok(changes) => {
                    info!("Reconnected change stream for subject {}", subject_id);
                    failures = 0;
                    stream = Some(changes);

                    // Fetch alongside the new stream; events racing the fetch
                    // land in the pending buffer
                    if let Some(generation) = self.begin_resync(subscription_id, &subject_id).await {
                        let shared = self.clone();
                        let subject = subject_id.clone();
                        tokio::spawn(async move {
                            shared.finish_resync(subscription_id, &subject, generation).await;
                        });
                    }
                }
                Err(e) => {
                    failures += 1;
                    error!(
                        "Failed to reopen change stream for subject {} (attempt {}): {}",
                        subject_id, failures, e
                    );
                }
            }
        }
    }
}

/// Disposer for an active subscription; dropping it cancels the task
struct SubscriptionHandle {
    id: u64,
    subject_id: String,
    task: JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct FeedCache {
    shared: Arc<FeedShared>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    next_subscription_id: AtomicU64,
}

impl FeedCache {
    pub fn new(
        remote: Arc<dyn RemoteCollection>,
        toasts: Arc<dyn ToastSink>,
        config: FeedConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(FeedSnapshot::default());
        Self {
            shared: Arc::new(FeedShared {
                remote,
                toasts,
                config,
                state: Mutex::new(FeedState::default()),
                snapshot_tx,
            }),
            subscription: Mutex::new(None),
            next_subscription_id: AtomicU64::new(0),
        }
    }

    /// Replace the feed with the newest page of `subject_id`.
    ///
    /// `None` leaves an empty, idle feed. Fetch failures are logged and leave
    /// the feed empty. A page arriving after a newer call is discarded.
    pub async fn initialize(&self, subject_id: Option<&str>) {
        self.dispose_other_subject(subject_id).await;
        let generation = self.shared.begin_load(subject_id).await;
        if let Some(subject_id) = subject_id {
            self.shared.finish_load(generation, subject_id, true).await;
        }
    }

    // A subscription never outlives a switch to a different subject
    async fn dispose_other_subject(&self, subject_id: Option<&str>) {
        let mut slot = self.subscription.lock().await;
        let stale = match slot.as_ref() {
            Some(handle) => Some(handle.subject_id.as_str()) != subject_id,
            None => false,
        };
        if stale {
            if let Some(previous) = slot.take() {
                self.shared.deactivate(previous.id).await;
                info!(
                    "Disposed subscription {} for previous subject {}",
                    previous.id, previous.subject_id
                );
            }
        }
    }

    /// Start applying change events for `subject_id`, disposing any previous
    /// subscription first.
    pub async fn subscribe(&self, subject_id: &str) {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            self.shared.deactivate(previous.id).await;
            debug!(
                "Disposed subscription {} for subject {}",
                previous.id, previous.subject_id
            );
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.state.lock().await.active_subscription = Some(id);

        let stream = match self.shared.remote.subscribe(subject_id).await {
            Ok(stream) => {
                info!("Subscribed to notification changes for subject {}", subject_id);
                Some(stream)
            }
            Err(e) => {
                error!(
                    "Failed to subscribe to notification changes for subject {}: {}",
                    subject_id, e
                );
                None
            }
        };

        let shared = self.shared.clone();
        let subject = subject_id.to_string();
        let task = tokio::spawn(async move {
            shared.run_subscription(id, subject, stream).await;
        });

        *slot = Some(SubscriptionHandle {
            id,
            subject_id: subject_id.to_string(),
            task,
        });
    }

    /// Cancel the active subscription; no event is applied after this returns
    pub async fn unsubscribe(&self) {
        let previous = self.subscription.lock().await.take();
        if let Some(handle) = previous {
            self.shared.deactivate(handle.id).await;
            info!("Unsubscribed from subject {}", handle.subject_id);
        }
    }

    /// Switch the feed to `subject_id`: dispose, reset, subscribe, load
    pub async fn start(&self, subject_id: Option<&str>) {
        self.unsubscribe().await;
        let generation = self.shared.begin_load(subject_id).await;
        if let Some(subject_id) = subject_id {
            self.subscribe(subject_id).await;
            self.shared.finish_load(generation, subject_id, true).await;
        }
    }

    pub async fn stop(&self) {
        self.unsubscribe().await;
    }

    pub async fn mark_read(&self, notification_id: &str) -> Result<(), NotificationError> {
        match self
            .shared
            .remote
            .update_by_id(notification_id, NotificationPatch::mark_read())
            .await
        {
            Ok(()) => {
                debug!("Requested read flag for notification {}", notification_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to mark notification {} as read: {}",
                    notification_id, e
                );
                self.shared.toasts.show(Toast::error(
                    "Error",
                    "Failed to mark notification as read",
                ));
                Err(e)
            }
        }
    }

    pub async fn mark_all_read(&self, subject_id: &str) -> Result<(), NotificationError> {
        match self
            .shared
            .remote
            .update_unread_for_subject(subject_id, NotificationPatch::mark_read())
            .await
        {
            Ok(()) => {
                info!("Marked all notifications read for subject {}", subject_id);
                self.shared.toasts.show(Toast::success(
                    "Success",
                    "All notifications marked as read",
                ));
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to mark all notifications read for subject {}: {}",
                    subject_id, e
                );
                self.shared.toasts.show(Toast::error(
                    "Error",
                    "Failed to mark all notifications as read",
                ));
                Err(e)
            }
        }
    }

    pub async fn delete_one(&self, notification_id: &str) -> Result<(), NotificationError> {
        match self.shared.remote.delete_by_id(notification_id).await {
            Ok(()) => {
                debug!("Requested deletion of notification {}", notification_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete notification {}: {}", notification_id, e);
                self.shared
                    .toasts
                    .show(Toast::error("Error", "Failed to delete notification"));
                Err(e)
            }
        }
    }

    pub async fn delete_all(&self, subject_id: &str) -> Result<(), NotificationError> {
        match self.shared.remote.delete_for_subject(subject_id).await {
            Ok(()) => {
                info!("Deleted all notifications for subject {}", subject_id);
                self.shared
                    .toasts
                    .show(Toast::success("Success", "All notifications deleted"));
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to delete notifications for subject {}: {}",
                    subject_id, e
                );
                self.shared.toasts.show(Toast::error(
                    "Error",
                    "Failed to delete notifications",
                ));
                Err(e)
            }
        }
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<FeedSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        self.shared.state.lock().await.snapshot()
    }

    pub async fn unread_count(&self) -> usize {
        self.shared.state.lock().await.unread_count
    }

    pub async fn is_loading(&self) -> bool {
        self.shared.state.lock().await.loading
    }

    pub async fn subject_id(&self) -> Option<String> {
        self.shared.state.lock().await.subject_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::remote::MockRemoteCollection;
    use crate::notification::toast::ToastLevel;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures::channel::mpsc;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, NotificationError>>;

    fn notification(id: &str, minute: u32, is_read: bool) -> Notification {
        Notification {
            id: id.to_string(),
            title: format!("Title {}", id),
            message: format!("Message {}", id),
            notification_type: "bid".to_string(),
            is_read,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            listing_id: None,
            related_user_id: None,
        }
    }

    /// In-memory remote that echoes mutations on the change stream like the
    /// real backend does
    #[derive(Default)]
    struct FakeRemote {
        rows: StdMutex<HashMap<String, Vec<Notification>>>,
        senders: StdMutex<HashMap<String, Vec<EventSender>>>,
        fetch_delays: StdMutex<HashMap<String, Duration>>,
        echo: bool,
        subscribe_calls: AtomicUsize,
        update_calls: AtomicUsize,
    }

    impl FakeRemote {
        fn with_rows(subject: &str, rows: Vec<Notification>, echo: bool) -> Self {
            let remote = FakeRemote {
                echo,
                ..Default::default()
            };
            remote
                .rows
                .lock()
                .unwrap()
                .insert(subject.to_string(), rows);
            remote
        }

        fn set_rows(&self, subject: &str, rows: Vec<Notification>) {
            self.rows
                .lock()
                .unwrap()
                .insert(subject.to_string(), rows);
        }

        fn delay_fetch(&self, subject: &str, delay: Duration) {
            self.fetch_delays
                .lock()
                .unwrap()
                .insert(subject.to_string(), delay);
        }

        fn emit(&self, subject: &str, event: ChangeEvent) {
            let mut senders = self.senders.lock().unwrap();
            if let Some(list) = senders.get_mut(subject) {
                list.retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
            }
        }

        fn emit_error(&self, subject: &str) {
            let mut senders = self.senders.lock().unwrap();
            if let Some(list) = senders.get_mut(subject) {
                list.retain(|tx| {
                    tx.unbounded_send(Err(NotificationError::InvalidPayload(
                        "garbage".to_string(),
                    )))
                    .is_ok()
                });
            }
        }

        fn close_streams(&self, subject: &str) {
            self.senders.lock().unwrap().remove(subject);
        }

        fn subject_of(&self, id: &str) -> Option<String> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|(_, rows)| rows.iter().any(|n| n.id == id))
                .map(|(subject, _)| subject.clone())
        }
    }

    #[async_trait]
    impl RemoteCollection for FakeRemote {
        async fn fetch_page(
            &self,
            subject_id: &str,
            limit: i64,
        ) -> Result<Vec<Notification>, NotificationError> {
            let delay = self.fetch_delays.lock().unwrap().get(subject_id).copied();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .get(subject_id)
                .map(|rows| rows.iter().take(limit as usize).cloned().collect())
                .unwrap_or_default())
        }

        async fn subscribe(&self, subject_id: &str) -> Result<ChangeStream, NotificationError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded();
            self.senders
                .lock()
                .unwrap()
                .entry(subject_id.to_string())
                .or_default()
                .push(tx);
            Ok(rx.boxed())
        }

        async fn update_by_id(
            &self,
            id: &str,
            patch: NotificationPatch,
        ) -> Result<(), NotificationError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if !self.echo {
                return Ok(());
            }
            let subject = self.subject_of(id).ok_or(NotificationError::NotFound)?;
            let updated = {
                let mut rows = self.rows.lock().unwrap();
                let row = rows
                    .get_mut(&subject)
                    .and_then(|rows| rows.iter_mut().find(|n| n.id == id))
                    .ok_or(NotificationError::NotFound)?;
                if let Some(is_read) = patch.is_read {
                    row.is_read = is_read;
                }
                row.clone()
            };
            self.emit(&subject, ChangeEvent::Update(updated));
            Ok(())
        }

        async fn update_unread_for_subject(
            &self,
            subject_id: &str,
            patch: NotificationPatch,
        ) -> Result<(), NotificationError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            let updated: Vec<Notification> = {
                let mut rows = self.rows.lock().unwrap();
                rows.get_mut(subject_id)
                    .map(|rows| {
                        rows.iter_mut()
                            .filter(|n| !n.is_read)
                            .map(|n| {
                                if let Some(is_read) = patch.is_read {
                                    n.is_read = is_read;
                                }
                                n.clone()
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            if self.echo {
                for record in updated {
                    self.emit(subject_id, ChangeEvent::Update(record));
                }
            }
            Ok(())
        }

        async fn delete_by_id(&self, id: &str) -> Result<(), NotificationError> {
            let subject = self.subject_of(id).ok_or(NotificationError::NotFound)?;
            if let Some(rows) = self.rows.lock().unwrap().get_mut(&subject) {
                rows.retain(|n| n.id != id);
            }
            if self.echo {
                self.emit(&subject, ChangeEvent::Delete { id: id.to_string() });
            }
            Ok(())
        }

        async fn delete_for_subject(&self, subject_id: &str) -> Result<(), NotificationError> {
            let removed = self
                .rows
                .lock()
                .unwrap()
                .insert(subject_id.to_string(), Vec::new())
                .unwrap_or_default();
            if self.echo {
                for record in removed {
                    self.emit(subject_id, ChangeEvent::Delete { id: record.id });
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingToasts {
        shown: StdMutex<Vec<Toast>>,
    }

    impl RecordingToasts {
        fn all(&self) -> Vec<Toast> {
            self.shown.lock().unwrap().clone()
        }
    }

    impl ToastSink for RecordingToasts {
        fn show(&self, toast: Toast) {
            self.shown.lock().unwrap().push(toast);
        }
    }

    fn test_config() -> FeedConfig {
        FeedConfig {
            page_size: 50,
            max_items: None,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 3,
        }
    }

    fn feed_with(
        remote: Arc<dyn RemoteCollection>,
        config: FeedConfig,
    ) -> (FeedCache, Arc<RecordingToasts>) {
        let toasts = Arc::new(RecordingToasts::default());
        let cache = FeedCache::new(remote, toasts.clone(), config);
        (cache, toasts)
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<FeedSnapshot>, condition: F) -> FeedSnapshot
    where
        F: Fn(&FeedSnapshot) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if condition(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.expect("feed dropped");
            }
        })
        .await
        .expect("feed never reached the expected state")
    }

    fn three_rows() -> Vec<Notification> {
        vec![
            notification("n3", 30, false),
            notification("n2", 20, true),
            notification("n1", 10, false),
        ]
    }

    #[tokio::test]
    async fn test_initial_load() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, toasts) = feed_with(remote, test_config());

        cache.initialize(Some("alice")).await;

        let snapshot = cache.snapshot().await;
        let ids: Vec<&str> = snapshot.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n3", "n2", "n1"]);
        assert_eq!(snapshot.unread_count, 2);
        assert!(!snapshot.loading);
        assert!(toasts.all().is_empty());
        assert_eq!(cache.subject_id().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_initialize_without_subject_is_idle() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote, test_config());

        cache.initialize(Some("alice")).await;
        cache.initialize(None).await;

        let snapshot = cache.snapshot().await;
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.unread_count, 0);
        assert!(!cache.is_loading().await);
        assert!(cache.subject_id().await.is_none());
    }

    #[tokio::test]
    async fn test_initial_page_is_bounded_by_page_size() {
        let rows: Vec<Notification> = (0..60)
            .rev()
            .map(|i| notification(&format!("n{}", i), i % 60, false))
            .collect();
        let remote = Arc::new(FakeRemote::with_rows("alice", rows, false));
        let (cache, _) = feed_with(remote, test_config());

        cache.initialize(Some("alice")).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.notifications.len(), 50);
        assert_eq!(snapshot.unread_count, 50);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_empty_feed_without_toast() {
        let mut remote = MockRemoteCollection::new();
        remote
            .expect_fetch_page()
            .times(1)
            .returning(|_, _| Err(NotificationError::InternalError("offline".to_string())));
        let (cache, toasts) = feed_with(Arc::new(remote), test_config());

        cache.initialize(Some("alice")).await;

        let snapshot = cache.snapshot().await;
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.unread_count, 0);
        assert!(!snapshot.loading);
        assert!(toasts.all().is_empty());
    }

    #[tokio::test]
    async fn test_subject_switch_replaces_state() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        remote.set_rows("bob", vec![notification("b1", 5, false)]);
        let (cache, _) = feed_with(remote, test_config());

        cache.initialize(Some("alice")).await;
        cache.initialize(Some("bob")).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.notifications[0].id, "b1");
        assert_eq!(snapshot.unread_count, 1);
    }

    #[tokio::test]
    async fn test_stale_page_is_discarded() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        remote.set_rows("bob", vec![notification("b1", 5, false)]);
        remote.delay_fetch("alice", Duration::from_millis(200));
        let (cache, _) = feed_with(remote, test_config());
        let cache = Arc::new(cache);

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.initialize(Some("alice")).await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(cache.is_loading().await);

        cache.initialize(Some("bob")).await;
        slow.await.unwrap();

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.notifications[0].id, "b1");
        assert_eq!(snapshot.unread_count, 1);
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn test_insert_while_subscribed() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        assert_eq!(cache.unread_count().await, 2);

        let mut fresh = notification("n4", 40, false);
        fresh.listing_id = Some("listing-1".to_string());
        remote.emit("alice", ChangeEvent::Insert(fresh));

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.notifications[0].id, "n4");
        assert_eq!(snapshot.unread_count, 3);

        let shown = toasts.all();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].level, ToastLevel::Info);
        assert_eq!(shown[0].title, "Title n4");
        assert!(shown[0].action.is_some());
    }

    #[tokio::test]
    async fn test_inserts_in_creation_order_keep_list_sorted() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        for minute in 31..40 {
            remote.emit(
                "alice",
                ChangeEvent::Insert(notification(&format!("i{}", minute), minute, false)),
            );
        }

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 12).await;
        assert!(snapshot
            .notifications
            .windows(2)
            .all(|pair| pair[0].created_at >= pair[1].created_at));
    }

    #[tokio::test]
    async fn test_insert_of_read_record_still_counts_as_unread() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, true)));

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.unread_count, 3);
    }

    #[tokio::test]
    async fn test_update_to_unread_never_increments() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Update(notification("n2", 20, false)));

        let snapshot = wait_for(&mut rx, |s| {
            s.notifications.iter().any(|n| n.id == "n2" && !n.is_read)
        })
        .await;
        assert_eq!(snapshot.unread_count, 2);
        assert_eq!(snapshot.notifications[1].id, "n2");
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_ignored() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Insert(notification("n3", 30, false)));
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.unread_count, 3);
        assert_eq!(
            snapshot.notifications.iter().filter(|n| n.id == "n3").count(),
            1
        );
        assert_eq!(toasts.all().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_record_is_noop() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Delete { id: "missing".to_string() });
        // Marker insert so we know the delete has been processed
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, true)));

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.unread_count, 3);
    }

    #[tokio::test]
    async fn test_delete_of_unread_record_decrements() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Delete { id: "n2".to_string() });
        remote.emit("alice", ChangeEvent::Delete { id: "n1".to_string() });

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 1).await;
        assert_eq!(snapshot.notifications[0].id, "n3");
        assert_eq!(snapshot.unread_count, 1);
    }

    #[tokio::test]
    async fn test_mark_read_waits_for_echo() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        cache.mark_read("n1").await.unwrap();

        assert_eq!(remote.update_calls.load(Ordering::SeqCst), 1);
        let before = cache.snapshot().await;
        assert_eq!(before.unread_count, 2);
        assert!(!before.notifications[2].is_read);

        remote.emit("alice", ChangeEvent::Update(notification("n1", 10, true)));

        let after = wait_for(&mut rx, |s| s.notifications[2].is_read).await;
        assert_eq!(after.notifications[2].id, "n1");
        assert_eq!(after.unread_count, 1);
        assert!(toasts.all().is_empty());
    }

    #[tokio::test]
    async fn test_mark_all_read_reconciles_through_events() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), true));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        cache.mark_all_read("alice").await.unwrap();

        let snapshot = wait_for(&mut rx, |s| s.notifications.iter().all(|n| n.is_read)).await;
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(snapshot.notifications.len(), 3);

        let shown = toasts.all();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].level, ToastLevel::Success);
    }

    #[tokio::test]
    async fn test_delete_all_empties_feed() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), true));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        cache.delete_all("alice").await.unwrap();

        let snapshot = wait_for(&mut rx, |s| s.notifications.is_empty()).await;
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(toasts.all()[0].level, ToastLevel::Success);
    }

    #[tokio::test]
    async fn test_delete_one_through_echo() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), true));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        cache.delete_one("n3").await.unwrap();

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 2).await;
        assert_eq!(snapshot.notifications[0].id, "n2");
        assert_eq!(snapshot.unread_count, 1);
        assert!(toasts.all().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_failures_toast_and_leave_state() {
        let mut remote = MockRemoteCollection::new();
        remote
            .expect_fetch_page()
            .returning(|_, _| Ok(vec![notification("n1", 10, false)]));
        remote
            .expect_update_by_id()
            .returning(|_, _| Err(NotificationError::NotFound));
        remote
            .expect_update_unread_for_subject()
            .returning(|_, _| Err(NotificationError::InternalError("denied".to_string())));
        remote
            .expect_delete_by_id()
            .returning(|_| Err(NotificationError::InternalError("denied".to_string())));
        remote
            .expect_delete_for_subject()
            .returning(|_| Err(NotificationError::InternalError("denied".to_string())));
        let (cache, toasts) = feed_with(Arc::new(remote), test_config());

        cache.initialize(Some("alice")).await;
        assert!(cache.mark_read("n1").await.is_err());
        assert!(cache.mark_all_read("alice").await.is_err());
        assert!(cache.delete_one("n1").await.is_err());
        assert!(cache.delete_all("alice").await.is_err());

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.unread_count, 1);

        let shown = toasts.all();
        assert_eq!(shown.len(), 4);
        assert!(shown.iter().all(|t| t.level == ToastLevel::Error));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_event_handling() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, toasts) = feed_with(remote.clone(), test_config());

        cache.start(Some("alice")).await;
        cache.unsubscribe().await;

        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));
        remote.emit("alice", ChangeEvent::Delete { id: "n3".to_string() });
        sleep(Duration::from_millis(50)).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.notifications.len(), 3);
        assert_eq!(snapshot.unread_count, 2);
        assert!(toasts.all().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_disposes_previous_subscription() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.initialize(Some("alice")).await;
        cache.subscribe("alice").await;
        cache.subscribe("alice").await;

        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));

        wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        sleep(Duration::from_millis(50)).await;
        // A leaked subscription would have counted the insert twice
        assert_eq!(cache.unread_count().await, 3);
    }

    #[tokio::test]
    async fn test_malformed_events_are_skipped() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit_error("alice");
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.unread_count, 3);
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_ends() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        assert_eq!(remote.subscribe_calls.load(Ordering::SeqCst), 1);
        remote.close_streams("alice");

        timeout(Duration::from_secs(2), async {
            while remote.subscribe_calls.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cache never reconnected");

        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));
        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.unread_count, 3);
    }

    #[tokio::test]
    async fn test_max_items_evicts_oldest() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let config = FeedConfig {
            max_items: Some(3),
            ..test_config()
        };
        let (cache, _) = feed_with(remote.clone(), config);
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, true)));

        let snapshot =
            wait_for(&mut rx, |s| s.notifications.first().map(|n| n.id.as_str()) == Some("n4"))
                .await;
        let ids: Vec<&str> = snapshot.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n4", "n3", "n2"]);
        // +1 for the insert, -1 for the evicted unread n1
        assert_eq!(snapshot.unread_count, 2);
    }

    #[tokio::test]
    async fn test_insert_during_initial_fetch_survives_page_load() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        remote.delay_fetch("alice", Duration::from_millis(200));
        let (cache, toasts) = feed_with(remote.clone(), test_config());
        let cache = Arc::new(cache);

        let starting = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.start(Some("alice")).await })
        };
        sleep(Duration::from_millis(50)).await;
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));
        starting.await.unwrap();

        let snapshot = cache.snapshot().await;
        let ids: Vec<&str> = snapshot.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n4", "n3", "n2", "n1"]);
        assert_eq!(snapshot.unread_count, 3);
        assert!(!snapshot.loading);
        assert_eq!(toasts.all().len(), 1);
    }

    #[tokio::test]
    async fn test_changes_already_in_page_are_not_applied_twice() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        remote.delay_fetch("alice", Duration::from_millis(200));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let cache = Arc::new(cache);

        let starting = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.start(Some("alice")).await })
        };
        sleep(Duration::from_millis(50)).await;

        // Both changes commit before the page query runs
        remote.set_rows(
            "alice",
            vec![
                notification("n4", 40, false),
                notification("n3", 30, false),
                notification("n2", 20, true),
                notification("n1", 10, true),
            ],
        );
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));
        remote.emit("alice", ChangeEvent::Update(notification("n1", 10, true)));
        starting.await.unwrap();

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.notifications.len(), 4);
        assert_eq!(
            snapshot.notifications.iter().filter(|n| n.id == "n4").count(),
            1
        );
        assert_eq!(snapshot.unread_count, 2);
    }

    #[tokio::test]
    async fn test_initialize_for_other_subject_disposes_subscription() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        remote.set_rows("bob", vec![notification("b1", 5, false)]);
        let (cache, toasts) = feed_with(remote.clone(), test_config());

        cache.start(Some("alice")).await;
        cache.initialize(Some("bob")).await;

        remote.emit("alice", ChangeEvent::Insert(notification("a9", 50, false)));
        sleep(Duration::from_millis(50)).await;

        let snapshot = cache.snapshot().await;
        let ids: Vec<&str> = snapshot.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b1"]);
        assert_eq!(snapshot.unread_count, 1);
        assert_eq!(cache.subject_id().await.as_deref(), Some("bob"));
        assert!(toasts.all().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_same_subject_keeps_subscription() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        cache.initialize(Some("alice")).await;
        remote.emit("alice", ChangeEvent::Insert(notification("n4", 40, false)));

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 4).await;
        assert_eq!(snapshot.unread_count, 3);
        assert_eq!(remote.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_refetches_changes_missed_while_down() {
        let remote = Arc::new(FakeRemote::with_rows("alice", three_rows(), false));
        let (cache, _) = feed_with(remote.clone(), test_config());
        let mut rx = cache.watch();

        cache.start(Some("alice")).await;
        remote.close_streams("alice");
        // Deleted while no stream is open, so no event is ever delivered
        remote.set_rows(
            "alice",
            vec![notification("n3", 30, false), notification("n2", 20, true)],
        );

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 2 && !s.loading).await;
        let ids: Vec<&str> = snapshot.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n3", "n2"]);
        assert_eq!(snapshot.unread_count, 1);
        assert!(remote.subscribe_calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_replay_skips_changes_reflected_in_page() {
        let mut state = FeedState {
            pending: vec![
                ChangeEvent::Insert(notification("n2", 20, false)),
                ChangeEvent::Update(notification("n1", 10, true)),
                ChangeEvent::Insert(notification("n3", 30, false)),
                ChangeEvent::Delete { id: "n0".to_string() },
            ],
            ..Default::default()
        };
        state.load_page(
            vec![notification("n2", 20, false), notification("n1", 10, true)],
            None,
        );
        assert_eq!(state.unread_count, 1);

        assert_eq!(state.replay_pending(None), 1);
        let ids: Vec<&str> = state.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n3", "n2", "n1"]);
        assert_eq!(state.unread_count, 2);
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_update_decrement_is_floored() {
        let mut state = FeedState::default();
        state.load_page(vec![notification("n1", 10, true)], None);
        assert_eq!(state.unread_count, 0);

        let applied = state.apply(&ChangeEvent::Update(notification("n1", 10, true)), None);
        assert_eq!(applied, Applied::Updated);
        assert_eq!(state.unread_count, 0);

        let applied = state.apply(&ChangeEvent::Update(notification("zz", 10, true)), None);
        assert_eq!(applied, Applied::Ignored);
        assert_eq!(state.notifications.len(), 1);
    }
}
