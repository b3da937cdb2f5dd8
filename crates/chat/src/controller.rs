use std::sync::Arc;
use std::time::Duration;

use adhikari_backend::{
    BoxFuture, Identity, IdentityProvider, InsertSubscription, MessageRecord, MessageStore,
    NewMessage, UserId,
};
use tokio::sync::mpsc;

use crate::engine::RecommendationEngine;
use crate::error::{NotAuthenticatedSnafu, SyncResult, bounded_store_call};
use crate::events::{ControllerCommand, ControllerEvent, SubmitOutcome};
use crate::log::MessageLog;
use crate::message::{ChatMessage, WELCOME_MESSAGE};
use crate::plan::PlanResult;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Upper bound for every fetch and write against the message store.
    pub store_timeout: Duration,
    pub welcome_message: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            welcome_message: WELCOME_MESSAGE.to_string(),
        }
    }
}

/// Keeps the chat panel's message list in step with the backend log.
///
/// The controller is the only writer of its list. It reacts to identity changes,
/// live inserts, user submissions and finished plans one at a time, and holds at
/// most one insert subscription, always scoped to the current user.
pub struct ConversationSyncController {
    store: Arc<dyn MessageStore>,
    identity_provider: Arc<dyn IdentityProvider>,
    engine: Arc<dyn RecommendationEngine>,
    config: SyncConfig,
    events: mpsc::UnboundedSender<ControllerEvent>,
    identity: Identity,
    messages: MessageLog,
    pending_input: String,
    busy: bool,
    auth_prompt_open: bool,
    subscription: Option<InsertSubscription>,
    in_flight_plan: Option<BoxFuture<'static, PlanResult>>,
    /// User whose submission the next plan result answers.
    plan_owner: Option<UserId>,
}

impl ConversationSyncController {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity_provider: Arc<dyn IdentityProvider>,
        engine: Arc<dyn RecommendationEngine>,
        config: SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let messages = MessageLog::with_welcome(config.welcome_message.clone());
        let controller = Self {
            store,
            identity_provider,
            engine,
            config,
            events,
            identity: Identity::Anonymous,
            messages,
            pending_input: String::new(),
            busy: false,
            auth_prompt_open: false,
            subscription: None,
            in_flight_plan: None,
            plan_owner: None,
        };

        (controller, events_rx)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.snapshot()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn pending_input(&self) -> &str {
        &self.pending_input
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn auth_prompt_open(&self) -> bool {
        self.auth_prompt_open
    }

    pub fn has_active_subscription(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(InsertSubscription::is_active)
    }

    pub fn set_pending_input(&mut self, text: impl Into<String>) {
        self.pending_input = text.into();
    }

    pub fn dismiss_auth_prompt(&mut self) {
        self.set_auth_prompt(false);
    }

    pub async fn on_identity_change(&mut self, next: Identity) {
        if next == self.identity {
            return;
        }

        let previous = std::mem::replace(&mut self.identity, next.clone());
        // The old feed must be gone before anything for the new identity exists.
        self.cancel_subscription();

        // A plan still running belongs to the previous identity.
        if self.in_flight_plan.take().is_some() {
            tracing::debug!("abandoning plan request of the previous identity");
        }
        self.set_busy(false);

        if previous.is_authenticated() {
            self.messages
                .reset_to_welcome(self.config.welcome_message.clone());
            self.emit_messages();
        }

        tracing::info!(
            authenticated = next.is_authenticated(),
            user_id = ?next.user_id(),
            "chat identity changed"
        );
        self.emit(ControllerEvent::IdentityChanged(next.clone()));

        if next.is_authenticated() {
            self.set_auth_prompt(false);
            self.subscribe_to_inserts();
            if let Err(error) = self.load_history().await {
                tracing::error!(%error, "failed to load chat history");
            }
        }
    }

    /// Replaces the list with the signed-in user's history.
    ///
    /// On failure the list is left exactly as it was.
    pub async fn load_history(&mut self) -> SyncResult<()> {
        let Some(user_id) = self.identity.user_id() else {
            return NotAuthenticatedSnafu {
                stage: "load-history-identity",
                operation: "load chat history",
            }
            .fail();
        };

        let store = Arc::clone(&self.store);
        let history = bounded_store_call(
            self.config.store_timeout,
            "load-history-fetch",
            "fetch chat history",
            store.fetch_messages(user_id),
        )
        .await?;

        tracing::debug!(user_id = %user_id, rows = history.len(), "loaded chat history");
        self.messages
            .replace_with_history(history.into_iter().map(ChatMessage::from));
        self.emit_messages();
        Ok(())
    }

    pub fn subscribe_to_inserts(&mut self) {
        let Some(user_id) = self.identity.user_id() else {
            tracing::warn!("ignoring insert subscription request for a signed-out session");
            return;
        };

        self.cancel_subscription();
        self.subscription = Some(self.store.subscribe_inserts(user_id));
        tracing::debug!(user_id = %user_id, "subscribed to chat inserts");
    }

    /// Cancels the live insert feed, if any. Safe to call repeatedly.
    pub fn cancel_subscription(&mut self) -> bool {
        self.subscription
            .take()
            .is_some_and(|mut subscription| subscription.cancel())
    }

    /// Merges one delivered insert into the list.
    pub fn apply_insert(&mut self, record: MessageRecord) {
        if self.identity.user_id() != Some(record.user_id) {
            tracing::debug!(
                message_id = %record.id,
                "dropping insert that does not belong to the current user"
            );
            return;
        }

        if self.messages.merge([ChatMessage::from(record)]) {
            self.emit_messages();
        }
    }

    /// Waits for the next live insert and merges it. Returns `false` once no feed is active.
    pub async fn pump_insert(&mut self) -> bool {
        let Some(subscription) = self.subscription.as_mut() else {
            return false;
        };

        match subscription.recv().await {
            Some(record) => {
                self.apply_insert(record);
                true
            }
            None => {
                self.subscription = None;
                false
            }
        }
    }

    pub async fn submit(&mut self, text: &str) -> SubmitOutcome {
        if text.trim().is_empty() || self.busy {
            return SubmitOutcome::Ignored;
        }

        self.pending_input = text.to_string();

        if !self.identity.is_authenticated() {
            return self.request_authentication();
        }

        // The session may have ended or changed hands since the last notification.
        let Some(user_id) = self.identity_provider.current_identity().await.user_id() else {
            return self.request_authentication();
        };
        if self.identity.user_id() != Some(user_id) {
            tracing::warn!(
                user_id = %user_id,
                "session changed before its notification arrived, not sending"
            );
            return SubmitOutcome::IdentityChanged;
        }

        let store = Arc::clone(&self.store);
        let persisted = bounded_store_call(
            self.config.store_timeout,
            "submit-persist-user-message",
            "save the user message",
            store.insert_message(user_id, NewMessage::user(text)),
        )
        .await;

        match persisted {
            Ok(record) => {
                tracing::info!(message_id = %record.id, "saved user message");
                self.in_flight_plan = Some(self.engine.request_plan(text.to_string()));
                self.plan_owner = Some(user_id);
                self.set_busy(true);
                self.pending_input.clear();
                SubmitOutcome::Forwarded {
                    message_id: record.id,
                }
            }
            Err(error) => {
                tracing::error!(%error, "error saving message");
                self.emit(ControllerEvent::SubmitFailed {
                    reason: error.to_string(),
                });
                SubmitOutcome::PersistFailed
            }
        }
    }

    /// Waits for the outstanding plan request, if any, without applying it.
    pub async fn await_plan(&mut self) -> Option<PlanResult> {
        let plan = self.in_flight_plan.take()?;
        Some(plan.await)
    }

    /// Writes the assistant reply for `plan`.
    ///
    /// A reply requested by a different user than the one signed in now is dropped.
    pub async fn on_plan_result(&mut self, plan: PlanResult) {
        self.in_flight_plan = None;
        let owner = self.plan_owner.take();
        self.set_busy(false);

        let Some(reply) = plan.assistant_reply() else {
            tracing::debug!(?plan, "plan produced no assistant reply");
            return;
        };

        if !self.identity.is_authenticated() {
            tracing::debug!("dropping assistant reply for a signed-out session");
            return;
        }

        let Some(user_id) = self.identity_provider.current_identity().await.user_id() else {
            return;
        };
        if self.identity.user_id() != Some(user_id) || owner.is_some_and(|owner| owner != user_id) {
            tracing::debug!(user_id = %user_id, "dropping assistant reply requested by another user");
            return;
        }

        let store = Arc::clone(&self.store);
        let timeout = self.config.store_timeout;
        tokio::spawn(async move {
            let saved = bounded_store_call(
                timeout,
                "plan-persist-assistant-message",
                "save the assistant message",
                store.insert_message(user_id, NewMessage::assistant(reply)),
            )
            .await;

            match saved {
                Ok(record) => tracing::debug!(message_id = %record.id, "saved assistant message"),
                Err(error) => tracing::error!(%error, "error saving message"),
            }
        });
    }

    /// Drives the controller until `Shutdown` or until `commands` closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControllerCommand>) {
        let mut identity_watch = self.identity_provider.watch();
        self.emit_messages();
        self.on_identity_change(identity_watch.current()).await;

        loop {
            tokio::select! {
                changed = identity_watch.changed() => match changed {
                    Some(identity) => self.on_identity_change(identity).await,
                    None => {
                        tracing::warn!("identity provider went away, stopping chat sync");
                        break;
                    }
                },
                delivered = next_insert(&mut self.subscription) => match delivered {
                    Some(record) => self.apply_insert(record),
                    None => {
                        tracing::warn!("chat insert feed closed");
                        self.subscription = None;
                    }
                },
                plan = next_plan(&mut self.in_flight_plan) => self.on_plan_result(plan).await,
                command = commands.recv() => match command {
                    Some(ControllerCommand::SetInput(text)) => self.set_pending_input(text),
                    Some(ControllerCommand::Submit(text)) => {
                        let outcome = self.submit(&text).await;
                        tracing::debug!(?outcome, "handled submit");
                    }
                    Some(ControllerCommand::PlanResult(plan)) => self.on_plan_result(plan).await,
                    Some(ControllerCommand::DismissAuthPrompt) => self.dismiss_auth_prompt(),
                    Some(ControllerCommand::Shutdown) | None => break,
                },
            }
        }

        identity_watch.unsubscribe();
        self.cancel_subscription();
        tracing::debug!("chat sync stopped");
    }

    fn request_authentication(&mut self) -> SubmitOutcome {
        self.emit(ControllerEvent::AuthRequired);
        self.set_auth_prompt(true);
        SubmitOutcome::AuthRequired
    }

    fn set_busy(&mut self, busy: bool) {
        if self.busy != busy {
            self.busy = busy;
            self.emit(ControllerEvent::BusyChanged(busy));
        }
    }

    fn set_auth_prompt(&mut self, open: bool) {
        if self.auth_prompt_open != open {
            self.auth_prompt_open = open;
            self.emit(ControllerEvent::AuthPromptChanged(open));
        }
    }

    fn emit_messages(&self) {
        self.emit(ControllerEvent::MessagesChanged {
            messages: self.messages.snapshot(),
            latest: self.messages.latest_key(),
        });
    }

    fn emit(&self, event: ControllerEvent) {
        // A closed receiver only means nothing is rendering anymore.
        let _ = self.events.send(event);
    }
}

impl Drop for ConversationSyncController {
    fn drop(&mut self) {
        self.cancel_subscription();
    }
}

async fn next_insert(subscription: &mut Option<InsertSubscription>) -> Option<MessageRecord> {
    match subscription.as_mut() {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_plan(plan: &mut Option<BoxFuture<'static, PlanResult>>) -> PlanResult {
    match plan.as_mut() {
        Some(plan) => plan.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use adhikari_backend::{
        InsertFeed, LocalSessionProvider, MessageId, MessageRole, StorageResult, UserId,
    };
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::error::SyncError;
    use crate::message::MessageKey;

    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<Vec<MessageRecord>>,
        feed: InsertFeed,
        fail_fetch: AtomicBool,
        fail_insert: AtomicBool,
        stall: AtomicBool,
    }

    impl FakeStore {
        fn writes(&self) -> usize {
            self.rows.lock().unwrap().len()
        }

        fn seed(&self, user_id: UserId, role: MessageRole, content: &str, seconds: i64) -> MessageRecord {
            let record = MessageRecord {
                id: MessageId::new_v7(),
                user_id,
                role,
                content: content.to_string(),
                created_at: Utc.timestamp_opt(1_717_200_000 + seconds, 0).unwrap(),
            };
            self.rows.lock().unwrap().push(record.clone());
            record
        }

        fn seed_and_publish(&self, user_id: UserId, content: &str, seconds: i64) -> MessageRecord {
            let record = self.seed(user_id, MessageRole::User, content, seconds);
            self.feed.publish(record.clone());
            record
        }
    }

    impl MessageStore for FakeStore {
        fn fetch_messages<'a>(
            &'a self,
            user_id: UserId,
        ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
            Box::pin(async move {
                if self.stall.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                if self.fail_fetch.load(Ordering::SeqCst) {
                    return Err(adhikari_backend::StorageError::InvariantViolation {
                        stage: "fake-fetch",
                        details: "backend unavailable".to_string(),
                    });
                }

                let mut rows = self
                    .rows
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|record| record.user_id == user_id)
                    .cloned()
                    .collect::<Vec<_>>();
                rows.sort_by_key(|record| record.created_at);
                Ok(rows)
            })
        }

        fn insert_message<'a>(
            &'a self,
            user_id: UserId,
            input: NewMessage,
        ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
            Box::pin(async move {
                if self.stall.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                if self.fail_insert.load(Ordering::SeqCst) {
                    return Err(adhikari_backend::StorageError::InvariantViolation {
                        stage: "fake-insert",
                        details: "write rejected".to_string(),
                    });
                }

                let record = MessageRecord {
                    id: MessageId::new_v7(),
                    user_id,
                    role: input.role,
                    content: input.content,
                    created_at: Utc::now(),
                };
                self.rows.lock().unwrap().push(record.clone());
                self.feed.publish(record.clone());
                Ok(record)
            })
        }

        fn subscribe_inserts(&self, user_id: UserId) -> InsertSubscription {
            self.feed.subscribe(user_id)
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        requests: Mutex<Vec<String>>,
    }

    impl RecommendationEngine for FakeEngine {
        fn request_plan(&self, text: String) -> BoxFuture<'static, PlanResult> {
            self.requests.lock().unwrap().push(text.clone());
            Box::pin(async move { PlanResult::event(text) })
        }
    }

    struct Harness {
        controller: ConversationSyncController,
        events: mpsc::UnboundedReceiver<ControllerEvent>,
        store: Arc<FakeStore>,
        engine: Arc<FakeEngine>,
        sessions: Arc<LocalSessionProvider>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(FakeStore::default());
            let engine = Arc::new(FakeEngine::default());
            let sessions = Arc::new(LocalSessionProvider::in_memory());
            let config = SyncConfig {
                store_timeout: Duration::from_secs(2),
                ..SyncConfig::default()
            };
            let (controller, events) = ConversationSyncController::new(
                store.clone(),
                sessions.clone(),
                engine.clone(),
                config,
            );

            Self {
                controller,
                events,
                store,
                engine,
                sessions,
            }
        }

        async fn sign_in(&mut self, email: &str) -> UserId {
            let user = self.sessions.sign_in(email).unwrap();
            self.controller
                .on_identity_change(Identity::Authenticated(user.clone()))
                .await;
            user.user_id
        }

        async fn sign_out(&mut self) {
            self.sessions.sign_out().unwrap();
            self.controller.on_identity_change(Identity::Anonymous).await;
        }

        async fn pump(&mut self) -> bool {
            tokio::time::timeout(Duration::from_secs(2), self.controller.pump_insert())
                .await
                .unwrap_or(false)
        }

        fn drain_events(&mut self) -> Vec<ControllerEvent> {
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                drained.push(event);
            }
            drained
        }

        fn contents(&self) -> Vec<String> {
            self.controller
                .messages()
                .into_iter()
                .map(|message| message.content)
                .collect()
        }
    }

    #[tokio::test]
    async fn starts_with_only_the_welcome_message() {
        let harness = Harness::new();
        assert_eq!(harness.contents(), vec![WELCOME_MESSAGE.to_string()]);
        assert!(!harness.controller.has_active_subscription());
    }

    #[tokio::test]
    async fn sign_in_replaces_welcome_with_history() {
        let mut harness = Harness::new();
        let ada = UserId::from_email("ada@example.com");
        harness.store.seed(ada, MessageRole::User, "Tokyo in winter", 1);
        harness
            .store
            .seed(ada, MessageRole::Assistant, "Layer up", 2);

        harness.sign_in("ada@example.com").await;

        assert_eq!(harness.contents(), vec!["Tokyo in winter", "Layer up"]);
        assert!(harness.controller.has_active_subscription());
    }

    #[tokio::test]
    async fn empty_history_still_drops_the_welcome_message() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;
        assert_eq!(harness.controller.message_count(), 0);
    }

    #[tokio::test]
    async fn row_seen_by_history_and_feed_is_listed_once() {
        let mut harness = Harness::new();
        let ada = harness.sign_in("ada@example.com").await;

        // Delivered live first, then seen again by a reload.
        let live = harness.store.seed_and_publish(ada, "Rave party", 5);
        assert!(harness.pump().await);
        harness.controller.load_history().await.unwrap();
        assert_eq!(harness.contents(), vec!["Rave party"]);

        // Seen by a reload first, then delivered live.
        let second = harness.store.seed_and_publish(ada, "Titanic movie outfits", 6);
        harness.controller.load_history().await.unwrap();
        assert!(harness.pump().await);

        let keys = harness
            .controller
            .messages()
            .into_iter()
            .map(|message| message.key)
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![MessageKey::Durable(live.id), MessageKey::Durable(second.id)]
        );
    }

    #[tokio::test]
    async fn live_rows_are_ordered_by_timestamp() {
        let mut harness = Harness::new();
        let ada = harness.sign_in("ada@example.com").await;

        for (content, seconds) in [("third", 30), ("first", 10), ("second", 20)] {
            harness.store.seed_and_publish(ada, content, seconds);
            assert!(harness.pump().await);
        }

        assert_eq!(harness.contents(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn switching_users_never_shows_the_previous_users_rows() {
        let mut harness = Harness::new();
        let ada = harness.sign_in("ada@example.com").await;
        harness.store.seed_and_publish(ada, "ada's question", 1);
        assert!(harness.pump().await);

        let grace = harness.sign_in("grace@example.com").await;
        assert_eq!(harness.controller.message_count(), 0);

        harness.store.seed_and_publish(ada, "late row for ada", 2);
        harness.store.seed_and_publish(grace, "grace's question", 3);
        assert!(harness.pump().await);
        assert_eq!(harness.contents(), vec!["grace's question"]);

        // A stray row for the previous user is refused even if handed over directly.
        let stray = harness
            .store
            .seed(ada, MessageRole::User, "stray", 4);
        harness.controller.apply_insert(stray);
        assert_eq!(harness.contents(), vec!["grace's question"]);
    }

    #[tokio::test]
    async fn sign_out_cancels_feed_and_resets_to_welcome() {
        let mut harness = Harness::new();
        let ada = harness.sign_in("ada@example.com").await;
        harness.store.seed_and_publish(ada, "Rave party", 1);
        assert!(harness.pump().await);

        harness.sign_out().await;

        assert!(!harness.controller.has_active_subscription());
        assert_eq!(harness.contents(), vec![WELCOME_MESSAGE.to_string()]);
        assert!(!harness.controller.pump_insert().await);
    }

    #[tokio::test]
    async fn cancelling_twice_is_harmless() {
        let mut harness = Harness::new();
        let ada = harness.sign_in("ada@example.com").await;

        assert!(harness.controller.cancel_subscription());
        assert!(!harness.controller.cancel_subscription());

        harness.store.seed_and_publish(ada, "after cancel", 1);
        assert!(!harness.controller.pump_insert().await);
        assert_eq!(harness.controller.message_count(), 0);
    }

    #[tokio::test]
    async fn failed_history_fetch_keeps_the_current_list() {
        let mut harness = Harness::new();
        harness.store.fail_fetch.store(true, Ordering::SeqCst);

        harness.sign_in("ada@example.com").await;

        assert_eq!(harness.contents(), vec![WELCOME_MESSAGE.to_string()]);
        assert!(harness.controller.load_history().await.is_err());
        assert_eq!(harness.contents(), vec![WELCOME_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn blank_submissions_are_ignored() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;

        assert_eq!(harness.controller.submit("").await, SubmitOutcome::Ignored);
        assert_eq!(harness.controller.submit("   ").await, SubmitOutcome::Ignored);
        assert_eq!(harness.store.writes(), 0);
        assert!(harness.engine.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn signed_out_submit_asks_for_authentication_without_writing() {
        let mut harness = Harness::new();

        let outcome = harness.controller.submit("hello").await;

        assert_eq!(outcome, SubmitOutcome::AuthRequired);
        assert_eq!(harness.store.writes(), 0);
        assert!(harness.controller.auth_prompt_open());
        assert_eq!(harness.controller.pending_input(), "hello");
        let events = harness.drain_events();
        assert!(events.contains(&ControllerEvent::AuthRequired));
        assert!(events.contains(&ControllerEvent::AuthPromptChanged(true)));

        harness.sign_in("ada@example.com").await;
        assert!(!harness.controller.auth_prompt_open());
    }

    #[tokio::test]
    async fn submit_persists_then_forwards_and_waits_for_the_feed() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;
        harness.controller.set_pending_input("I'm heading to Paris next week");

        let outcome = harness
            .controller
            .submit("I'm heading to Paris next week")
            .await;

        assert!(matches!(outcome, SubmitOutcome::Forwarded { .. }));
        assert_eq!(harness.store.writes(), 1);
        assert_eq!(
            *harness.engine.requests.lock().unwrap(),
            vec!["I'm heading to Paris next week".to_string()]
        );
        assert!(harness.controller.is_busy());
        assert_eq!(harness.controller.pending_input(), "");
        // Nothing is shown until the store echoes the row back.
        assert_eq!(harness.controller.message_count(), 0);

        assert!(harness.pump().await);
        assert_eq!(harness.contents(), vec!["I'm heading to Paris next week"]);

        assert_eq!(
            harness.controller.submit("another one").await,
            SubmitOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn failed_user_write_does_not_request_a_plan() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;
        harness.store.fail_insert.store(true, Ordering::SeqCst);

        let outcome = harness.controller.submit("Rave party").await;

        assert_eq!(outcome, SubmitOutcome::PersistFailed);
        assert!(harness.engine.requests.lock().unwrap().is_empty());
        assert!(!harness.controller.is_busy());
        assert_eq!(harness.controller.pending_input(), "Rave party");
        assert!(
            harness
                .drain_events()
                .iter()
                .any(|event| matches!(event, ControllerEvent::SubmitFailed { .. }))
        );
    }

    #[tokio::test]
    async fn plan_result_adds_one_assistant_message_when_signed_in() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;

        harness
            .controller
            .on_plan_result(PlanResult::travel("Paris", "2024-06-01"))
            .await;
        assert!(harness.pump().await);

        let messages = harness.controller.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert!(messages[0].content.contains("Paris"));

        harness
            .controller
            .on_plan_result(PlanResult::error("timeout"))
            .await;
        assert!(harness.pump().await);

        let messages = harness.controller.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("timeout"));
    }

    #[tokio::test]
    async fn plan_result_is_dropped_for_signed_out_sessions() {
        let mut harness = Harness::new();

        harness
            .controller
            .on_plan_result(PlanResult::travel("Paris", "2024-06-01"))
            .await;
        harness
            .controller
            .on_plan_result(PlanResult::error("timeout"))
            .await;
        tokio::task::yield_now().await;

        assert_eq!(harness.controller.message_count(), 1);
        assert_eq!(harness.store.writes(), 0);
    }

    #[tokio::test]
    async fn plan_result_clears_busy() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;
        harness.controller.submit("Baby shower outfit").await;
        assert!(harness.controller.is_busy());

        let plan = harness.controller.await_plan().await.unwrap();
        assert_eq!(plan, PlanResult::event("Baby shower outfit"));
        harness.controller.on_plan_result(plan).await;

        assert!(!harness.controller.is_busy());
        let events = harness.drain_events();
        assert!(events.contains(&ControllerEvent::BusyChanged(true)));
        assert!(events.contains(&ControllerEvent::BusyChanged(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_calls_time_out() {
        let mut harness = Harness::new();
        let ada = harness.sign_in("ada@example.com").await;
        harness.store.seed_and_publish(ada, "Rave party", 1);
        assert!(harness.pump().await);
        harness.store.stall.store(true, Ordering::SeqCst);

        let error = harness.controller.load_history().await.unwrap_err();
        assert!(matches!(
            error,
            SyncError::StoreTimeout {
                timeout_ms: 2000,
                ..
            }
        ));
        assert_eq!(harness.contents(), vec!["Rave party"]);

        let outcome = harness.controller.submit("Tokyo in winter").await;
        assert_eq!(outcome, SubmitOutcome::PersistFailed);
        assert!(harness.engine.requests.lock().unwrap().is_empty());
        assert!(!harness.controller.is_busy());
        assert_eq!(harness.controller.pending_input(), "Tokyo in winter");
    }

    #[tokio::test]
    async fn plan_requested_by_previous_user_is_not_written_for_the_next() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;
        let outcome = harness.controller.submit("Eminem Not Afraid outfit").await;
        assert!(matches!(outcome, SubmitOutcome::Forwarded { .. }));
        assert!(harness.controller.is_busy());

        harness.sign_in("grace@example.com").await;

        assert!(!harness.controller.is_busy());
        assert_eq!(harness.controller.await_plan().await, None);

        // A late reply for ada's request must not land in grace's log.
        harness
            .controller
            .on_plan_result(PlanResult::event("Eminem Not Afraid outfit"))
            .await;
        tokio::task::yield_now().await;
        assert_eq!(harness.store.writes(), 1);
        assert_eq!(harness.controller.message_count(), 0);

        let outcome = harness.controller.submit("Tokyo in winter").await;
        assert!(matches!(outcome, SubmitOutcome::Forwarded { .. }));
        assert!(harness.pump().await);
        assert_eq!(harness.contents(), vec!["Tokyo in winter"]);
    }

    #[tokio::test]
    async fn submit_refuses_when_the_session_changed_hands() {
        let mut harness = Harness::new();
        harness.sign_in("ada@example.com").await;
        // The provider moves on before the controller hears about it.
        harness.sessions.sign_in("grace@example.com").unwrap();

        let outcome = harness.controller.submit("Rave party").await;

        assert_eq!(outcome, SubmitOutcome::IdentityChanged);
        assert_eq!(harness.store.writes(), 0);
        assert!(harness.engine.requests.lock().unwrap().is_empty());
        assert_eq!(harness.controller.pending_input(), "Rave party");
    }

    #[tokio::test]
    async fn run_loop_follows_identity_and_commands() {
        let store = Arc::new(FakeStore::default());
        let engine = Arc::new(FakeEngine::default());
        let sessions = Arc::new(LocalSessionProvider::in_memory());
        let (controller, mut events) = ConversationSyncController::new(
            store.clone(),
            sessions.clone(),
            engine.clone(),
            SyncConfig::default(),
        );
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let running = tokio::spawn(controller.run(commands_rx));

        sessions.sign_in("ada@example.com").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if matches!(event, ControllerEvent::IdentityChanged(ref identity) if identity.is_authenticated())
                {
                    break;
                }
            }
        })
        .await
        .unwrap();

        commands_tx
            .send(ControllerCommand::Submit("Rave party".to_string()))
            .await
            .unwrap();

        // User row, then the assistant reply for the plan the fake engine returns.
        let wanted = "Here are your outfit suggestions for the Rave party. I've curated some perfect looks for the occasion!";
        let rendered = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ControllerEvent::MessagesChanged { messages, .. } = event
                    && messages.iter().any(|message| message.content == wanted)
                {
                    return messages;
                }
            }
            Vec::new()
        })
        .await
        .unwrap();

        let contents = rendered
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["Rave party", wanted]);

        commands_tx.send(ControllerCommand::Shutdown).await.unwrap();
        running.await.unwrap();
    }
}
