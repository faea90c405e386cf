use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::genai::{GenerationError, GenerativeClient};
use crate::models::Trip;

/// Shown when the service answers successfully but with an empty body.
pub const EMPTY_ITINERARY_FALLBACK: &str = "Could not generate an itinerary.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Generating,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
}

impl ConversationTurn {
    fn user(text: impl Into<String>) -> Self {
        Self { role: TurnRole::User, text: text.into() }
    }

    fn model(text: impl Into<String>) -> Self {
        Self { role: TurnRole::Model, text: text.into() }
    }
}

/// Whole session state, replaced atomically on every transition so
/// observers never see a torn update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub active_trip: Option<Trip>,
    pub history: Vec<ConversationTurn>,
    pub display_text: String,
    pub pending_user_message: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            active_trip: None,
            history: Vec::new(),
            display_text: String::new(),
            pending_user_message: String::new(),
        }
    }
}

/// Conversational controller for generating and refining one itinerary at
/// a time. Guards enforce a single in-flight request; a generation epoch
/// captured at call-issue time makes a response that lost the race (trip
/// switched, session reset) get discarded instead of applied.
/// Overlapping issues resolve last-writer-wins by issue order.
pub struct ItinerarySession {
    state: watch::Sender<SessionState>,
    client: Arc<dyn GenerativeClient>,
    epoch: AtomicU64,
}

impl ItinerarySession {
    pub fn new(client: Arc<dyn GenerativeClient>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self { state, client, epoch: AtomicU64::new(0) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Bump the epoch and apply `update` in one step under the state
    /// channel's lock. The sender serializes closures, so epoch order
    /// always matches state-write order; allocating the epoch outside
    /// would let a later issue write state first and strand the session.
    fn issue(&self, update: impl FnOnce(&mut SessionState)) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|s| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            update(s);
        });
        epoch
    }

    /// Reset the conversation and generate a fresh itinerary for `trip`.
    /// A re-entrant call for the trip already generating is a no-op; a
    /// call for a different trip always resets and proceeds.
    pub async fn start_for_trip(&self, trip: Trip) {
        let prompt = build_prompt(&trip);
        let trip_id = trip.id;
        let mut issued = None;
        self.state.send_if_modified(|s| {
            if s.status == SessionStatus::Generating
                && s.active_trip.as_ref().map(|t| t.id) == Some(trip_id)
            {
                return false;
            }
            issued = Some(self.epoch.fetch_add(1, Ordering::SeqCst) + 1);
            *s = SessionState {
                status: SessionStatus::Generating,
                display_text: format!("Generating itinerary for {}...", trip.destination),
                active_trip: Some(trip),
                history: Vec::new(),
                pending_user_message: String::new(),
            };
            true
        });
        let Some(epoch) = issued else {
            tracing::debug!(trip_id, "generation already in flight, ignoring");
            return;
        };

        let outcome = self.client.generate(&prompt).await;
        self.apply_outcome(epoch, trip_id, prompt, outcome);
    }

    /// Re-issue the last attempted turn: the initial prompt when nothing
    /// has succeeded yet, otherwise the most recent user turn with the
    /// conversation up to that point as context.
    pub async fn retry(&self) {
        let snapshot = self.state.borrow().clone();
        let Some(trip) = snapshot.active_trip else {
            tracing::debug!("retry without an active trip, ignoring");
            return;
        };
        if snapshot.status == SessionStatus::Generating {
            return;
        }

        if snapshot.history.is_empty() {
            let prompt = build_prompt(&trip);
            let epoch = self.issue(|s| {
                s.status = SessionStatus::Generating;
                s.display_text = format!("Generating itinerary for {}...", trip.destination);
            });
            let outcome = self.client.generate(&prompt).await;
            self.apply_outcome(epoch, trip.id, prompt, outcome);
            return;
        }

        let Some(last_user_idx) = snapshot.history.iter().rposition(|t| t.role == TurnRole::User)
        else {
            return;
        };
        let message = snapshot.history[last_user_idx].text.clone();
        let context = &snapshot.history[..last_user_idx];

        let epoch = self.issue(|s| {
            s.status = SessionStatus::Generating;
            s.display_text = format!("Refining itinerary for {}...", trip.destination);
        });
        let outcome = self.client.chat(context, &message).await;
        self.apply_outcome(epoch, trip.id, message, outcome);
    }

    /// Pure state update for the draft refinement text.
    pub fn update_draft_message(&self, text: impl Into<String>) {
        let text = text.into();
        self.state.send_modify(|s| s.pending_user_message = text);
    }

    /// Send the draft as a refinement turn. No-op when there is no active
    /// trip, the draft is blank, or a request is already in flight. The
    /// draft is cleared on send and not restored on failure.
    pub async fn send_draft_message(&self) {
        let snapshot = self.state.borrow().clone();
        let Some(trip) = snapshot.active_trip else {
            return;
        };
        let message = snapshot.pending_user_message.trim().to_string();
        if message.is_empty() || snapshot.status == SessionStatus::Generating {
            return;
        }

        let epoch = self.issue(|s| {
            s.status = SessionStatus::Generating;
            s.display_text = format!("Refining itinerary for {}...", trip.destination);
            s.pending_user_message.clear();
        });
        let outcome = self.client.chat(&snapshot.history, &message).await;
        self.apply_outcome(epoch, trip.id, message, outcome);
    }

    /// Return to the initial empty state, invalidating any in-flight call.
    pub fn reset(&self) {
        self.issue(|s| *s = SessionState::default());
    }

    fn apply_outcome(
        &self,
        epoch: u64,
        trip_id: i64,
        user_text: String,
        outcome: Result<String, GenerationError>,
    ) {
        let applied = self.state.send_if_modified(|s| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            if s.active_trip.as_ref().map(|t| t.id) != Some(trip_id) {
                return false;
            }
            match outcome {
                Ok(text) => {
                    let display = if text.trim().is_empty() {
                        EMPTY_ITINERARY_FALLBACK.to_string()
                    } else {
                        text
                    };
                    s.history.push(ConversationTurn::user(user_text));
                    s.history.push(ConversationTurn::model(display.clone()));
                    s.status = SessionStatus::Ready;
                    s.display_text = display;
                    metrics::counter!("itinerary_generations_total", "outcome" => "success").increment(1);
                }
                Err(err) => {
                    s.status = SessionStatus::Failed;
                    s.display_text =
                        format!("Failed to generate itinerary: {err}. Check your connection or API key.");
                    metrics::counter!("itinerary_generations_total", "outcome" => "failure").increment(1);
                }
            }
            true
        });
        if !applied {
            tracing::debug!(trip_id, epoch, "discarding stale generation response");
            metrics::counter!("itinerary_stale_responses_total").increment(1);
        }
    }
}

fn build_prompt(trip: &Trip) -> String {
    let start = trip.start_date.format("%d/%m/%Y");
    let end = trip.end_date.format("%d/%m/%Y");
    let budget = format_budget(trip.budget);
    format!(
        "Create a detailed travel itinerary for {destination}, \
focused on a {category} trip. \
The trip runs from {start} to {end}. \
The total budget available for the trip is {budget}. \
The itinerary must include daily activity suggestions (morning, afternoon, evening), \
meal options (breakfast, lunch, dinner) and practical tips for the destination. \
Split the itinerary by day, with a clear title for each day and subtitles \
for the sections (Activities, Meals, Tips). \
Be creative and practical, keeping the stated budget in mind. \
Do not include any greeting, introduction or farewell. Output only the formatted itinerary.",
        destination = trip.destination,
        category = trip.category.label(),
    )
}

fn format_budget(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let whole = cents / 100;
    let frac = (cents % 100).abs();
    let mut digits = whole.abs().to_string();
    let mut grouped = String::new();
    while digits.len() > 3 {
        let rest = digits.split_off(digits.len() - 3);
        grouped = if grouped.is_empty() { rest } else { format!("{rest},{grouped}") };
    }
    grouped = if grouped.is_empty() { digits } else { format!("{digits},{grouped}") };
    let sign = if whole < 0 { "-" } else { "" };
    format!("{sign}${grouped}.{frac:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::mock::MockGenerativeClient;
    use crate::models::TripCategory;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    fn lisbon() -> Trip {
        Trip {
            id: 1,
            destination: "Lisbon".into(),
            category: TripCategory::Leisure,
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 5, 5).unwrap(),
            budget: 1500.0,
        }
    }

    fn porto() -> Trip {
        Trip {
            id: 2,
            destination: "Porto".into(),
            category: TripCategory::Business,
            start_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            budget: 800.0,
        }
    }

    /// Client that parks every call on a semaphore until the test releases
    /// it, so a request can be held in flight deliberately.
    struct GatedClient {
        replies: Mutex<VecDeque<String>>,
        gate: Semaphore,
        calls: AtomicUsize,
    }

    impl GatedClient {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn answer(&self) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            Ok(self.replies.lock().unwrap().pop_front().expect("reply scripted"))
        }
    }

    #[async_trait]
    impl GenerativeClient for GatedClient {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            self.answer().await
        }

        async fn chat(
            &self,
            _history: &[ConversationTurn],
            _message: &str,
        ) -> Result<String, GenerationError> {
            self.answer().await
        }
    }

    #[tokio::test]
    async fn idle_session_has_no_trip_and_no_history() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![]));
        let session = ItinerarySession::new(client);
        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Idle);
        assert!(state.active_trip.is_none());
        assert!(state.history.is_empty());
        assert!(state.display_text.is_empty());
    }

    #[tokio::test]
    async fn successful_generation_reaches_ready_with_two_turns() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![Ok("Day 1: ...".into())]));
        let session = ItinerarySession::new(client.clone());

        session.start_for_trip(lisbon()).await;

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, "Day 1: ...");
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].role, TurnRole::User);
        assert_eq!(state.history[1].role, TurnRole::Model);
        assert_eq!(state.active_trip.unwrap().id, 1);
        assert_eq!(client.calls(), 1);

        let prompt = client.last_request().unwrap().message;
        assert!(prompt.contains("Lisbon"));
        assert!(prompt.contains("Leisure"));
        assert!(prompt.contains("01/05/2024"));
        assert!(prompt.contains("05/05/2024"));
        assert!(prompt.contains("$1,500.00"));
    }

    #[tokio::test]
    async fn failure_keeps_history_and_retry_recovers() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![
            Err(GenerationError::Network("connection refused".into())),
            Ok("Day 1: ...".into()),
        ]));
        let session = ItinerarySession::new(client.clone());

        session.start_for_trip(lisbon()).await;
        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Failed);
        assert!(state.display_text.contains("connection refused"));
        assert!(state.history.is_empty(), "failed turn must not be recorded");

        session.retry().await;
        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, "Day 1: ...");
        assert_eq!(state.history.len(), 2);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn retry_without_active_trip_is_a_noop() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![Ok("never".into())]));
        let session = ItinerarySession::new(client.clone());
        session.retry().await;
        assert_eq!(session.snapshot().status, SessionStatus::Idle);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn retry_with_history_repeats_last_user_turn() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![
            Ok("Day 1: ...".into()),
            Ok("Day 1 revisited".into()),
        ]));
        let session = ItinerarySession::new(client.clone());

        session.start_for_trip(lisbon()).await;
        session.retry().await;

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, "Day 1 revisited");
        assert_eq!(state.history.len(), 4);

        let recorded = client.last_request().unwrap();
        // the repeated turn is sent with the history *before* it as context
        assert_eq!(recorded.history_len, 0);
        assert!(recorded.message.contains("Lisbon"));
    }

    #[tokio::test]
    async fn refinement_appends_turns_and_clears_draft() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![
            Ok("Day 1: ...".into()),
            Ok("Day 1 with a museum".into()),
        ]));
        let session = ItinerarySession::new(client.clone());

        session.start_for_trip(lisbon()).await;
        session.update_draft_message("add a museum day");
        assert_eq!(session.snapshot().pending_user_message, "add a museum day");

        session.send_draft_message().await;

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, "Day 1 with a museum");
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.history[2].text, "add a museum day");
        assert!(state.pending_user_message.is_empty());

        let recorded = client.last_request().unwrap();
        assert_eq!(recorded.history_len, 2);
        assert_eq!(recorded.message, "add a museum day");
    }

    #[tokio::test]
    async fn failed_refinement_loses_draft_and_keeps_history() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![
            Ok("Day 1: ...".into()),
            Err(GenerationError::Quota("rate limited".into())),
        ]));
        let session = ItinerarySession::new(client);

        session.start_for_trip(lisbon()).await;
        session.update_draft_message("add a museum day");
        session.send_draft_message().await;

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Failed);
        assert!(state.display_text.contains("rate limited"));
        assert_eq!(state.history.len(), 2, "failed turn must not be recorded");
        assert!(state.pending_user_message.is_empty(), "draft is not restored");
    }

    #[tokio::test]
    async fn blank_draft_is_not_sent() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![Ok("Day 1: ...".into())]));
        let session = ItinerarySession::new(client.clone());
        session.start_for_trip(lisbon()).await;

        session.update_draft_message("   ");
        session.send_draft_message().await;

        assert_eq!(client.calls(), 1);
        assert_eq!(session.snapshot().status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn empty_response_becomes_ready_with_fallback_text() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![Ok("  ".into())]));
        let session = ItinerarySession::new(client);

        session.start_for_trip(lisbon()).await;

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, EMPTY_ITINERARY_FALLBACK);
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn second_request_while_generating_is_not_issued() {
        let client = Arc::new(GatedClient::new(vec!["Day 1: ..."]));
        let session = Arc::new(ItinerarySession::new(client.clone()));

        let bg = {
            let session = session.clone();
            tokio::spawn(async move { session.start_for_trip(lisbon()).await })
        };
        let mut rx = session.subscribe();
        rx.wait_for(|s| s.status == SessionStatus::Generating).await.unwrap();
        while client.calls() < 1 {
            tokio::task::yield_now().await;
        }

        // all of these must be no-ops while the call is in flight
        session.start_for_trip(lisbon()).await;
        session.retry().await;
        session.update_draft_message("hurry up");
        session.send_draft_message().await;
        assert_eq!(client.calls(), 1);

        client.gate.add_permits(1);
        bg.await.unwrap();

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, "Day 1: ...");
        // the draft typed during generation survives untouched
        assert_eq!(state.pending_user_message, "hurry up");
    }

    #[tokio::test]
    async fn stale_response_for_replaced_trip_is_discarded() {
        let client = Arc::new(GatedClient::new(vec!["PLAN LISBON", "PLAN PORTO"]));
        let session = Arc::new(ItinerarySession::new(client.clone()));

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.start_for_trip(lisbon()).await })
        };
        let mut rx = session.subscribe();
        rx.wait_for(|s| s.status == SessionStatus::Generating).await.unwrap();

        // switching trips while Lisbon is outstanding resets and proceeds
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.start_for_trip(porto()).await })
        };
        rx.wait_for(|s| s.active_trip.as_ref().map(|t| t.id) == Some(2)).await.unwrap();
        while client.calls() < 2 {
            tokio::task::yield_now().await;
        }

        client.gate.add_permits(2);
        first.await.unwrap();
        second.await.unwrap();

        let state = session.snapshot();
        assert_eq!(state.active_trip.as_ref().unwrap().id, 2);
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.display_text, "PLAN PORTO");
        assert_eq!(state.history.len(), 2, "only the Porto exchange is recorded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_start_storm_never_strands_the_session() {
        // every call that is issued must settle against the state it
        // wrote; the losers are discarded and the last issue ends Ready
        let replies = (0..32).map(|_| Ok("Day 1: ...".to_string())).collect();
        let client = Arc::new(MockGenerativeClient::scripted(replies));
        let session = Arc::new(ItinerarySession::new(client));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let session = session.clone();
            let trip = if i % 2 == 0 { lisbon() } else { porto() };
            tasks.push(tokio::spawn(async move { session.start_for_trip(trip).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = session.snapshot();
        assert_ne!(state.status, SessionStatus::Generating, "no request left in flight");
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.history.len(), 2, "exactly one exchange applied");
        assert!(state.active_trip.is_some());
    }

    #[tokio::test]
    async fn reset_discards_in_flight_response() {
        let client = Arc::new(GatedClient::new(vec!["Day 1: ..."]));
        let session = Arc::new(ItinerarySession::new(client.clone()));

        let bg = {
            let session = session.clone();
            tokio::spawn(async move { session.start_for_trip(lisbon()).await })
        };
        let mut rx = session.subscribe();
        rx.wait_for(|s| s.status == SessionStatus::Generating).await.unwrap();

        session.reset();
        client.gate.add_permits(1);
        bg.await.unwrap();

        let state = session.snapshot();
        assert_eq!(state.status, SessionStatus::Idle);
        assert!(state.active_trip.is_none());
        assert!(state.history.is_empty());
        assert!(state.display_text.is_empty());
    }

    #[tokio::test]
    async fn reset_returns_to_initial_state() {
        let client = Arc::new(MockGenerativeClient::scripted(vec![Ok("Day 1: ...".into())]));
        let session = ItinerarySession::new(client);
        session.start_for_trip(lisbon()).await;
        session.update_draft_message("more food");
        session.reset();
        assert_eq!(session.snapshot(), SessionState::default());
    }

    #[test]
    fn budget_formatting_groups_thousands() {
        assert_eq!(format_budget(1500.0), "$1,500.00");
        assert_eq!(format_budget(999.9), "$999.90");
        assert_eq!(format_budget(0.0), "$0.00");
        assert_eq!(format_budget(1234567.89), "$1,234,567.89");
    }
}
