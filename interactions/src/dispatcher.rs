//! The per-entity interaction state machine. An action applies its optimistic
//! transition to display state and the override store synchronously, then
//! confirms it against the backend; failure rolls both back together to the
//! pre-action snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::client::{ApiClient, ApiError, VoteResponse};
use crate::entity::{Comment, EntityRef, Post};
use crate::reconciler::{apply_save_toggle, apply_vote, VoteAction, VoteValue};
use crate::store::OverrideStore;

#[derive(Error, Debug)]
pub enum InteractionError {
    /// Rejected before any state mutation; the view should prompt for login.
    #[error("sign in to vote or save")]
    AuthRequired,
    /// A previous action on this entity has not settled yet.
    #[error("previous action still in flight")]
    ActionInFlight,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// What the view should render for one entity right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayState {
    pub score: i64,
    pub vote: VoteValue,
    pub saved: bool,
}

/// One entity-view instance's interaction state.
///
/// Constructed from a server payload with any stored override masking the
/// server-reported vote and save fields. All mutating methods reject
/// unauthenticated viewers and serialize per-instance: a second action while
/// one is pending fails with [`InteractionError::ActionInFlight`] instead of
/// racing the first one's rollback.
pub struct EntityInteractions {
    api: Arc<dyn ApiClient>,
    overrides: OverrideStore,
    entity: EntityRef,
    viewer_id: Option<i64>,
    display: Mutex<DisplayState>,
    pending: AtomicBool,
    attached: AtomicBool,
}

impl EntityInteractions {
    pub fn for_post(
        api: Arc<dyn ApiClient>,
        overrides: OverrideStore,
        viewer_id: Option<i64>,
        post: &Post,
    ) -> EntityInteractions {
        Self::seeded(
            api,
            overrides,
            viewer_id,
            post.entity_ref(),
            post.score,
            post.vote_seed(),
            post.saved_seed(),
        )
    }

    pub fn for_comment(
        api: Arc<dyn ApiClient>,
        overrides: OverrideStore,
        viewer_id: Option<i64>,
        comment: &Comment,
    ) -> EntityInteractions {
        Self::seeded(
            api,
            overrides,
            viewer_id,
            comment.entity_ref(),
            comment.score,
            comment.vote_seed(),
            comment.saved_seed(),
        )
    }

    /// Seed display state from server-reported fields, letting any stored
    /// override mask them. The displayed score absorbs the delta between the
    /// server-seeded vote and the override.
    pub fn seeded(
        api: Arc<dyn ApiClient>,
        overrides: OverrideStore,
        viewer_id: Option<i64>,
        entity: EntityRef,
        score: i64,
        vote_seed: VoteValue,
        saved_seed: bool,
    ) -> EntityInteractions {
        let display = match viewer_id {
            Some(viewer) => {
                let override_vote = overrides.vote(entity, viewer);
                let vote = if override_vote == VoteValue::None {
                    vote_seed
                } else {
                    override_vote
                };
                DisplayState {
                    score: score + vote.as_int() - vote_seed.as_int(),
                    vote,
                    saved: overrides.saved(entity, viewer) || saved_seed,
                }
            }
            None => DisplayState {
                score,
                vote: vote_seed,
                saved: saved_seed,
            },
        };

        EntityInteractions {
            api,
            overrides,
            entity,
            viewer_id,
            display: Mutex::new(display),
            pending: AtomicBool::new(false),
            attached: AtomicBool::new(true),
        }
    }

    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn snapshot(&self) -> DisplayState {
        *self.display.lock().expect("display lock poisoned")
    }

    pub fn displayed_score(&self) -> i64 {
        self.snapshot().score
    }

    pub fn displayed_vote(&self) -> VoteValue {
        self.snapshot().vote
    }

    pub fn displayed_saved(&self) -> bool {
        self.snapshot().saved
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// The view this instance backs is gone. In-flight actions keep running
    /// and still settle or roll back the override store, but they stop
    /// writing display state.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub async fn upvote(&self) -> Result<DisplayState, InteractionError> {
        self.cast(VoteAction::Upvote).await
    }

    pub async fn downvote(&self) -> Result<DisplayState, InteractionError> {
        self.cast(VoteAction::Downvote).await
    }

    #[instrument(skip_all, fields(entity = %self.entity))]
    async fn cast(&self, action: VoteAction) -> Result<DisplayState, InteractionError> {
        let viewer = self.viewer_id.ok_or(InteractionError::AuthRequired)?;
        self.begin()?;

        let before = self.snapshot();
        let outcome = apply_vote(before.vote, action);
        // Optimistic transition lands in display state and the override
        // store before the request is issued, so the UI never lags input and
        // a reload mid-flight keeps the optimistic value.
        self.apply_display(|d| {
            d.vote = outcome.value;
            d.score += outcome.score_delta;
        });
        self.overrides.set_vote(self.entity, viewer, outcome.value);

        let result = self.api.cast_vote(self.entity, action).await;
        self.pending.store(false, Ordering::SeqCst);

        match result {
            Ok(response) => Ok(self.settle_vote(viewer, outcome.value, response)),
            Err(error) => {
                warn!(entity = %self.entity, "vote failed, rolling back: {error}");
                self.apply_display(move |d| *d = before);
                self.overrides.set_vote(self.entity, viewer, before.vote);

                Err(error.into())
            }
        }
    }

    #[instrument(skip_all, fields(entity = %self.entity))]
    pub async fn toggle_save(&self) -> Result<DisplayState, InteractionError> {
        let viewer = self.viewer_id.ok_or(InteractionError::AuthRequired)?;
        self.begin()?;

        let before = self.snapshot();
        let saved = apply_save_toggle(before.saved);
        self.apply_display(|d| d.saved = saved);
        self.overrides.set_saved(self.entity, viewer, saved);

        let result = self.api.set_saved(self.entity, saved).await;
        self.pending.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => Ok(self.snapshot()),
            Err(error) => {
                warn!(entity = %self.entity, "save toggle failed, rolling back: {error}");
                self.apply_display(move |d| *d = before);
                self.overrides.set_saved(self.entity, viewer, before.saved);

                Err(error.into())
            }
        }
    }

    fn begin(&self) -> Result<(), InteractionError> {
        if self.pending.swap(true, Ordering::SeqCst) {
            return Err(InteractionError::ActionInFlight);
        }
        Ok(())
    }

    /// Write display state unless the view has detached.
    fn apply_display(&self, f: impl FnOnce(&mut DisplayState)) {
        if self.attached.load(Ordering::SeqCst) {
            f(&mut *self.display.lock().expect("display lock poisoned"));
        }
    }

    /// The server response is authoritative: adopt its score, and when it
    /// echoes a vote value, adopt that and drop the override so server data
    /// stands alone from here on.
    fn settle_vote(
        &self,
        viewer: i64,
        optimistic: VoteValue,
        response: VoteResponse,
    ) -> DisplayState {
        if let Some(score) = response.score {
            self.apply_display(|d| d.score = score);
        }
        if let Some(raw) = response.vote {
            let confirmed = VoteValue::from_int(raw);
            if confirmed != optimistic {
                debug!(
                    entity = %self.entity,
                    "server recorded {confirmed:?} where client expected {optimistic:?}"
                );
                self.apply_display(|d| {
                    if response.score.is_none() {
                        d.score += confirmed.as_int() - d.vote.as_int();
                    }
                    d.vote = confirmed;
                });
            }
            self.overrides.set_vote(self.entity, viewer, VoteValue::None);
        }

        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockApiClient;
    use crate::store::MemoryStorage;
    use crate::test_utils::post_payload;

    fn fixture(mock: MockApiClient, viewer: Option<i64>, post: &Post) -> EntityInteractions {
        let overrides = OverrideStore::new(Arc::new(MemoryStorage::new()));
        EntityInteractions::for_post(Arc::new(mock), overrides, viewer, post)
    }

    fn fixture_with_store(
        mock: MockApiClient,
        overrides: OverrideStore,
        viewer: Option<i64>,
        post: &Post,
    ) -> EntityInteractions {
        EntityInteractions::for_post(Arc::new(mock), overrides, viewer, post)
    }

    #[tokio::test]
    async fn test_fresh_upvote_success() {
        let mock = MockApiClient::new().vote_response(VoteResponse {
            score: Some(11),
            vote: Some(1),
        });
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture(mock.clone(), Some(1), &post);

        let settled = interactions.upvote().await.expect("vote confirmed");

        assert_eq!(settled.score, 11);
        assert_eq!(settled.vote, VoteValue::Up);
        assert_eq!(
            mock.vote_calls(),
            vec![(EntityRef::post(7), VoteAction::Upvote)]
        );
    }

    #[tokio::test]
    async fn test_upvote_failure_rolls_back_display_and_store() {
        let mock = MockApiClient::new().fail_votes();
        let backend = Arc::new(MemoryStorage::new());
        let overrides = OverrideStore::new(backend.clone());
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture_with_store(mock, overrides.clone(), Some(1), &post);

        let result = interactions.upvote().await;

        assert!(matches!(result, Err(InteractionError::Api(_))));
        let state = interactions.snapshot();
        assert_eq!(state.score, 10);
        assert_eq!(state.vote, VoteValue::None);
        // The rolled-back store entry is gone, not set to zero.
        assert_eq!(overrides.vote(EntityRef::post(7), 1), VoteValue::None);
    }

    #[tokio::test]
    async fn test_switch_vote_moves_score_by_two() {
        let mock = MockApiClient::new();
        let post = post_payload(7, 5, -1, false);
        let interactions = fixture(mock, Some(1), &post);

        interactions.upvote().await.expect("vote accepted");

        let state = interactions.snapshot();
        assert_eq!(state.score, 7);
        assert_eq!(state.vote, VoteValue::Up);
    }

    #[tokio::test]
    async fn test_unauthenticated_action_is_rejected_before_mutation() {
        let mock = MockApiClient::new();
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture(mock.clone(), None, &post);

        let result = interactions.upvote().await;

        assert!(matches!(result, Err(InteractionError::AuthRequired)));
        assert_eq!(interactions.displayed_score(), 10);
        assert!(mock.vote_calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_action_rejected_while_pending() {
        let (mock, gate) = MockApiClient::new().gated();
        let post = post_payload(7, 10, 0, false);
        let interactions = Arc::new(fixture(mock, Some(1), &post));

        let in_flight = {
            let interactions = interactions.clone();
            tokio::spawn(async move { interactions.upvote().await })
        };
        // Let the first action reach the gate.
        tokio::task::yield_now().await;
        while !interactions.is_pending() {
            tokio::task::yield_now().await;
        }

        let second = interactions.downvote().await;
        assert!(matches!(second, Err(InteractionError::ActionInFlight)));

        gate.add_permits(1);
        let first = in_flight.await.expect("task finished");
        assert!(first.is_ok());
        assert_eq!(interactions.displayed_vote(), VoteValue::Up);
    }

    #[tokio::test]
    async fn test_optimistic_state_visible_while_pending() {
        let (mock, gate) = MockApiClient::new().gated();
        let post = post_payload(7, 10, 0, false);
        let interactions = Arc::new(fixture(mock, Some(1), &post));

        let in_flight = {
            let interactions = interactions.clone();
            tokio::spawn(async move { interactions.upvote().await })
        };
        while !interactions.is_pending() {
            tokio::task::yield_now().await;
        }

        // Display reflects the action before the backend has answered.
        let state = interactions.snapshot();
        assert_eq!(state.score, 11);
        assert_eq!(state.vote, VoteValue::Up);

        gate.add_permits(1);
        in_flight
            .await
            .expect("task finished")
            .expect("vote confirmed");
    }

    #[tokio::test]
    async fn test_detach_suppresses_display_writes_but_not_store_rollback() {
        let (mock, gate) = MockApiClient::new().gated();
        let mock = mock.fail_votes();
        let backend = Arc::new(MemoryStorage::new());
        let overrides = OverrideStore::new(backend);
        let post = post_payload(7, 10, 0, false);
        let interactions = Arc::new(fixture_with_store(
            mock,
            overrides.clone(),
            Some(1),
            &post,
        ));

        let in_flight = {
            let interactions = interactions.clone();
            tokio::spawn(async move { interactions.upvote().await })
        };
        while !interactions.is_pending() {
            tokio::task::yield_now().await;
        }

        interactions.detach();
        gate.add_permits(1);
        let result = in_flight.await.expect("task finished");
        assert!(result.is_err());

        // Display keeps its last rendered value; durable state reverted.
        assert_eq!(interactions.displayed_vote(), VoteValue::Up);
        assert_eq!(overrides.vote(EntityRef::post(7), 1), VoteValue::None);
    }

    #[tokio::test]
    async fn test_seed_applies_stored_override() {
        let backend = Arc::new(MemoryStorage::new());
        let overrides = OverrideStore::new(backend);
        overrides.set_vote(EntityRef::post(7), 1, VoteValue::Up);

        // Server has not caught up: it still reports no vote.
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture_with_store(MockApiClient::new(), overrides, Some(1), &post);

        let state = interactions.snapshot();
        assert_eq!(state.score, 11);
        assert_eq!(state.vote, VoteValue::Up);
    }

    #[tokio::test]
    async fn test_seed_ignores_other_viewers_override() {
        let backend = Arc::new(MemoryStorage::new());
        let overrides = OverrideStore::new(backend);
        overrides.set_vote(EntityRef::post(7), 2, VoteValue::Up);

        let post = post_payload(7, 10, 0, false);
        let interactions = fixture_with_store(MockApiClient::new(), overrides, Some(1), &post);

        assert_eq!(interactions.displayed_score(), 10);
        assert_eq!(interactions.displayed_vote(), VoteValue::None);
    }

    #[tokio::test]
    async fn test_settle_clears_override_when_server_echoes_vote() {
        let mock = MockApiClient::new().vote_response(VoteResponse {
            score: Some(11),
            vote: Some(1),
        });
        let backend = Arc::new(MemoryStorage::new());
        let overrides = OverrideStore::new(backend);
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture_with_store(mock, overrides.clone(), Some(1), &post);

        interactions.upvote().await.expect("vote confirmed");

        // Server data is authoritative now; no override remains to mask it.
        assert_eq!(overrides.vote(EntityRef::post(7), 1), VoteValue::None);
        assert_eq!(interactions.displayed_score(), 11);
    }

    #[tokio::test]
    async fn test_settle_keeps_override_without_server_echo() {
        let mock = MockApiClient::new().vote_response(VoteResponse {
            score: Some(11),
            vote: None,
        });
        let overrides = OverrideStore::new(Arc::new(MemoryStorage::new()));
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture_with_store(mock, overrides.clone(), Some(1), &post);

        interactions.upvote().await.expect("vote confirmed");

        assert_eq!(overrides.vote(EntityRef::post(7), 1), VoteValue::Up);
    }

    #[tokio::test]
    async fn test_settle_adopts_diverging_server_vote() {
        // Backend resolved the action differently than the client computed.
        let mock = MockApiClient::new().vote_response(VoteResponse {
            score: Some(10),
            vote: Some(0),
        });
        let post = post_payload(7, 10, 0, false);
        let interactions = fixture(mock, Some(1), &post);

        let settled = interactions.upvote().await.expect("vote confirmed");

        assert_eq!(settled.vote, VoteValue::None);
        assert_eq!(settled.score, 10);
    }

    #[tokio::test]
    async fn test_save_toggle_success_and_rollback() {
        let mock = MockApiClient::new();
        let backend = Arc::new(MemoryStorage::new());
        let overrides = OverrideStore::new(backend);
        let post = post_payload(7, 10, 0, false);
        let interactions =
            fixture_with_store(mock.clone(), overrides.clone(), Some(1), &post);

        let state = interactions.toggle_save().await.expect("save confirmed");
        assert!(state.saved);
        assert!(overrides.saved(EntityRef::post(7), 1));
        assert_eq!(mock.save_calls(), vec![(EntityRef::post(7), true)]);

        // Second toggle fails: both display and store must revert to saved.
        let mock = mock.fail_saves();
        let result = interactions.toggle_save().await;
        assert!(result.is_err());
        assert!(interactions.displayed_saved());
        assert!(overrides.saved(EntityRef::post(7), 1));
        assert_eq!(mock.save_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_comment_seeding() {
        let comment = crate::test_utils::comment_payload(31, 7, 3, 1, true);
        let interactions = EntityInteractions::for_comment(
            Arc::new(MockApiClient::new()),
            OverrideStore::new(Arc::new(MemoryStorage::new())),
            Some(1),
            &comment,
        );

        let state = interactions.snapshot();
        assert_eq!(state.score, 3);
        assert_eq!(state.vote, VoteValue::Up);
        assert!(state.saved);
        assert_eq!(interactions.entity(), EntityRef::comment(31));
    }
}
