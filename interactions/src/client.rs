//! The REST backend collaborator. The core only ever talks to the
//! [`ApiClient`] trait; the reqwest implementation and the scriptable test
//! mock live side by side here.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::Config;
use crate::entity::{Comment, EntityRef, Post, UserSummary};
use crate::reconciler::VoteAction;

pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid api base url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("api request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("failed to decode api response: {0}")]
    ResponseDecodingError(#[from] serde_json::Error),
    #[error("request rejected: missing or invalid credentials")]
    Unauthorized,
    #[error("api returned {0}")]
    ErrorStatus(StatusCode),
}

/// A vote endpoint response: the authoritative score and, when the backend
/// reports it, the vote value it now has on record for the viewer.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct VoteResponse {
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default, alias = "new_vote_value", alias = "current_user_vote")]
    pub vote: Option<i64>,
}

/// The slice of the backend the core consumes.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Install or clear the credential sent with subsequent requests.
    fn set_api_key(&self, key: Option<String>);

    async fn current_user(&self) -> Result<UserSummary, ApiError>;
    async fn posts(&self, sort: &str) -> Result<Vec<Post>, ApiError>;
    async fn post(&self, id: i64) -> Result<Post, ApiError>;
    async fn comment(&self, id: i64) -> Result<Comment, ApiError>;
    async fn post_comments(&self, post_id: i64, sort: &str) -> Result<Vec<Comment>, ApiError>;
    async fn cast_vote(&self, entity: EntityRef, action: VoteAction)
        -> Result<VoteResponse, ApiError>;
    async fn set_saved(&self, entity: EntityRef, saved: bool) -> Result<(), ApiError>;
}

// The backend wraps single resources Rails-style ({"post": {...}}) on some
// endpoints and returns them bare on others; accept both.

#[derive(Deserialize)]
#[serde(untagged)]
enum UserEnvelope {
    Wrapped { user: UserSummary },
    Bare(UserSummary),
}

impl UserEnvelope {
    fn into_inner(self) -> UserSummary {
        match self {
            UserEnvelope::Wrapped { user } => user,
            UserEnvelope::Bare(user) => user,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PostEnvelope {
    Wrapped { post: Post },
    Bare(Post),
}

impl PostEnvelope {
    fn into_inner(self) -> Post {
        match self {
            PostEnvelope::Wrapped { post } => post,
            PostEnvelope::Bare(post) => post,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PostsEnvelope {
    Wrapped { posts: Vec<Post> },
    Bare(Vec<Post>),
}

impl PostsEnvelope {
    fn into_inner(self) -> Vec<Post> {
        match self {
            PostsEnvelope::Wrapped { posts } => posts,
            PostsEnvelope::Bare(posts) => posts,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommentEnvelope {
    Wrapped { comment: Comment },
    Bare(Comment),
}

impl CommentEnvelope {
    fn into_inner(self) -> Comment {
        match self {
            CommentEnvelope::Wrapped { comment } => comment,
            CommentEnvelope::Bare(comment) => comment,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommentsEnvelope {
    Wrapped { comments: Vec<Comment> },
    Bare(Vec<Comment>),
}

impl CommentsEnvelope {
    fn into_inner(self) -> Vec<Comment> {
        match self {
            CommentsEnvelope::Wrapped { comments } => comments,
            CommentsEnvelope::Bare(comments) => comments,
        }
    }
}

/// reqwest-backed [`ApiClient`] speaking the backend's `/api/v1` surface.
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: RwLock<Option<String>>,
}

impl HttpApiClient {
    pub fn new(config: &Config) -> Result<HttpApiClient, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("interactions-client")
            .timeout(config.request_timeout.0)
            .build()?;
        let base_url = Url::parse(&config.api_base_url)?;

        Ok(HttpApiClient {
            client,
            base_url,
            api_key: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let key = self.api_key.read().expect("api key lock poisoned").clone();
        let request = match key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ApiError::Unauthorized)
        } else {
            Err(ApiError::ErrorStatus(status))
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let raw = response.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    fn set_api_key(&self, key: Option<String>) {
        *self.api_key.write().expect("api key lock poisoned") = key;
    }

    async fn current_user(&self) -> Result<UserSummary, ApiError> {
        let url = self.endpoint("api/v1/users/me")?;
        let response = self.send(self.client.get(url)).await?;

        Ok(Self::read_json::<UserEnvelope>(response).await?.into_inner())
    }

    async fn posts(&self, sort: &str) -> Result<Vec<Post>, ApiError> {
        let url = self.endpoint("api/v1/posts")?;
        let response = self
            .send(self.client.get(url).query(&[("sort", sort)]))
            .await?;

        Ok(Self::read_json::<PostsEnvelope>(response).await?.into_inner())
    }

    async fn post(&self, id: i64) -> Result<Post, ApiError> {
        let url = self.endpoint(&format!("api/v1/posts/{id}"))?;
        let response = self.send(self.client.get(url)).await?;

        Ok(Self::read_json::<PostEnvelope>(response).await?.into_inner())
    }

    async fn comment(&self, id: i64) -> Result<Comment, ApiError> {
        let url = self.endpoint(&format!("api/v1/comments/{id}"))?;
        let response = self.send(self.client.get(url)).await?;

        Ok(Self::read_json::<CommentEnvelope>(response)
            .await?
            .into_inner())
    }

    async fn post_comments(&self, post_id: i64, sort: &str) -> Result<Vec<Comment>, ApiError> {
        let url = self.endpoint(&format!("api/v1/posts/{post_id}/comments"))?;
        let response = self
            .send(self.client.get(url).query(&[("sort", sort)]))
            .await?;

        Ok(Self::read_json::<CommentsEnvelope>(response)
            .await?
            .into_inner())
    }

    async fn cast_vote(
        &self,
        entity: EntityRef,
        action: VoteAction,
    ) -> Result<VoteResponse, ApiError> {
        let verb = match action {
            VoteAction::Upvote => "upvote",
            VoteAction::Downvote => "downvote",
        };
        let url = self.endpoint(&format!(
            "api/v1/{}/{}/{verb}",
            entity.kind.as_str(),
            entity.id
        ))?;
        let response = self.send(self.client.post(url)).await?;

        // Some backend versions confirm with an empty body.
        let raw = response.bytes().await?;
        if raw.is_empty() {
            return Ok(VoteResponse::default());
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn set_saved(&self, entity: EntityRef, saved: bool) -> Result<(), ApiError> {
        let url = self.endpoint(&format!(
            "api/v1/{}/{}/save",
            entity.kind.as_str(),
            entity.id
        ))?;
        let request = if saved {
            self.client.post(url)
        } else {
            self.client.delete(url)
        };
        self.send(request).await?;

        Ok(())
    }
}

#[derive(Default)]
struct MockApiState {
    user: Option<UserSummary>,
    posts: Vec<Post>,
    comments: Vec<Comment>,
    vote_response: VoteResponse,
    fail_votes: bool,
    fail_saves: bool,
    api_key: Option<String>,
    vote_calls: Vec<(EntityRef, VoteAction)>,
    save_calls: Vec<(EntityRef, bool)>,
}

/// Scriptable [`ApiClient`] stand-in for tests: canned responses, failure
/// switches, recorded calls, and an optional gate holding mutating calls
/// open so tests can observe mid-flight state.
#[derive(Clone, Default)]
pub struct MockApiClient {
    state: Arc<Mutex<MockApiState>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockApiClient {
    pub fn new() -> MockApiClient {
        MockApiClient::default()
    }

    /// Mutating calls block until the returned semaphore hands out a permit.
    pub fn gated(mut self) -> (MockApiClient, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn with_user(self, user: UserSummary) -> MockApiClient {
        self.state.lock().expect("mock state lock poisoned").user = Some(user);
        self
    }

    pub fn with_posts(self, posts: Vec<Post>) -> MockApiClient {
        self.state.lock().expect("mock state lock poisoned").posts = posts;
        self
    }

    pub fn with_comments(self, comments: Vec<Comment>) -> MockApiClient {
        self.state.lock().expect("mock state lock poisoned").comments = comments;
        self
    }

    pub fn vote_response(self, response: VoteResponse) -> MockApiClient {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .vote_response = response;
        self
    }

    pub fn fail_votes(self) -> MockApiClient {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .fail_votes = true;
        self
    }

    pub fn fail_saves(self) -> MockApiClient {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .fail_saves = true;
        self
    }

    pub fn vote_calls(&self) -> Vec<(EntityRef, VoteAction)> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .vote_calls
            .clone()
    }

    pub fn save_calls(&self) -> Vec<(EntityRef, bool)> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .save_calls
            .clone()
    }

    pub fn api_key(&self) -> Option<String> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .api_key
            .clone()
    }

    async fn wait_for_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("mock gate closed")
                .forget();
        }
    }
}

#[async_trait]
impl ApiClient for MockApiClient {
    fn set_api_key(&self, key: Option<String>) {
        self.state.lock().expect("mock state lock poisoned").api_key = key;
    }

    async fn current_user(&self) -> Result<UserSummary, ApiError> {
        let state = self.state.lock().expect("mock state lock poisoned");
        match (&state.api_key, &state.user) {
            (Some(_), Some(user)) => Ok(user.clone()),
            _ => Err(ApiError::Unauthorized),
        }
    }

    async fn posts(&self, _sort: &str) -> Result<Vec<Post>, ApiError> {
        Ok(self
            .state
            .lock()
            .expect("mock state lock poisoned")
            .posts
            .clone())
    }

    async fn post(&self, id: i64) -> Result<Post, ApiError> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .posts
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(ApiError::ErrorStatus(StatusCode::NOT_FOUND))
    }

    async fn comment(&self, id: i64) -> Result<Comment, ApiError> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .comments
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(ApiError::ErrorStatus(StatusCode::NOT_FOUND))
    }

    async fn post_comments(&self, post_id: i64, _sort: &str) -> Result<Vec<Comment>, ApiError> {
        Ok(self
            .state
            .lock()
            .expect("mock state lock poisoned")
            .comments
            .iter()
            .filter(|c| c.post_id == Some(post_id))
            .cloned()
            .collect())
    }

    async fn cast_vote(
        &self,
        entity: EntityRef,
        action: VoteAction,
    ) -> Result<VoteResponse, ApiError> {
        let (fail, response) = {
            let mut state = self.state.lock().expect("mock state lock poisoned");
            state.vote_calls.push((entity, action));
            (state.fail_votes, state.vote_response)
        };
        self.wait_for_gate().await;

        if fail {
            return Err(ApiError::ErrorStatus(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(response)
    }

    async fn set_saved(&self, entity: EntityRef, saved: bool) -> Result<(), ApiError> {
        let fail = {
            let mut state = self.state.lock().expect("mock state lock poisoned");
            state.save_calls.push((entity, saved));
            state.fail_saves
        };
        self.wait_for_gate().await;

        if fail {
            return Err(ApiError::ErrorStatus(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(())
    }
}
