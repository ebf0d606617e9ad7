//! REST access to the contest backend.

use futures::future::BoxFuture;

use crate::{
    dto::{
        contest::{ActionResponse, ContestDocument},
        leaderboard::LeaderboardDocument,
    },
    error::ApiResult,
};

/// Abstraction over the contest REST API so the sync loop can be driven by fakes in tests.
pub trait ContestApi: Send + Sync {
    /// `GET /contests/{id}`.
    fn fetch_contest(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ContestDocument>>;
    /// `GET /contests/{id}/leaderboard`.
    fn fetch_leaderboard(
        &self,
        contest_id: &str,
    ) -> BoxFuture<'static, ApiResult<LeaderboardDocument>>;
    /// `POST /contests/{id}/register`.
    fn register(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ActionResponse>>;
    /// `POST /contests/{id}/join`.
    fn join(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ActionResponse>>;
}

#[cfg(feature = "http-api")]
pub use http::HttpContestApi;

#[cfg(feature = "http-api")]
mod http {
    use std::{sync::Arc, time::Duration};

    use futures::future::BoxFuture;
    use reqwest::{Client, Method, StatusCode};
    use serde::de::DeserializeOwned;
    use tracing::debug;

    use super::ContestApi;
    use crate::{
        config::SyncConfig,
        dto::{
            contest::{ActionResponse, ContestDocument, ErrorBody},
            leaderboard::LeaderboardDocument,
        },
        error::{ApiError, ApiResult},
    };

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// [`ContestApi`] implementation backed by `reqwest`.
    #[derive(Clone)]
    pub struct HttpContestApi {
        client: Client,
        base_url: Arc<str>,
        token: Option<Arc<str>>,
    }

    impl HttpContestApi {
        /// Build a client for `config.api_base_url`, authenticating with `token` when given.
        pub fn new(config: &SyncConfig, token: Option<String>) -> ApiResult<Self> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|source| ApiError::ClientBuilder {
                    source: Box::new(source),
                })?;

            Ok(Self {
                client,
                base_url: Arc::from(config.api_base_url.trim_end_matches('/')),
                token: token.map(Arc::from),
            })
        }

        fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
            let url = format!("{}/{}", self.base_url, path);
            let builder = self.client.request(method, url);
            if let Some(ref token) = self.token {
                builder.bearer_auth(token.as_ref())
            } else {
                builder
            }
        }

        async fn send<T>(&self, method: Method, path: String) -> ApiResult<T>
        where
            T: DeserializeOwned,
        {
            debug!(%method, path, "contest API request");
            let response = self.request(method, &path).send().await.map_err(|source| {
                ApiError::RequestSend {
                    path: path.clone(),
                    source: Box::new(source),
                }
            })?;

            match response.status() {
                status if status.is_success() => {
                    response
                        .json::<T>()
                        .await
                        .map_err(|source| ApiError::DecodeResponse {
                            path,
                            source: Box::new(source),
                        })
                }
                status
                    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS =>
                {
                    match response.json::<ErrorBody>().await {
                        Ok(body) => Err(ApiError::Rejected {
                            path,
                            status: status.as_u16(),
                            reason: body.reason,
                            message: body.message,
                        }),
                        Err(_) => Err(ApiError::RequestStatus {
                            path,
                            status: status.as_u16(),
                        }),
                    }
                }
                other => Err(ApiError::RequestStatus {
                    path,
                    status: other.as_u16(),
                }),
            }
        }
    }

    impl ContestApi for HttpContestApi {
        fn fetch_contest(
            &self,
            contest_id: &str,
        ) -> BoxFuture<'static, ApiResult<ContestDocument>> {
            let api = self.clone();
            let path = format!("contests/{contest_id}");
            Box::pin(async move { api.send(Method::GET, path).await })
        }

        fn fetch_leaderboard(
            &self,
            contest_id: &str,
        ) -> BoxFuture<'static, ApiResult<LeaderboardDocument>> {
            let api = self.clone();
            let path = format!("contests/{contest_id}/leaderboard");
            Box::pin(async move { api.send(Method::GET, path).await })
        }

        fn register(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ActionResponse>> {
            let api = self.clone();
            let path = format!("contests/{contest_id}/register");
            Box::pin(async move { api.send(Method::POST, path).await })
        }

        fn join(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ActionResponse>> {
            let api = self.clone();
            let path = format!("contests/{contest_id}/join");
            Box::pin(async move { api.send(Method::POST, path).await })
        }
    }
}
