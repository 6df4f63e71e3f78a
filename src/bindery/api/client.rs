/*
 * Copyright (C) 2025 The Bindery Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::bindery::api::types::{Claim, ClaimList, Volume, VolumeList, WatchEvent};
use crate::bindery::logger::log_warn;
use crate::bindery::util::with_context;

const COMPONENT: &str = "api-client";

/// Canonical environment variable for overriding the Bindery API endpoint.
const SERVER_ENV: &str = "BINDERY_SERVER";
const DEFAULT_SERVER_ENDPOINT: &str = "http://127.0.0.1:8480";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const WATCH_BUFFER_SIZE: usize = 64;
// Watch connections are expected to outlive any sane request timeout.
const WATCH_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

pub type DynError = Box<dyn Error + Send + Sync>;
pub type DynResult<T> = Result<T, DynError>;
pub type ApiFuture<T> = Pin<Box<dyn Future<Output = DynResult<T>> + Send>>;

#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.message)
    }
}

impl Error for HttpError {}

/// True when the error is an optimistic-concurrency rejection. The caller is
/// expected to drop its copy and retry from a fresh read.
pub fn is_conflict(err: &DynError) -> bool {
    err.downcast_ref::<HttpError>()
        .map(|http| http.status == StatusCode::CONFLICT)
        .unwrap_or(false)
}

pub fn is_not_found(err: &DynError) -> bool {
    err.downcast_ref::<HttpError>()
        .map(|http| http.status == StatusCode::NOT_FOUND)
        .unwrap_or(false)
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn next_backoff(current: Duration) -> Duration {
    current
        .checked_mul(2)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Live feed of typed watch events. Dropping the subscription tears down the
/// underlying transport task.
pub struct WatchSubscription<T> {
    receiver: mpsc::Receiver<WatchEvent<T>>,
}

impl<T> WatchSubscription<T> {
    pub fn new(receiver: mpsc::Receiver<WatchEvent<T>>) -> Self {
        Self { receiver }
    }

    /// Returns `None` once the underlying stream has ended.
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.receiver.recv().await
    }
}

/// Narrow remote-access interface used by every controller component.
///
/// Methods return boxed futures so the trait stays object-safe and an
/// in-memory fake can stand in for the HTTP implementation in tests.
pub trait ControllerClient: Send + Sync {
    fn get_volume(&self, name: String) -> ApiFuture<Option<Volume>>;
    fn list_volumes(&self) -> ApiFuture<VolumeList>;
    fn watch_volumes(&self, resource_version: Option<String>) -> ApiFuture<WatchSubscription<Volume>>;
    fn create_volume(&self, volume: Volume) -> ApiFuture<Volume>;
    fn update_volume(&self, volume: Volume) -> ApiFuture<Volume>;
    fn update_volume_status(&self, volume: Volume) -> ApiFuture<Volume>;
    fn delete_volume(&self, name: String) -> ApiFuture<()>;

    fn get_claim(&self, namespace: String, name: String) -> ApiFuture<Option<Claim>>;
    fn list_claims(&self) -> ApiFuture<ClaimList>;
    fn watch_claims(&self, resource_version: Option<String>) -> ApiFuture<WatchSubscription<Claim>>;
    fn update_claim(&self, claim: Claim) -> ApiFuture<Claim>;
    fn update_claim_status(&self, claim: Claim) -> ApiFuture<Claim>;
}

/// HTTP implementation of [`ControllerClient`].
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    client: Client,
}

impl ApiClient {
    pub fn from_env() -> DynResult<Self> {
        let endpoint =
            env::var(SERVER_ENV).unwrap_or_else(|_| DEFAULT_SERVER_ENDPOINT.to_string());
        Self::new(&endpoint)
    }

    pub fn new(endpoint: &str) -> DynResult<Self> {
        let base = endpoint.trim_end_matches('/').to_string();
        Url::parse(&base).map_err(|err| with_context(err, "invalid API endpoint"))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "failed to build HTTP client"))?;
        Ok(Self { base, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn volume_path(name: &str) -> String {
        format!("/v1/volumes/{name}")
    }

    fn claim_path(namespace: &str, name: &str) -> String {
        format!("/v1/namespaces/{namespace}/claims/{name}")
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> DynResult<reqwest::Response> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.request(method.clone(), self.url(path));
            if let Some(body) = &body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !(should_retry_status(status) && attempt < RETRY_ATTEMPTS) {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if !(is_retryable_reqwest(&err) && attempt < RETRY_ATTEMPTS) {
                        return Err(with_context(err, format!("{method} {path} failed")));
                    }
                }
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> DynResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|err| with_context(err, "failed to decode API response"));
        }
        let message = response.text().await.unwrap_or_default();
        let message = if message.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            message
        };
        Err(Box::new(HttpError::new(status, message)))
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> DynResult<T> {
        let response = self.execute(method, path, body).await?;
        Self::read_json(response).await
    }

    async fn open_watch<T>(
        &self,
        collection: &str,
        resource_version: Option<String>,
    ) -> DynResult<WatchSubscription<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut url = format!("{}?watch=true", self.url(collection));
        if let Some(rv) = resource_version.as_deref().filter(|rv| !rv.is_empty()) {
            url.push_str(&format!("&resourceVersion={rv}"));
        }
        let response = self
            .client
            .get(url)
            .timeout(WATCH_TIMEOUT)
            .send()
            .await
            .map_err(|err| with_context(err, format!("failed to open watch on {collection}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Box::new(HttpError::new(status, message)));
        }

        let (sender, receiver) = mpsc::channel(WATCH_BUFFER_SIZE);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else {
                    break;
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<WatchEvent<T>>(line) {
                        Ok(event) => {
                            if sender.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            log_warn(
                                COMPONENT,
                                "Dropping undecodable watch line",
                                &[("error", err.to_string().as_str())],
                            );
                        }
                    }
                }
            }
        });

        Ok(WatchSubscription::new(receiver))
    }

    fn object_name(volume: &Volume) -> DynResult<String> {
        let name = volume.name();
        if name.is_empty() {
            return Err(crate::bindery::util::new_error(
                "volume has no metadata.name",
            ));
        }
        Ok(name.to_string())
    }
}

impl ControllerClient for ApiClient {
    fn get_volume(&self, name: String) -> ApiFuture<Option<Volume>> {
        let client = self.clone();
        Box::pin(async move {
            let response = client
                .execute(Method::GET, &Self::volume_path(&name), None)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let volume = Self::read_json(response).await?;
            Ok(Some(volume))
        })
    }

    fn list_volumes(&self) -> ApiFuture<VolumeList> {
        let client = self.clone();
        Box::pin(async move { client.fetch_json(Method::GET, "/v1/volumes", None).await })
    }

    fn watch_volumes(&self, resource_version: Option<String>) -> ApiFuture<WatchSubscription<Volume>> {
        let client = self.clone();
        Box::pin(async move { client.open_watch("/v1/volumes", resource_version).await })
    }

    fn create_volume(&self, volume: Volume) -> ApiFuture<Volume> {
        let client = self.clone();
        Box::pin(async move {
            let body = serde_json::to_value(&volume)
                .map_err(|err| with_context(err, "failed to encode volume"))?;
            client
                .fetch_json(Method::POST, "/v1/volumes", Some(body))
                .await
        })
    }

    fn update_volume(&self, volume: Volume) -> ApiFuture<Volume> {
        let client = self.clone();
        Box::pin(async move {
            let name = Self::object_name(&volume)?;
            let body = serde_json::to_value(&volume)
                .map_err(|err| with_context(err, "failed to encode volume"))?;
            client
                .fetch_json(Method::PUT, &Self::volume_path(&name), Some(body))
                .await
        })
    }

    fn update_volume_status(&self, volume: Volume) -> ApiFuture<Volume> {
        let client = self.clone();
        Box::pin(async move {
            let name = Self::object_name(&volume)?;
            let body = serde_json::to_value(&volume)
                .map_err(|err| with_context(err, "failed to encode volume"))?;
            let path = format!("{}/status", Self::volume_path(&name));
            client.fetch_json(Method::PUT, &path, Some(body)).await
        })
    }

    fn delete_volume(&self, name: String) -> ApiFuture<()> {
        let client = self.clone();
        Box::pin(async move {
            let response = client
                .execute(Method::DELETE, &Self::volume_path(&name), None)
                .await?;
            let status = response.status();
            // A volume that is already gone is an acceptable outcome.
            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(());
            }
            let message = response.text().await.unwrap_or_default();
            Err(Box::new(HttpError::new(status, message)) as DynError)
        })
    }

    fn get_claim(&self, namespace: String, name: String) -> ApiFuture<Option<Claim>> {
        let client = self.clone();
        Box::pin(async move {
            let response = client
                .execute(Method::GET, &Self::claim_path(&namespace, &name), None)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let claim = Self::read_json(response).await?;
            Ok(Some(claim))
        })
    }

    fn list_claims(&self) -> ApiFuture<ClaimList> {
        let client = self.clone();
        Box::pin(async move { client.fetch_json(Method::GET, "/v1/claims", None).await })
    }

    fn watch_claims(&self, resource_version: Option<String>) -> ApiFuture<WatchSubscription<Claim>> {
        let client = self.clone();
        Box::pin(async move { client.open_watch("/v1/claims", resource_version).await })
    }

    fn update_claim(&self, claim: Claim) -> ApiFuture<Claim> {
        let client = self.clone();
        Box::pin(async move {
            let name = claim.name().to_string();
            if name.is_empty() {
                return Err(crate::bindery::util::new_error("claim has no metadata.name"));
            }
            let namespace = claim.namespace();
            let body = serde_json::to_value(&claim)
                .map_err(|err| with_context(err, "failed to encode claim"))?;
            client
                .fetch_json(Method::PUT, &Self::claim_path(&namespace, &name), Some(body))
                .await
        })
    }

    fn update_claim_status(&self, claim: Claim) -> ApiFuture<Claim> {
        let client = self.clone();
        Box::pin(async move {
            let name = claim.name().to_string();
            if name.is_empty() {
                return Err(crate::bindery::util::new_error("claim has no metadata.name"));
            }
            let namespace = claim.namespace();
            let body = serde_json::to_value(&claim)
                .map_err(|err| with_context(err, "failed to encode claim"))?;
            let path = format!("{}/status", Self::claim_path(&namespace, &name));
            client.fetch_json(Method::PUT, &path, Some(body)).await
        })
    }
}
