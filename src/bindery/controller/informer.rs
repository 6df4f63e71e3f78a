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

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::bindery::api::client::{ApiFuture, ControllerClient, WatchSubscription};
use crate::bindery::api::types::{Claim, ObjectKey, Volume, WatchEventType};
use crate::bindery::logger::{log_debug, log_warn};

const COMPONENT: &str = "informer";
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Objects a generic informer can mirror.
pub trait Resource: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    fn kind() -> &'static str;
    /// Rejects objects the controller cannot safely act on; such objects are
    /// logged and quarantined until a corrected version arrives.
    fn validate(&self) -> Result<(), String>;
}

impl Resource for Volume {
    fn key(&self) -> ObjectKey {
        Volume::key(self)
    }

    fn kind() -> &'static str {
        "Volume"
    }

    fn validate(&self) -> Result<(), String> {
        if self.name().is_empty() {
            return Err("missing metadata.name".to_string());
        }
        self.spec
            .capacity
            .value()
            .map_err(|err| err.to_string())
            .map(|_| ())
    }
}

impl Resource for Claim {
    fn key(&self) -> ObjectKey {
        Claim::key(self)
    }

    fn kind() -> &'static str {
        "Claim"
    }

    fn validate(&self) -> Result<(), String> {
        if self.name().is_empty() {
            return Err("missing metadata.name".to_string());
        }
        self.requested_capacity()
            .value()
            .map_err(|err| err.to_string())
            .map(|_| ())
    }
}

/// Per-object event delivered to the informer's handler in arrival order.
pub enum InformerEvent<T> {
    Applied(T),
    Removed(T),
}

pub type EventHandler<T> = Box<dyn Fn(InformerEvent<T>) + Send + Sync>;

/// The pair of calls an informer needs from the API: a full list returning
/// the collection plus its revision cursor, and a watch from a cursor.
pub struct ListWatch<T> {
    pub list: Box<dyn Fn() -> ApiFuture<(Vec<T>, Option<String>)> + Send + Sync>,
    pub watch: Box<dyn Fn(Option<String>) -> ApiFuture<WatchSubscription<T>> + Send + Sync>,
}

impl ListWatch<Volume> {
    pub fn volumes(client: Arc<dyn ControllerClient>) -> Self {
        let list_client = Arc::clone(&client);
        let watch_client = client;
        Self {
            list: Box::new(move || {
                let client = Arc::clone(&list_client);
                Box::pin(async move {
                    let list = client.list_volumes().await?;
                    Ok((list.items, list.metadata.resource_version))
                })
            }),
            watch: Box::new(move |cursor| watch_client.watch_volumes(cursor)),
        }
    }
}

impl ListWatch<Claim> {
    pub fn claims(client: Arc<dyn ControllerClient>) -> Self {
        let list_client = Arc::clone(&client);
        let watch_client = client;
        Self {
            list: Box::new(move || {
                let client = Arc::clone(&list_client);
                Box::pin(async move {
                    let list = client.list_claims().await?;
                    Ok((list.items, list.metadata.resource_version))
                })
            }),
            watch: Box::new(move |cursor| watch_client.watch_claims(cursor)),
        }
    }
}

/// Eventually-consistent local mirror of a remote collection.
///
/// A single task lists, then consumes the watch stream, so events for one
/// object are always observed in order. Watch failures discard the revision
/// cursor and re-list under a doubling backoff; a configurable resync
/// interval re-emits every cached object to self-heal from missed work.
pub struct Informer<T: Resource> {
    inner: Arc<InformerInner<T>>,
}

impl<T: Resource> Clone for Informer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct InformerInner<T: Resource> {
    list_watch: ListWatch<T>,
    cache: RwLock<HashMap<ObjectKey, T>>,
    handler: RwLock<Option<EventHandler<T>>>,
    resync: Duration,
}

impl<T: Resource> Informer<T> {
    pub fn new(list_watch: ListWatch<T>, resync: Duration) -> Self {
        Self {
            inner: Arc::new(InformerInner {
                list_watch,
                cache: RwLock::new(HashMap::new()),
                handler: RwLock::new(None),
                resync,
            }),
        }
    }

    /// Registers the event handler. Must be called before `spawn`.
    pub fn set_handler(&self, handler: EventHandler<T>) {
        let mut guard = self
            .inner
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(handler);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn list_cached(&self) -> Vec<T> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Stores an object returned by an API write. The written version becomes
    /// the local truth immediately instead of waiting for the watch echo.
    pub fn store(&self, object: T) {
        let key = object.key();
        self.inner
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, object);
    }

    /// Drops an object after its deletion has been issued.
    pub fn forget(&self, key: &ObjectKey) {
        self.inner
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { run(inner, shutdown).await })
    }

    fn dispatch(inner: &InformerInner<T>, event: InformerEvent<T>) {
        let guard = inner
            .handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handler) = guard.as_ref() {
            handler(event);
        }
    }
}

async fn run<T: Resource>(inner: Arc<InformerInner<T>>, shutdown: CancellationToken) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let (items, cursor) = match (inner.list_watch.list)().await {
            Ok(listed) => {
                backoff = BACKOFF_INITIAL;
                listed
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "List failed, backing off",
                    &[("kind", T::kind()), ("error", err.to_string().as_str())],
                );
                if !pause(&shutdown, &mut backoff).await {
                    return;
                }
                continue;
            }
        };

        let valid: Vec<T> = items
            .into_iter()
            .filter(|item| match item.validate() {
                Ok(()) => true,
                Err(reason) => {
                    log_warn(
                        COMPONENT,
                        "Quarantining invalid object from list",
                        &[("kind", T::kind()), ("reason", reason.as_str())],
                    );
                    false
                }
            })
            .collect();

        let removed: Vec<T> = {
            let mut cache = inner
                .cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut fresh: HashMap<ObjectKey, T> = HashMap::with_capacity(valid.len());
            for item in &valid {
                fresh.insert(item.key(), item.clone());
            }
            let removed = cache
                .values()
                .filter(|old| !fresh.contains_key(&old.key()))
                .cloned()
                .collect();
            *cache = fresh;
            removed
        };

        log_debug(
            COMPONENT,
            "Synchronized collection",
            &[
                ("kind", T::kind()),
                ("objects", valid.len().to_string().as_str()),
            ],
        );

        for item in valid {
            Informer::dispatch(&inner, InformerEvent::Applied(item));
        }
        for item in removed {
            Informer::dispatch(&inner, InformerEvent::Removed(item));
        }

        let mut subscription = match (inner.list_watch.watch)(cursor).await {
            Ok(subscription) => subscription,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Watch failed to open, backing off",
                    &[("kind", T::kind()), ("error", err.to_string().as_str())],
                );
                if !pause(&shutdown, &mut backoff).await {
                    return;
                }
                continue;
            }
        };

        let mut resync = interval_at(Instant::now() + inner.resync, inner.resync);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = resync.tick() => {
                    let snapshot = {
                        let cache = inner
                            .cache
                            .read()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        cache.values().cloned().collect::<Vec<T>>()
                    };
                    for object in snapshot {
                        Informer::dispatch(&inner, InformerEvent::Applied(object));
                    }
                }
                event = subscription.recv() => match event {
                    Some(event) => match event.event_type {
                        WatchEventType::Added | WatchEventType::Modified => {
                            if let Err(reason) = event.object.validate() {
                                log_warn(
                                    COMPONENT,
                                    "Quarantining invalid object from watch",
                                    &[("kind", T::kind()), ("reason", reason.as_str())],
                                );
                                continue;
                            }
                            {
                                let mut cache = inner
                                    .cache
                                    .write()
                                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                                cache.insert(event.object.key(), event.object.clone());
                            }
                            Informer::dispatch(&inner, InformerEvent::Applied(event.object));
                        }
                        WatchEventType::Deleted => {
                            {
                                let mut cache = inner
                                    .cache
                                    .write()
                                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                                cache.remove(&event.object.key());
                            }
                            Informer::dispatch(&inner, InformerEvent::Removed(event.object));
                        }
                        WatchEventType::Error => {
                            log_warn(
                                COMPONENT,
                                "Watch reported an error event, re-listing",
                                &[("kind", T::kind())],
                            );
                            break;
                        }
                    },
                    None => {
                        log_debug(
                            COMPONENT,
                            "Watch stream ended, re-listing",
                            &[("kind", T::kind())],
                        );
                        break;
                    }
                }
            }
        }

        if !pause(&shutdown, &mut backoff).await {
            return;
        }
    }
}

/// Sleeps for the current backoff, doubling it for next time. Returns false
/// when shutdown was requested during the pause.
async fn pause(shutdown: &CancellationToken, backoff: &mut Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => return false,
        _ = sleep(*backoff) => {}
    }
    let next = backoff.checked_mul(2).unwrap_or(BACKOFF_MAX);
    *backoff = next.min(BACKOFF_MAX);
    true
}
