//! Push service: ID resolution, provider caching, bounded fan-out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aspen_core::{Push, PushResponse};
use aspen_storage::{PushCertStore, PushInfoStore};
use color_eyre::eyre::WrapErr as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::{PushProvider, PushProviderFactory, Pusher};

const DEFAULT_WORKERS: usize = 5;

struct CachedProvider<P> {
    provider: Arc<P>,
    stale_token: String,
}

/// Resolves enrollment IDs to push info and dispatches APNs wakeups.
///
/// Providers are cached per topic; the cache entry is discarded and rebuilt
/// when storage reports its stale token no longer current. Readers take an
/// `Arc` snapshot of the provider, so rotation never interrupts in-flight
/// pushes.
pub struct PushService<S, F: PushProviderFactory> {
    store: S,
    factory: F,
    providers: RwLock<HashMap<String, CachedProvider<F::Provider>>>,
    workers: usize,
}

impl<S, F> PushService<S, F>
where
    S: PushInfoStore + PushCertStore,
    F: PushProviderFactory,
{
    pub fn new(store: S, factory: F) -> Self {
        Self {
            store,
            factory,
            providers: RwLock::new(HashMap::new()),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Bound on concurrent in-flight pushes per provider.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn provider_for(&self, topic: &str) -> color_eyre::eyre::Result<Arc<F::Provider>> {
        {
            let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = providers.get(topic) {
                if !self
                    .store
                    .is_push_cert_stale(topic, &cached.stale_token)
                    .wrap_err("checking push cert staleness")?
                {
                    return Ok(Arc::clone(&cached.provider));
                }
                tracing::debug!(topic = %topic, "push certificate rotated; rebuilding provider");
            }
        }
        let cert = self
            .store
            .retrieve_push_cert(topic)
            .wrap_err("retrieving push cert")?
            .ok_or_else(|| color_eyre::eyre::eyre!("no push certificate for topic: {topic}"))?;
        let provider = Arc::new(self.factory.new_provider(&cert)?);
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        providers.insert(
            topic.to_string(),
            CachedProvider {
                provider: Arc::clone(&provider),
                stale_token: cert.stale_token,
            },
        );
        Ok(provider)
    }
}

impl<S, F> Pusher for PushService<S, F>
where
    S: PushInfoStore + PushCertStore,
    F: PushProviderFactory,
{
    async fn push(
        &self,
        ids: &[String],
    ) -> color_eyre::eyre::Result<HashMap<String, PushResponse>> {
        if ids.is_empty() {
            color_eyre::eyre::bail!("no ids provided");
        }
        let infos = self
            .store
            .retrieve_push_info(ids)
            .wrap_err("retrieving push info")?;

        // group destinations by topic so each uses its own push cert
        let mut by_topic: HashMap<String, Vec<(String, Push)>> = HashMap::new();
        for (id, push) in infos {
            by_topic.entry(push.topic.clone()).or_default().push((id, push));
        }

        let mut results = HashMap::new();
        for (topic, group) in by_topic {
            let provider = match self.provider_for(&topic) {
                Ok(provider) => provider,
                Err(err) => {
                    // provider failures are attributable to the topic; mark
                    // every destination in the group
                    tracing::info!(topic = %topic, error = %err, "push provider");
                    for (id, _) in group {
                        results.insert(id, PushResponse::failure(&err));
                    }
                    continue;
                }
            };

            if let [(id, push)] = &group[..] {
                // single destination bypasses the pool
                results.insert(id.clone(), provider.push_one(push).await);
                continue;
            }

            let semaphore = Arc::new(Semaphore::new(self.workers));
            let mut tasks = JoinSet::new();
            for (id, push) in group {
                let provider = Arc::clone(&provider);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    (id, provider.push_one(&push).await)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let (id, response) = joined.wrap_err("joining push task")?;
                results.insert(id, response);
            }
        }
        Ok(results)
    }
}
