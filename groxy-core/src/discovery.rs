//! Aggregates rules and upstreams across one or more discovery providers
//! into a single, atomically-swapped snapshot the dispatcher reads from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::rules::{sort_rules, Rule, Upstream};

/// What a single provider contributes to the merged view.
pub struct ProviderSnapshot {
    pub upstreams: Vec<Upstream>,
    pub rules: Vec<Rule>,
}

/// A source of rules and upstreams, e.g. a file watched on disk.
///
/// The aggregator re-queries every provider's [`Provider::snapshot`]
/// whenever any one of them resolves [`Provider::changed`] — not just the
/// one that changed — since a rule from one provider may reference an
/// upstream contributed by another.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// The provider's current upstreams and rules.
    async fn snapshot(&self) -> Result<ProviderSnapshot, Error>;

    /// Resolves once this provider's state may have changed. Implementors
    /// that never change after startup (a fixed, in-memory set of rules)
    /// may return a future that never resolves.
    async fn changed(&self);
}

/// The merged, queryable state of all providers at a point in time.
pub struct Snapshot {
    pub upstreams: HashMap<String, Arc<Upstream>>,
    pub rules: Vec<Rule>,
}

impl Snapshot {
    pub fn upstream(&self, name: &str) -> Option<Arc<Upstream>> {
        self.upstreams.get(name).cloned()
    }
}

/// Fans multiple providers' rules and upstreams into one [`Snapshot`],
/// kept fresh for the lifetime of [`Discovery::run`].
pub struct Discovery {
    providers: Vec<Arc<dyn Provider>>,
    state: RwLock<Arc<Snapshot>>,
}

impl Discovery {
    pub async fn new(providers: Vec<Arc<dyn Provider>>) -> Result<Self, Error> {
        let initial = merge(&providers).await?;
        Ok(Discovery {
            providers,
            state: RwLock::new(Arc::new(initial)),
        })
    }

    /// The current snapshot. Cheap: callers hold their own `Arc` and are
    /// unaffected by later refreshes.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.state.read().expect("discovery state lock poisoned").clone()
    }

    /// Re-merge on every provider change notification until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("discovery aggregator stopping");
                    return;
                }
                _ = wait_for_any_change(&self.providers) => {
                    match merge(&self.providers).await {
                        Ok(snapshot) => {
                            let previous = {
                                let mut guard = self.state.write().expect("discovery state lock poisoned");
                                std::mem::replace(&mut *guard, Arc::new(snapshot))
                            };
                            // Best-effort: the old snapshot's upstream channels are simply
                            // dropped once the last reference (any in-flight calls still
                            // holding one) goes away.
                            drop(previous);
                        }
                        Err(err) => warn!(error = %err, "discovery refresh failed, keeping previous snapshot"),
                    }
                }
            }
        }
    }
}

/// Re-query every provider and concatenate what succeeded.
///
/// A provider that fails to produce a snapshot is logged and skipped rather
/// than aborting the whole refresh: the other providers still contribute,
/// and the caller keeps serving the previous snapshot only if every
/// provider fails (an empty result is still a valid, if unhelpful, one).
async fn merge(providers: &[Arc<dyn Provider>]) -> Result<Snapshot, Error> {
    let mut upstreams = HashMap::new();
    let mut rules = Vec::new();
    for provider in providers {
        let snap = match provider.snapshot().await {
            Ok(snap) => snap,
            Err(err) => {
                warn!(provider = provider.name(), error = %err, "discovery provider failed, dropping its contribution");
                continue;
            }
        };
        for upstream in snap.upstreams {
            upstreams.insert(upstream.name.clone(), Arc::new(upstream));
        }
        let base = rules.len();
        for (i, mut rule) in snap.rules.into_iter().enumerate() {
            rule.source_index = base + i;
            rules.push(rule);
        }
    }
    sort_rules(&mut rules);
    Ok(Snapshot { upstreams, rules })
}

async fn wait_for_any_change(providers: &[Arc<dyn Provider>]) {
    if providers.is_empty() {
        std::future::pending::<()>().await;
        return;
    }
    let mut set = tokio::task::JoinSet::new();
    for provider in providers.iter().cloned() {
        set.spawn(async move { provider.changed().await });
    }
    set.join_next().await;
    set.abort_all();
}
