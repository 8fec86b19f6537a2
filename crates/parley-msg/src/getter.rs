//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Resolution of "the rest of the system" as a single send endpoint.
//!
//! The background context can talk to everyone immediately. Popups and
//! settings pages may start before the background is up, so they resolve
//! lazily through a [`SiblingLocator`]. Callers only ever see
//! [`ProviderGetter::get`].

use std::sync::Arc;

use async_trait::async_trait;
use parley_common::LocateConfig;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::identity::ContextId;
use crate::provider::TransportProvider;
use crate::{BusError, Result};

/// Finds the endpoint through which a long-lived sibling is reachable.
#[async_trait]
pub trait SiblingLocator: Send + Sync {
    /// Locate the sibling, waiting for it if needed.
    async fn locate(&self) -> Result<Arc<TransportProvider>>;
}

/// Locator waiting for the background context to be open on the host.
pub struct BackgroundLocator {
    provider: Arc<TransportProvider>,
    target: ContextId,
    config: LocateConfig,
}

impl BackgroundLocator {
    /// Locate the background on the host behind `provider`, sending through
    /// `provider` once found.
    pub fn new(provider: Arc<TransportProvider>, config: LocateConfig) -> Self {
        Self {
            provider,
            target: ContextId::background(),
            config,
        }
    }
}

#[async_trait]
impl SiblingLocator for BackgroundLocator {
    async fn locate(&self) -> Result<Arc<TransportProvider>> {
        for attempt in 1..=self.config.max_attempts {
            if self.provider.host().is_open(&self.target) {
                debug!(
                    context = %self.provider.context(),
                    target = %self.target,
                    attempt,
                    "sibling located"
                );
                return Ok(Arc::clone(&self.provider));
            }
            if attempt < self.config.max_attempts {
                sleep(self.config.retry_interval).await;
            }
        }
        Err(BusError::SiblingUnavailable {
            context: self.target.to_string(),
            attempts: self.config.max_attempts,
        })
    }
}

/// Lazily resolved endpoint; the first successful lookup is cached.
pub struct DeferredProvider {
    locator: Arc<dyn SiblingLocator>,
    resolved: OnceCell<Arc<TransportProvider>>,
}

/// Uniform access to the send endpoint, whichever way it is resolved.
pub enum ProviderGetter {
    /// Endpoint known up front.
    Resolved(Arc<TransportProvider>),
    /// Endpoint found on first use.
    Deferred(DeferredProvider),
}

impl ProviderGetter {
    /// Getter returning `provider` immediately.
    pub fn resolved(provider: Arc<TransportProvider>) -> Self {
        ProviderGetter::Resolved(provider)
    }

    /// Getter consulting `locator` on first use.
    pub fn deferred(locator: Arc<dyn SiblingLocator>) -> Self {
        ProviderGetter::Deferred(DeferredProvider {
            locator,
            resolved: OnceCell::new(),
        })
    }

    /// Resolve the endpoint. A failed lookup is not cached; the next call retries.
    pub async fn get(&self) -> Result<Arc<TransportProvider>> {
        match self {
            ProviderGetter::Resolved(provider) => Ok(Arc::clone(provider)),
            ProviderGetter::Deferred(deferred) => {
                let provider = deferred
                    .resolved
                    .get_or_try_init(|| async {
                        let provider = deferred.locator.locate().await?;
                        info!(context = %provider.context(), "deferred endpoint resolved");
                        Ok::<_, BusError>(provider)
                    })
                    .await?;
                Ok(Arc::clone(provider))
            }
        }
    }

    /// Whether the endpoint is already available without waiting.
    pub fn is_resolved(&self) -> bool {
        match self {
            ProviderGetter::Resolved(_) => true,
            ProviderGetter::Deferred(deferred) => deferred.resolved.initialized(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::host::{HostTransport, InMemoryHost};
    use crate::identity::ContextKind;

    fn popup_provider(host: &Arc<InMemoryHost>) -> Arc<TransportProvider> {
        let popup = ContextId::generate(ContextKind::Popup);
        host.open_context(&popup);
        let shared: Arc<dyn HostTransport> = host.clone();
        Arc::new(TransportProvider::new(popup, shared))
    }

    fn fast(max_attempts: u32) -> LocateConfig {
        LocateConfig {
            retry_interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    struct CountingLocator {
        calls: AtomicU32,
        provider: Arc<TransportProvider>,
    }

    #[async_trait]
    impl SiblingLocator for CountingLocator {
        async fn locate(&self) -> Result<Arc<TransportProvider>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.provider))
        }
    }

    #[tokio::test]
    async fn resolved_getter_returns_immediately() {
        let host = Arc::new(InMemoryHost::default());
        let provider = popup_provider(&host);
        let getter = ProviderGetter::resolved(Arc::clone(&provider));
        assert!(getter.is_resolved());
        assert!(Arc::ptr_eq(&getter.get().await.expect("get"), &provider));
    }

    #[tokio::test]
    async fn deferred_getter_locates_once() {
        let host = Arc::new(InMemoryHost::default());
        let locator = Arc::new(CountingLocator {
            calls: AtomicU32::new(0),
            provider: popup_provider(&host),
        });
        let getter = ProviderGetter::deferred(locator.clone());
        assert!(!getter.is_resolved());
        getter.get().await.expect("first");
        getter.get().await.expect("second");
        assert!(getter.is_resolved());
        assert_eq!(locator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_locator_waits_for_late_background() {
        let host = Arc::new(InMemoryHost::default());
        let provider = popup_provider(&host);
        let locator = BackgroundLocator::new(Arc::clone(&provider), fast(200));

        let late = Arc::clone(&host);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            late.open_context(&ContextId::background());
        });

        let located = locator.locate().await.expect("background appears");
        assert!(Arc::ptr_eq(&located, &provider));
    }

    #[tokio::test]
    async fn background_locator_gives_up_and_getter_retries() {
        let host = Arc::new(InMemoryHost::default());
        let provider = popup_provider(&host);
        let getter = ProviderGetter::deferred(Arc::new(BackgroundLocator::new(provider, fast(3))));

        let err = getter.get().await.expect_err("no background");
        assert!(matches!(
            err,
            BusError::SiblingUnavailable { attempts: 3, .. }
        ));
        assert!(!getter.is_resolved());

        host.open_context(&ContextId::background());
        getter.get().await.expect("resolves after background starts");
        assert!(getter.is_resolved());
    }
}
