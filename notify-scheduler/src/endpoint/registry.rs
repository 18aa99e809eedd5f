//! Scheme-to-factory registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{
    DeliveryEndpoint, DiscordFactory, EndpointFactory, EndpointUrl, HttpClientPool,
    TelegramFactory, WebhookFactory,
};
use crate::{Error, Result};

/// Builder for an [`EndpointRegistry`]. Populated once during bootstrap.
pub struct EndpointRegistryBuilder {
    factories: HashMap<&'static str, Arc<dyn EndpointFactory>>,
}

impl EndpointRegistryBuilder {
    fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under each of its schemes. A later registration
    /// for the same scheme replaces the earlier one.
    pub fn register(mut self, factory: Arc<dyn EndpointFactory>) -> Self {
        for &scheme in factory.schemes() {
            if let Some(previous) = self.factories.insert(scheme, factory.clone()) {
                warn!(
                    scheme = %scheme,
                    previous = previous.service_id(),
                    replacement = factory.service_id(),
                    "Endpoint scheme registered twice; replacing"
                );
            }
        }
        self
    }

    /// Register the built-in webhook, Discord and Telegram adapters.
    pub fn with_builtin(self) -> Self {
        self.register(Arc::new(WebhookFactory))
            .register(Arc::new(DiscordFactory::default()))
            .register(Arc::new(TelegramFactory::default()))
    }

    pub fn build(self, clients: Arc<HttpClientPool>) -> EndpointRegistry {
        EndpointRegistry {
            factories: self.factories,
            clients,
        }
    }
}

/// Immutable scheme-to-factory table.
///
/// Safe to share across tasks without locking.
pub struct EndpointRegistry {
    factories: HashMap<&'static str, Arc<dyn EndpointFactory>>,
    clients: Arc<HttpClientPool>,
}

impl EndpointRegistry {
    pub fn builder() -> EndpointRegistryBuilder {
        EndpointRegistryBuilder::new()
    }

    fn factory_for(&self, url: &EndpointUrl) -> Result<&Arc<dyn EndpointFactory>> {
        self.factories
            .get(url.scheme())
            .ok_or_else(|| Error::UnknownScheme(url.scheme().to_string()))
    }

    /// Build a configured endpoint for `url`.
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn DeliveryEndpoint>> {
        let url = EndpointUrl::parse(url)?;
        self.factory_for(&url)?.parse(&url, &self.clients)
    }

    /// Check `url` without building an endpoint.
    pub fn validate(&self, url: &str) -> Result<()> {
        let url = EndpointUrl::parse(url)?;
        self.factory_for(&url)?.validate(&url)
    }

    /// Service id that would handle `url`, if any.
    pub fn service_id_for(&self, url: &str) -> Option<&'static str> {
        let url = EndpointUrl::parse(url).ok()?;
        self.factories.get(url.scheme()).map(|f| f.service_id())
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.factories.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }

    pub fn clients(&self) -> &Arc<HttpClientPool> {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::DeliveryResult;
    use crate::notification::Notification;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullEndpoint;

    #[async_trait]
    impl DeliveryEndpoint for NullEndpoint {
        fn service_id(&self) -> &'static str {
            "null"
        }

        async fn send(&self, _: &Notification, _: &CancellationToken) -> DeliveryResult {
            Ok(())
        }

        fn default_port(&self) -> u16 {
            0
        }
    }

    struct NullFactory;

    impl EndpointFactory for NullFactory {
        fn service_id(&self) -> &'static str {
            "null"
        }

        fn schemes(&self) -> &'static [&'static str] {
            &["null", "devnull"]
        }

        fn parse(&self, url: &EndpointUrl, _: &HttpClientPool) -> Result<Arc<dyn DeliveryEndpoint>> {
            self.validate(url)?;
            Ok(Arc::new(NullEndpoint))
        }

        fn validate(&self, url: &EndpointUrl) -> Result<()> {
            if url.host_port().is_empty() {
                return Err(Error::invalid_url(url.as_str(), "missing host"));
            }
            Ok(())
        }
    }

    fn registry() -> EndpointRegistry {
        EndpointRegistry::builder()
            .with_builtin()
            .register(Arc::new(NullFactory))
            .build(Arc::new(HttpClientPool::new().unwrap()))
    }

    #[tokio::test]
    async fn test_aliases_resolve_to_same_service() {
        let registry = registry();
        assert_eq!(registry.service_id_for("null://a"), Some("null"));
        assert_eq!(registry.service_id_for("devnull://a"), Some("null"));
        assert_eq!(registry.service_id_for("tgram://1:a/2"), Some("telegram"));
        assert_eq!(registry.service_id_for("telegram://1:a/2"), Some("telegram"));

        let endpoint = registry.resolve("devnull://host").unwrap();
        assert_eq!(endpoint.service_id(), "null");
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("gopher://host"),
            Err(Error::UnknownScheme(s)) if s == "gopher"
        ));
        // Schemes are case-sensitive.
        assert!(matches!(
            registry.resolve("NULL://host"),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let registry = registry();
        assert!(matches!(
            registry.validate("null://"),
            Err(Error::InvalidEndpointUrl { .. })
        ));
        assert!(matches!(
            registry.validate("not a url"),
            Err(Error::InvalidEndpointUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_schemes_sorted() {
        let schemes = registry().schemes();
        let mut sorted = schemes.clone();
        sorted.sort_unstable();
        assert_eq!(schemes, sorted);
        assert!(schemes.contains(&"discord"));
        assert!(schemes.contains(&"jsons"));
    }
}
