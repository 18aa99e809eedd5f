//! Shared HTTP client pools.
//!
//! Endpoints never build their own clients; they ask for one by
//! [`ServiceCategory`]. `reqwest::Client` is an `Arc` internally, so handing
//! out clones shares the connection pool. Every request sent through an
//! [`HttpSender`] is reported to the pool's [`HttpObserver`], if any.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DeliveryError;
use crate::{Error, Result};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Client pool category requested by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceCategory {
    /// Hosted vendor APIs (chat, push).
    Cloud,
    /// User-supplied webhook targets.
    Webhook,
    Default,
}

/// Per-category client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl ServiceCategory {
    pub fn settings(&self) -> ClientSettings {
        match self {
            Self::Cloud => ClientSettings {
                timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(10),
                pool_max_idle_per_host: 10,
                pool_idle_timeout: Duration::from_secs(90),
            },
            Self::Webhook => ClientSettings {
                timeout: Duration::from_secs(15),
                connect_timeout: Duration::from_secs(5),
                pool_max_idle_per_host: 5,
                pool_idle_timeout: Duration::from_secs(30),
            },
            Self::Default => ClientSettings {
                timeout: Duration::from_secs(60),
                connect_timeout: Duration::from_secs(10),
                pool_max_idle_per_host: 2,
                pool_idle_timeout: Duration::from_secs(60),
            },
        }
    }
}

fn build_client(settings: ClientSettings) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .pool_idle_timeout(settings.pool_idle_timeout)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}

/// Receives the status and latency of every outbound request.
pub trait HttpObserver: Send + Sync {
    /// `status` is 0 when no response was received.
    fn on_request(&self, service_id: &str, method: &str, status: u16, elapsed: Duration);
}

/// One client per [`ServiceCategory`].
#[derive(Clone)]
pub struct HttpClientPool {
    cloud: Client,
    webhook: Client,
    default: Client,
    observer: Option<Arc<dyn HttpObserver>>,
}

impl fmt::Debug for HttpClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientPool")
            .field("observed", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpClientPool {
    pub fn new() -> Result<Self> {
        install_rustls_provider();
        Ok(Self {
            cloud: build_client(ServiceCategory::Cloud.settings())?,
            webhook: build_client(ServiceCategory::Webhook.settings())?,
            default: build_client(ServiceCategory::Default.settings())?,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn HttpObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn client(&self, category: ServiceCategory) -> Client {
        match category {
            ServiceCategory::Cloud => self.cloud.clone(),
            ServiceCategory::Webhook => self.webhook.clone(),
            ServiceCategory::Default => self.default.clone(),
        }
    }

    /// A sender for `service_id` that reports to this pool's observer.
    pub fn sender(&self, category: ServiceCategory, service_id: &'static str) -> HttpSender {
        HttpSender {
            client: self.client(category),
            service_id,
            observer: self.observer.clone(),
        }
    }
}

/// Client handle held by an endpoint.
#[derive(Clone)]
pub struct HttpSender {
    client: Client,
    service_id: &'static str,
    observer: Option<Arc<dyn HttpObserver>>,
}

impl HttpSender {
    /// An unobserved sender.
    pub fn new(client: Client, service_id: &'static str) -> Self {
        Self {
            client,
            service_id,
            observer: None,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request` unless `cancel` fires first, reporting the result.
    pub async fn send(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> std::result::Result<Response, DeliveryError> {
        let (client, request) = request.build_split();
        let request = request.map_err(|e| DeliveryError::from_reqwest(&e))?;
        let method = request.method().clone();

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
            result = client.execute(request) => result.map_err(|e| DeliveryError::from_reqwest(&e)),
        };

        if let Some(observer) = &self.observer {
            let status = result.as_ref().map(|r| r.status().as_u16()).unwrap_or(0);
            observer.on_request(self.service_id, method.as_str(), status, started.elapsed());
        }
        result
    }
}
