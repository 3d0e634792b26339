// Service graph, built once at startup in dependency order

use crate::auth::{FirebaseIdentityProvider, IdentityProvider, IdentityVerifier};
use crate::clock::Clock;
use crate::config::{Config, StoreBackend, StoreConfig};
use crate::db::{create_pool, run_migrations, PgDocumentStore};
use crate::external::{DescriptionGenerator, OpenAiGenerator, PayPalGateway, PaymentGateway};
use crate::failsafe::{CircuitBreaker, RequestAuthenticator};
use crate::monitor::{SecurityEventLog, SecurityMonitor};
use crate::observability::HealthChecker;
use crate::rate_limit::{DistributedRateLimiter, FraudDetector, TokenReplayGuard};
use crate::redis::{create_client, RedisDocumentStore};
use crate::store::{DocumentStore, GuardedStore, MemoryStore, StoreResult, TtlSweeper};
use crate::users::{AdminService, DohMxResolver, EmailValidator, MxResolver, UserLifecycle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outbound collaborators, swappable for stubs in tests
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub generator: Arc<dyn DescriptionGenerator>,
    pub payments: Arc<dyn PaymentGateway>,
    pub mx_resolver: Option<Arc<dyn MxResolver>>,
}

impl Collaborators {
    /// Production clients built from configuration
    pub fn from_config(config: &Config) -> Self {
        let mx_resolver: Option<Arc<dyn MxResolver>> = if config.email.mx_lookup_enabled {
            Some(Arc::new(DohMxResolver::new(&config.email)))
        } else {
            None
        };
        Self {
            identity: Arc::new(FirebaseIdentityProvider::new(config.identity.clone())),
            generator: Arc::new(OpenAiGenerator::new(config.llm.clone())),
            payments: Arc::new(PayPalGateway::new(
                config.payment.clone(),
                config.security.site_url.clone(),
            )),
            mx_resolver,
        }
    }
}

/// Open the configured backend. PostgreSQL migrations run here.
pub async fn open_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<Arc<dyn DocumentStore>> {
    match config.backend {
        StoreBackend::Postgres => {
            let pool = create_pool(config).await?;
            run_migrations(&pool).await?;
            tracing::info!("PostgreSQL document store ready");
            Ok(Arc::new(PgDocumentStore::new(pool, clock)))
        }
        StoreBackend::Redis => {
            let manager = create_client(config).await?;
            tracing::info!("Redis document store ready");
            Ok(Arc::new(RedisDocumentStore::new(
                manager,
                clock,
                config.redis_key_prefix.clone(),
            )))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory document store; state is lost on restart");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
    }
}

fn backend_name(backend: StoreBackend) -> &'static str {
    match backend {
        StoreBackend::Postgres => "postgres",
        StoreBackend::Redis => "redis",
        StoreBackend::Memory => "memory",
    }
}

pub struct Components {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    /// Guarded store: timeouts plus circuit breaker over the backend
    pub store: Arc<dyn DocumentStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<DistributedRateLimiter>,
    pub monitor: Arc<SecurityMonitor>,
    pub authenticator: Arc<RequestAuthenticator>,
    pub lifecycle: Arc<UserLifecycle>,
    pub admin: Arc<AdminService>,
    pub generator: Arc<dyn DescriptionGenerator>,
    pub payments: Arc<dyn PaymentGateway>,
    pub health: Arc<HealthChecker>,
}

impl Components {
    /// Wire every component over `backend`. The returned handle is the
    /// security event log's batching task.
    pub fn build(
        config: Config,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn DocumentStore>,
        collaborators: Collaborators,
    ) -> (Self, JoinHandle<()>) {
        let config = Arc::new(config);
        let secret = config.rate_limit.secret.clone();
        let retries = config.rate_limit.max_transaction_retries;

        let breaker = Arc::new(CircuitBreaker::new(
            clock.clone(),
            config.failsafe.circuit_failure_threshold,
            config.failsafe.circuit_open_ms,
        ));
        let store: Arc<dyn DocumentStore> = Arc::new(GuardedStore::new(
            backend,
            breaker.clone(),
            config.store.operation_timeout(),
        ));

        let fraud = Arc::new(FraudDetector::new(
            store.clone(),
            clock.clone(),
            secret.clone(),
            config.rate_limit.fraud.clone(),
            retries,
        ));
        let limiter = Arc::new(DistributedRateLimiter::new(
            store.clone(),
            clock.clone(),
            &config.rate_limit,
            fraud,
        ));
        let replay = Arc::new(TokenReplayGuard::new(
            store.clone(),
            clock.clone(),
            secret.clone(),
            config.rate_limit.replay_window_seconds,
            config.rate_limit.max_token_usage,
            retries,
        ));
        let verifier = Arc::new(IdentityVerifier::new(
            collaborators.identity,
            replay,
            clock.clone(),
            config.identity.clone(),
        ));

        let (event_log, event_task) = SecurityEventLog::new(store.clone(), config.monitor.event_log.clone());
        let monitor = Arc::new(SecurityMonitor::new(
            store.clone(),
            clock.clone(),
            secret,
            config.monitor.clone(),
            retries,
            event_log,
        ));

        let authenticator = Arc::new(RequestAuthenticator::new(
            store.clone(),
            breaker.clone(),
            limiter.clone(),
            verifier,
            monitor.clone(),
            clock.clone(),
            config.security.clone(),
            config.failsafe.clone(),
            config.payment.webhook_secret.clone(),
            config.store.probe_timeout(),
        ));

        let lifecycle = Arc::new(UserLifecycle::new(store.clone(), clock.clone(), retries));
        let emails = Arc::new(EmailValidator::new(&config.email, collaborators.mx_resolver));
        let admin = Arc::new(AdminService::new(
            store.clone(),
            clock.clone(),
            lifecycle.clone(),
            emails,
            retries,
        ));

        let health = Arc::new(HealthChecker::new(
            store.clone(),
            breaker.clone(),
            backend_name(config.store.backend),
            config.store.probe_timeout(),
        ));

        let components = Self {
            config,
            clock,
            store,
            breaker,
            limiter,
            monitor,
            authenticator,
            lifecycle,
            admin,
            generator: collaborators.generator,
            payments: collaborators.payments,
            health,
        };
        (components, event_task)
    }

    pub fn sweeper(&self) -> TtlSweeper {
        TtlSweeper::new(
            self.store.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.store.ttl_sweep_interval_seconds),
        )
    }
}
