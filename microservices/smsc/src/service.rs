//! Assembly of the gateway and its lifecycle

use async_trait::async_trait;
use parking_lot::Mutex;
use smsc_core::{
    GatewayService, HealthStatus, Message, OperatorRecord, ReadinessStatus, Result, RoutingRule,
    SmscError,
};
use smsc_sigtran::SigtranStack;
use smsc_store::{MemoryRepository, PgRepository, Repository, StorePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::admin::{self, Admin, SERVICE_ID};
use crate::config::SmscConfig;
use crate::dispatcher::{Dispatcher, TransportFactory};
use crate::gateway::{self, Gateway};
use crate::queue::{DeliveryQueue, FanoutSink, PersistingSink, StatusSink};
use crate::registry::OperatorRegistry;
use crate::routing::Router;
use crate::smpp::client::ClientReceipt;
use crate::smpp::server::SessionContext;
use crate::smpp::{SessionRegistry, SmppServer};

const RELAY_DEPTH: usize = 1024;

pub struct SmscService {
    config: SmscConfig,
    registry: Arc<OperatorRegistry>,
    dispatcher: Arc<Dispatcher>,
    transports: Arc<TransportFactory>,
    queue: DeliveryQueue,
    gateway: Arc<Gateway>,
    smpp: Arc<SmppServer>,
    sigtran: Option<Arc<SigtranStack>>,
    admin: Arc<Admin>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    receipts_rx: Mutex<Option<mpsc::Receiver<ClientReceipt>>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Definitions from storage replace configured ones with the same key
fn merge<T, K: std::hash::Hash + Eq>(configured: Vec<T>, stored: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut merged: Vec<T> = Vec::with_capacity(configured.len() + stored.len());
    let mut positions: HashMap<K, usize> = HashMap::new();
    for item in configured.into_iter().chain(stored) {
        match positions.get(&key(&item)) {
            Some(&at) => merged[at] = item,
            None => {
                positions.insert(key(&item), merged.len());
                merged.push(item);
            }
        }
    }
    merged
}

impl SmscService {
    pub async fn build(config: SmscConfig) -> Result<Self> {
        let repository: Arc<dyn Repository> = if config.database.enabled {
            let pool = StorePool::new(&config.database.pool_config())?;
            let repository = PgRepository::new(pool);
            repository.init_schema().await?;
            Arc::new(repository)
        } else {
            info!("Database disabled, using in-memory store");
            Arc::new(MemoryRepository::new())
        };

        let operators: Vec<OperatorRecord> = merge(
            config.routing.operators.clone(),
            repository.load_operators().await?,
            |op| op.id.clone(),
        );
        let rules: Vec<RoutingRule> = merge(
            config.routing.rules.clone(),
            repository.load_rules().await?,
            |rule| rule.id.clone(),
        );
        info!(operators = operators.len(), rules = rules.len(), "Routing table loaded");

        let registry = Arc::new(OperatorRegistry::with_operators(
            config.default_tps(),
            operators,
        )?);
        let default_route = config.routing.default_route();
        let router = Arc::new(Router::with_rules(
            registry.clone(),
            rules,
            default_route.as_ref(),
        )?);
        if !router.snapshot().has_wildcard() {
            warn!("No wildcard rule, unmatched destinations will be rejected");
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(RELAY_DEPTH);
        let sigtran = if config.sigtran.enabled {
            Some(Arc::new(SigtranStack::new(config.sigtran.clone(), inbound_tx)?))
        } else {
            None
        };

        let (receipts_tx, receipts_rx) = mpsc::channel(RELAY_DEPTH);
        let dispatcher = Arc::new(Dispatcher::new());
        let transports = Arc::new(TransportFactory::new(
            sigtran.clone(),
            config.client.clone(),
            receipts_tx,
        ));

        let sessions = Arc::new(SessionRegistry::new());
        let sinks: Vec<Arc<dyn StatusSink>> = vec![
            Arc::new(PersistingSink::new(repository.clone())),
            sessions.clone(),
        ];
        let queue = DeliveryQueue::new(
            config.delivery_config(),
            registry.clone(),
            dispatcher.clone(),
            Arc::new(FanoutSink::new(sinks)),
        );
        let gateway = Arc::new(Gateway::new(router.clone(), queue.clone()));

        let context = SessionContext {
            config: Arc::new(config.smpp.session_config()),
            credentials: Arc::new(config.smpp.credentials.clone()),
            submitter: gateway.clone(),
            registry: sessions,
            max_pdu_size: config.smpp.max_pdu_size,
        };
        let smpp = Arc::new(SmppServer::new(context, config.smpp.max_connections));

        let mut admin = Admin::new(
            registry.clone(),
            router,
            gateway.clone(),
            dispatcher.clone(),
            transports.clone(),
            repository,
        )
        .with_smpp(smpp.clone());
        if let Some(stack) = &sigtran {
            admin = admin.with_sigtran(stack.clone());
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            registry,
            dispatcher,
            transports,
            queue,
            gateway,
            smpp,
            sigtran,
            admin: Arc::new(admin),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            receipts_rx: Mutex::new(Some(receipts_rx)),
            tasks: Mutex::new(JoinSet::new()),
            shutdown_tx,
        })
    }

    pub fn admin(&self) -> Arc<Admin> {
        self.admin.clone()
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    fn spawn_relays(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(inbound) = self.inbound_rx.lock().take() {
            tasks.spawn(gateway::run_mobile_originated(
                self.gateway.clone(),
                inbound,
                self.shutdown_tx.subscribe(),
            ));
        }
        if let Some(receipts) = self.receipts_rx.lock().take() {
            tasks.spawn(gateway::run_receipts(
                self.queue.clone(),
                receipts,
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    async fn serve_http(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if !self.config.http.enabled {
            let _ = shutdown.wait_for(|stop| *stop).await;
            return Ok(());
        }
        let listener = TcpListener::bind(&self.config.http.bind_address).await?;
        info!(address = %listener.local_addr()?, "Admin HTTP listening");
        axum::serve(listener, admin::routes(self.admin.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| SmscError::Network(e.to_string()))
    }
}

#[async_trait]
impl GatewayService for SmscService {
    fn service_id(&self) -> &'static str {
        SERVICE_ID
    }

    async fn health(&self) -> HealthStatus {
        self.admin.health()
    }

    async fn ready(&self) -> ReadinessStatus {
        self.admin.ready().await
    }

    async fn start(&self) -> Result<()> {
        for operator in self.registry.list() {
            self.transports.rebind(&self.dispatcher, &operator).await;
        }
        if let Some(stack) = &self.sigtran {
            stack.start().await?;
        }
        let address = self.smpp.start(&self.config.smpp.bind_address()).await?;
        info!(
            smpp = %address,
            http = %self.config.http.bind_address,
            operators = self.registry.len(),
            "SMSC started"
        );
        self.spawn_relays();
        self.serve_http().await
    }

    async fn stop_accepting(&self) {
        self.smpp.stop_accepting();
        if let Some(stack) = &self.sigtran {
            stack.stop_accepting();
        }
    }

    /// Sessions unbind first so nothing new arrives, then the queue drains,
    /// then transports close. All steps share one `grace` budget.
    async fn shutdown(&self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let _ = self.shutdown_tx.send(true);
        self.smpp.shutdown(remaining()).await;
        self.queue.shutdown(remaining()).await;
        self.dispatcher.close_all().await;
        if let Some(stack) = &self.sigtran {
            stack.shutdown(remaining()).await;
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tokio::time::timeout(remaining(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tasks.shutdown().await;
        }
        info!("SMSC stopped");
        Ok(())
    }
}
