use crate::admin::{self, AdminState};
use crate::config::{HabitatConfig, read_certificate};
use habitat_core::operations::{
    InitNodeOperation, InitNodeOperationOutcome, InitNodeOperationRequest,
};
use habitat_core::{
    DockerCli, DockerPackageManager, DockerProcessDriver, HabitatError, NodeController,
    NodeSchema, NoopPackageManager, NoopProcessDriver, PackageManagers, ProcessManager,
    Reconciler, Result, WebPackageManager, WebProcessDriver, node_reconciler,
};
use habitat_meta::{DatabaseManager, Publisher, SchemaRegistry};
use habitat_proxy::{EmbeddedFs, ProxyServer, Rule, RuleFactory, RuleSet, proxy_reconciler};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Name under which the built-in frontend is registered for `embedded` rules.
pub const FRONTEND_FS: &str = "frontend";
const FRONTEND_RULE_ID: &str = "frontend";

pub fn frontend_bundle() -> EmbeddedFs {
    EmbeddedFs::new().with_file("index.html", include_bytes!("../assets/index.html"))
}

/// A running node: HDB, reconcilers, proxy rules and the HTTP surfaces.
pub struct Node {
    config: HabitatConfig,
    manager: Arc<DatabaseManager>,
    controller: NodeController,
    reconcilers: Vec<Arc<Reconciler>>,
    processes: Arc<ProcessManager>,
    proxy: ProxyServer,
}

impl Node {
    pub async fn start(config: HabitatConfig) -> Result<Self> {
        for dir in [
            config.hdb_path(),
            config.cert_dir(),
            config.app_path(),
            config.web_bundle_path(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        check_tls(&config).await?;
        if !tokio::fs::try_exists(config.node_cert_path()).await? {
            tracing::warn!("No node certificate at {}", config.node_cert_path().display());
        }

        let mut schemas = SchemaRegistry::new();
        schemas.register(Arc::new(NodeSchema::new()?))?;
        let publisher = Arc::new(Publisher::new());
        let manager = Arc::new(DatabaseManager::new(
            config.hdb_path(),
            schemas,
            publisher.clone(),
            config.hdb.log_config(),
        )?);
        let controller = NodeController::new(
            manager.clone(),
            habitat_core::Waiter::new(publisher.clone()),
        );

        let docker = DockerCli::new(config.docker_binary.clone());
        let packages = PackageManagers::new(vec![
            Arc::new(DockerPackageManager::new(docker.clone())),
            Arc::new(WebPackageManager::new(config.web_bundle_path())),
            Arc::new(NoopPackageManager::default()),
        ]);
        let processes = Arc::new(ProcessManager::new(vec![
            Arc::new(DockerProcessDriver::new(docker)),
            Arc::new(WebProcessDriver),
            Arc::new(NoopProcessDriver::default()),
        ]));

        let rules = Arc::new(RuleSet::new());
        let factory = RuleFactory::new()
            .with_web_bundle_path(config.web_bundle_path())
            .with_embedded(FRONTEND_FS, frontend_bundle());

        let reconcilers = vec![
            node_reconciler(controller.clone(), packages, processes.clone())?,
            proxy_reconciler(rules.clone(), factory)?,
        ];
        for reconciler in &reconcilers {
            publisher.add_subscriber(reconciler.clone());
        }

        let restarted = manager.restart().await?;
        for database in &restarted {
            database.wait_applied(database.committed_index()).await?;
        }
        tracing::info!("Restarted {} databases", restarted.len());

        let root_user_certificate = read_certificate(&config.root_user_cert_path()).await?;
        let outcome = InitNodeOperation::new(controller.clone())
            .run(InitNodeOperationRequest {
                node_id: None,
                name: config.node_name.clone(),
                root_user_certificate,
            })
            .await?;
        let state = match outcome {
            InitNodeOperationOutcome::Initialized(state) => {
                tracing::info!("Initialized new node {}", state.node_id);
                state
            }
            InitNodeOperationOutcome::AlreadyInitialized(state) => state,
        };
        tracing::info!(
            "Node {} ({}) has {} apps and {} processes",
            state.name,
            state.node_id,
            state.app_installations.len(),
            state.processes.len()
        );

        rules
            .set_fallback(FRONTEND_RULE_ID, frontend_rule(&config))
            .await;
        let proxy = ProxyServer::new(rules)?;

        Ok(Self {
            config,
            manager,
            controller,
            reconcilers,
            processes,
            proxy,
        })
    }

    pub fn controller(&self) -> &NodeController {
        &self.controller
    }

    /// Serves the admin API and the reverse proxy until ctrl-c or until
    /// either server fails, then stops the databases.
    pub async fn serve(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut servers = JoinSet::new();

        let admin_state = Arc::new(AdminState {
            controller: self.controller().clone(),
        });
        let admin_addr = self.config.admin_addr;
        let admin_shutdown = shutdown_signal(shutdown_rx.clone());
        servers.spawn(async move { admin::serve(admin_addr, admin_state, admin_shutdown).await });

        let proxy = self.proxy.clone();
        let proxy_addr = self.config.proxy_addr;
        let proxy_shutdown = shutdown_signal(shutdown_rx);
        servers.spawn(async move { proxy.serve(proxy_addr, proxy_shutdown).await });

        let mut result = Ok(());
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Received ctrl-c, shutting down");
            }
            Some(finished) = servers.join_next() => {
                result = flatten(finished);
                tracing::warn!("A server exited early, shutting down");
            }
        }

        shutdown_tx.send_replace(true);
        while let Some(finished) = servers.join_next().await {
            if let Err(e) = flatten(finished) {
                tracing::error!("Server error during shutdown: {}", e);
            }
        }

        self.stop().await?;
        result
    }

    pub async fn stop(&self) -> Result<()> {
        for reconciler in &self.reconcilers {
            reconciler.wait_idle().await;
        }
        self.manager.stop().await?;
        tracing::info!(
            "Node stopped with {} processes still tracked",
            self.processes.list().await.len()
        );
        Ok(())
    }
}

fn frontend_rule(config: &HabitatConfig) -> Rule {
    match &config.frontend_dir {
        Some(dir) => Rule::FileServer {
            matcher: "/".to_string(),
            path: dir.clone(),
        },
        None => Rule::Embedded {
            matcher: "/".to_string(),
            fs: Arc::new(frontend_bundle()),
        },
    }
}

async fn check_tls(config: &HabitatConfig) -> Result<()> {
    if !config.tls_enabled() {
        return Ok(());
    }
    let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Ok(());
    };
    for path in [cert, key] {
        if !tokio::fs::try_exists(path).await? {
            return Err(HabitatError::Config(format!(
                "TLS file {} does not exist",
                path.display()
            )));
        }
    }
    tracing::warn!(
        "TLS certificate configured but termination is not supported; serving plain HTTP"
    );
    Ok(())
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn flatten(finished: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    finished.map_err(|e| HabitatError::Internal(format!("server task failed: {}", e)))?
}
