//! Starts one tunnel engine per forwarding rule and waits for all of them.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::engine::TunnelEngine;
use crate::error::{ErrorScope, ForwardingError};
use crate::events::ColumnWidths;
use crate::signal::ShutdownReceiver;
use crate::ssh::{SshConnector, SshPool};
use crate::state::{ForwardingRegistry, ForwardingState};

/// How one rule's engine ended.
#[derive(Debug)]
pub struct RuleOutcome {
    pub label: String,
    pub result: Result<(), ForwardingError>,
}

pub struct Supervisor {
    engines: Vec<Arc<TunnelEngine>>,
    registry: ForwardingRegistry,
}

impl Supervisor {
    /// Build engines for every rule of every usable server.
    ///
    /// With `check_servers` set, each server is connected to once up front and the
    /// rules of servers that fail are skipped.
    pub async fn prepare(
        config: &Config,
        connector: Arc<dyn SshConnector>,
        check_servers: bool,
    ) -> Self {
        let widths = Arc::new(ColumnWidths::from_config(config));
        let mut engines = Vec::new();
        let mut states = Vec::new();

        for server in &config.ssh_servers {
            if server.forwardings.is_empty() {
                warn!("Ssh server [{}] has no forwardings, skipped", server.addr());
                continue;
            }

            let pool = SshPool::new(Arc::new(server.clone()), connector.clone());
            if check_servers {
                if let Err(e) = pool.check_reachable().await {
                    error!(
                        "Connect to ssh server [{}] failed, skip its {} forwardings, err = {}",
                        server.addr(),
                        server.forwardings.len(),
                        e
                    );
                    continue;
                }
            }

            for rule in &server.forwardings {
                let state = Arc::new(ForwardingState::new(rule, server.addr()));
                engines.push(Arc::new(TunnelEngine::new(
                    rule.clone(),
                    pool.clone(),
                    state.clone(),
                    widths.clone(),
                )));
                states.push(state);
            }
        }

        Self {
            engines,
            registry: ForwardingRegistry::new(states),
        }
    }

    pub fn registry(&self) -> ForwardingRegistry {
        self.registry.clone()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Run every engine concurrently until all of them have ended.
    pub async fn run(self, shutdown: ShutdownReceiver) -> Vec<RuleOutcome> {
        let mut tasks = JoinSet::new();
        for engine in self.engines {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let label = engine.label().to_string();
                let result = engine.run(shutdown).await;
                RuleOutcome { label, result }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    match &outcome.result {
                        Ok(()) => info!("[{}] Forwarding stopped", outcome.label),
                        Err(e) if e.scope() == ErrorScope::Rule => {
                            error!("[{}] Forwarding ended, err = {}", outcome.label, e)
                        }
                        // Narrower errors are handled per connection and should not get here
                        Err(e) => warn!(
                            "[{}] Forwarding ended on a {:?} error, err = {}",
                            outcome.label,
                            e.scope(),
                            e
                        ),
                    }
                    outcomes.push(outcome);
                }
                Err(e) => error!("Forwarding task failed: {}", e),
            }
        }
        outcomes
    }
}
