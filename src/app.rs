//! Application wiring and request dispatch.
//!
//! The [`App`] owns the downstream servers, the upstream clients, the rule
//! matcher and the connect timeout. `run` starts every downstream, reads
//! their request streams and dispatches each request on its own task:
//! classify the target, match it against the rules, pick one upstream at
//! random, dial it under the connect timeout, confirm the tunnel and hand
//! both streams to the relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::config::Config;
use crate::error::{Error, ProxyErrorKind, Result};
use crate::matcher::RuleMatcher;
use crate::proxy::{
    create_proxy_client, create_proxy_server, CheckUser, ProxyClient, ProxyRequest,
    ProxyServer, RequestIds,
};
use crate::relay::relay;
use crate::DEFAULT_CONNECT_TIMEOUT_SECS;

/// The assembled proxy application.
pub struct App {
    downstreams: Vec<(String, Box<dyn ProxyServer>)>,
    state: Arc<Dispatch>,
}

/// Shared state used by every request task.
struct Dispatch {
    upstreams: HashMap<String, Arc<dyn ProxyClient>>,
    upstream_names: Vec<String>,
    matcher: RuleMatcher,
    connect_timeout: Duration,
}

impl App {
    /// Build an app from configuration, without user authentication.
    pub fn new(config: Config) -> Result<Self> {
        App::with_check_user(config, None)
    }

    /// Build an app from configuration. `check_user` backs any downstream
    /// that enables `check_users`.
    pub fn with_check_user(config: Config, check_user: Option<CheckUser>) -> Result<Self> {
        config.validate()?;

        let ids = Arc::new(RequestIds::new());
        let mut downstreams = Vec::new();
        for (name, ds_config) in &config.downstreams {
            let server =
                create_proxy_server(name, ds_config, Arc::clone(&ids), check_user.clone())
                    .map_err(|e| {
                        Error::config(format!("failed to create downstream '{name}': {e}"))
                    })?;
            downstreams.push((name.clone(), server));
        }

        let mut upstreams = HashMap::new();
        let mut upstream_names = Vec::new();
        for (name, up_config) in &config.upstreams {
            let client = create_proxy_client(up_config).map_err(|e| {
                Error::config(format!("failed to create upstream '{name}': {e}"))
            })?;
            upstreams.insert(name.clone(), client);
            upstream_names.push(name.clone());
        }

        let matcher = RuleMatcher::new(&config.rules)?;
        for upstream in &matcher.all_upstreams {
            if !upstreams.contains_key(upstream) {
                return Err(Error::config(format!(
                    "undefined upstream '{upstream}' used in the rule set"
                )));
            }
        }

        let connect_timeout = Duration::from_secs(
            config
                .misc
                .connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
                .max(1),
        );

        Ok(App {
            downstreams,
            state: Arc::new(Dispatch {
                upstreams,
                upstream_names,
                matcher,
                connect_timeout,
            }),
        })
    }

    /// Start every downstream server and process requests until `token`
    /// is cancelled.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut workers = Vec::new();
        for (name, mut server) in self.downstreams.drain(..) {
            // supervise only servers that actually started
            let requests = server.start().await.map_err(|e| {
                tracing::error!("failed to start downstream server {}: {}", name, e);
                e
            })?;

            let state = Arc::clone(&self.state);
            let token = token.clone();
            workers.push(tokio::spawn(async move {
                tracing::info!("downstream server started: {}", name);
                process_requests(state, &name, requests, token).await;
                server.stop();
                tracing::info!("downstream server stopped: {}", name);
            }));
        }

        tracing::info!("portcullis started");
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

async fn process_requests(
    state: Arc<Dispatch>,
    ds_name: &str,
    mut requests: tokio::sync::mpsc::Receiver<Box<dyn ProxyRequest>>,
    token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = token.cancelled() => return,
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let peer_ids = request.peer_identifiers().unwrap_or_else(|e| {
            tracing::warn!("[{}] failed to get peer identifiers: {}", request.id(), e);
            Vec::new()
        });
        tracing::info!(
            "[{}] request accepted on {}: {} -> {} (ids: {:?})",
            request.id(),
            ds_name,
            request.peer_addr(),
            request.target_addr(),
            peer_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()
        );

        let state = Arc::clone(&state);
        let token = token.clone();
        tokio::spawn(process_one_request(state, request, token));
    }
}

async fn process_one_request(
    state: Arc<Dispatch>,
    request: Box<dyn ProxyRequest>,
    token: CancellationToken,
) {
    let req_id = request.id().to_string();
    let target = request.target_addr().clone();

    // match the target against the rule set
    let (rule_name, mut upstreams) = match &target {
        Address::Ipv4(ip, _) => state.matcher.match_ip((*ip).into()),
        Address::Ipv6(ip, _) => state.matcher.match_ip((*ip).into()),
        Address::Domain(name, _) => state.matcher.match_domain(name),
    };

    if rule_name.is_empty() {
        // no rule matched and no default: allow every configured upstream
        upstreams = state.upstream_names.clone();
    } else if upstreams.is_empty() {
        tracing::error!(
            "[{}] request rejected by rule '{}': {}",
            req_id,
            rule_name,
            target
        );
        request.fail(ProxyErrorKind::NotAllowed).await;
        return;
    }

    let selected = &upstreams[rand::thread_rng().gen_range(0..upstreams.len())];
    tracing::debug!(
        "[{}] upstream '{}' selected by rule '{}' for {}",
        req_id,
        selected,
        rule_name,
        target
    );
    let upstream = Arc::clone(
        state
            .upstreams
            .get(selected)
            .expect("validated at construction"),
    );

    // dial under the connect timeout
    let dialed = tokio::time::timeout(state.connect_timeout, upstream.request(&target)).await;
    let (up_conn, bound_addr) = match dialed {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            tracing::error!(
                "[{}] connection to {} via '{}' failed: {}",
                req_id,
                target,
                selected,
                e
            );
            request.fail(e.kind).await;
            return;
        }
        Err(_) => {
            tracing::error!(
                "[{}] connection to {} via '{}' timed out",
                req_id,
                target,
                selected
            );
            request.fail(ProxyErrorKind::ConnectFailed).await;
            return;
        }
    };

    let server_ids = up_conn.peer_identifiers().unwrap_or_default();
    tracing::info!(
        "[{}] connection established to {} via '{}' (bound {}, ids: {:?})",
        req_id,
        target,
        selected,
        bound_addr,
        server_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()
    );

    let down_conn = request.success(bound_addr).await;
    relay(&req_id, down_conn, up_conn, token.child_token()).await;
}
