use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};

use crate::config::HttpServerConfig;
use crate::error::{ConfigError, ServerError};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::router::Router;
use crate::server::{Server, ServerHandle};
use crate::tls::ticket::TicketKeyStore;

/// Per-worker setup hook: installs callbacks, the HTTP/2 handler factory,
/// and anything else that has to live on each reactor.
pub type WorkerSetup = Arc<dyn Fn(&mut Server) + Send + Sync>;

struct Worker {
    handle: ServerHandle,
    thread: JoinHandle<()>,
}

/// N independent single-threaded reactors sharing one port through
/// `SO_REUSEPORT`; the kernel spreads accepted connections across them.
///
/// Shared between workers: the metrics sink, the TLS session-ticket key
/// store (so resumption works regardless of which worker a reconnect
/// lands on), and broadcast config/router updates. Everything else (event
/// loop, connection table, scratch buffers) is worker-private.
pub struct MultiServer {
    workers: Vec<Worker>,
    local_addr: SocketAddr,
}

impl MultiServer {
    pub fn start(config: HttpServerConfig, router: Router) -> Result<MultiServer, ServerError> {
        MultiServer::start_with(config, router, Arc::new(NoopMetrics), Arc::new(|_: &mut Server| {}))
    }

    pub fn start_with(
        config: HttpServerConfig,
        router: Router,
        metrics: Arc<dyn MetricsSink>,
        setup: WorkerSetup,
    ) -> Result<MultiServer, ServerError> {
        config.validate()?;
        let worker_count = config.worker_threads as usize;
        if worker_count > 1 && !config.reuse_port {
            return Err(ConfigError::invalid(
                "reuse_port",
                "multi-worker servers need SO_REUSEPORT",
            )
            .into());
        }

        let ticket_store = Arc::new(TicketKeyStore::new(
            &config
                .tls
                .as_ref()
                .map(|tls| tls.session_tickets.clone())
                .unwrap_or_default(),
        ));

        let mut workers = Vec::with_capacity(worker_count);

        // The first worker may bind port 0; the rest bind whatever it got.
        let first = spawn_worker(
            0,
            config.clone(),
            router.clone(),
            metrics.clone(),
            ticket_store.clone(),
            setup.clone(),
        )?;
        let local_addr = first.1;
        workers.push(first.0);

        let mut worker_config = config;
        worker_config.port = local_addr.port();
        for index in 1..worker_count {
            match spawn_worker(
                index,
                worker_config.clone(),
                router.clone(),
                metrics.clone(),
                ticket_store.clone(),
                setup.clone(),
            ) {
                Ok((worker, _)) => workers.push(worker),
                Err(err) => {
                    // Unwind the workers that already started.
                    for worker in &workers {
                        worker.handle.stop();
                    }
                    for worker in workers {
                        let _ = worker.thread.join();
                    }
                    return Err(err);
                }
            }
        }

        info!("{} worker(s) listening on {}", worker_count, local_addr);
        Ok(MultiServer {
            workers,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker_handles(&self) -> Vec<ServerHandle> {
        self.workers.iter().map(|worker| worker.handle.clone()).collect()
    }

    /// Broadcast a router mutation to every worker (each owns a
    /// copy-on-write router clone).
    pub fn post_router_update(&self, updater: impl Fn(&mut Router) + Send + Sync + 'static) {
        let updater = Arc::new(updater);
        for worker in &self.workers {
            let updater = updater.clone();
            worker.handle.post_router_update(move |router| updater(router));
        }
    }

    /// Broadcast a config mutation to every worker.
    pub fn post_config_update(
        &self,
        updater: impl Fn(&mut HttpServerConfig) + Send + Sync + 'static,
    ) {
        let updater = Arc::new(updater);
        for worker in &self.workers {
            let updater = updater.clone();
            worker.handle.post_config_update(move |config| updater(config));
        }
    }

    pub fn begin_drain(&self, deadline: Option<Duration>) {
        for worker in &self.workers {
            worker.handle.begin_drain(deadline);
        }
    }

    pub fn stop(&self) {
        for worker in &self.workers {
            worker.handle.stop();
        }
    }

    /// Stop every worker and wait for its loop to exit.
    pub fn shutdown(self) {
        self.stop();
        for worker in self.workers {
            if worker.thread.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

fn spawn_worker(
    index: usize,
    config: HttpServerConfig,
    router: Router,
    metrics: Arc<dyn MetricsSink>,
    ticket_store: Arc<TicketKeyStore>,
    setup: WorkerSetup,
) -> Result<(Worker, SocketAddr), ServerError> {
    // The server itself is not Send (its connection table holds
    // thread-local protocol state), so each worker constructs its own
    // instance inside its thread and reports back through a channel.
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(ServerHandle, SocketAddr), ServerError>>();

    let thread = thread::Builder::new()
        .name(format!("aeronet-worker-{}", index))
        .spawn(move || {
            let mut server =
                match Server::with_shared(config, router, metrics, ticket_store, true) {
                    Ok(server) => server,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
            setup(&mut server);
            if ready_tx
                .send(Ok((server.handle(), server.local_addr())))
                .is_err()
            {
                return;
            }
            server.run();
        })
        .map_err(ServerError::Io)?;

    match ready_rx.recv() {
        Ok(Ok((handle, addr))) => Ok((Worker { handle, thread }, addr)),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = thread.join();
            Err(ServerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "worker thread exited before reporting readiness",
            )))
        }
    }
}
