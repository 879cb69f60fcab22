use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use oastd::catchall::{self, CatchAllState};
use oastd::conf::Conf;
use oastd::dns::{DnsHandler, DnsListener};
use oastd::listener::HttpListener;
use oastd::log::{self, LoggerGuard};
use oastd::storage::{ExpireTask, Storage, StorageConfig};
use oastd::{AppState, api};
use oastd_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use tokio::runtime::{self, Runtime};

pub const SERVICE_NAME: &str = "oastd";

enum ServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct OastdService {
    conf: Arc<Conf>,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl OastdService {
    pub fn load(conf: Conf) -> anyhow::Result<Self> {
        let logger_guard = log::init(conf.log_file.as_deref(), conf.log_directive.as_deref())
            .context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        Ok(OastdService {
            conf: Arc::new(conf),
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // spawn_tasks needs to run in the runtime in order to bind the sockets.
        let tasks = runtime.block_on(spawn_tasks(Arc::clone(&self.conf)))?;

        debug!("Tasks created");

        let mut join_all =
            futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        // The first task resolving with an error takes the whole process
        // down: listeners only return when their accept loop is gone, and the
        // expirer only after exhausting its restart budget.
        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => {
                        error!(error = format!("{error:#}"), "A task failed");
                        std::process::exit(1);
                    }
                    Err(error) => {
                        error!(%error, "Something went very wrong with a task");
                        std::process::exit(1);
                    }
                }

                if rest.is_empty() {
                    break;
                }

                join_all = futures::future::select_all(rest);
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop {SERVICE_NAME}, but it's already stopped");
            }
            ServiceState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping {SERVICE_NAME}");

                shutdown_handle.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn’t terminate at all");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = ServiceState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: oastd_task::Task<Output = anyhow::Result<()>> + 'static,
    {
        debug!(task = T::NAME, "Registering task");
        let child = oastd_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf: Arc<Conf>) -> anyhow::Result<Tasks> {
    let storage = Storage::new(
        StorageConfig {
            ttl: conf.storage.ttl,
            check_interval: conf.storage.check_interval,
            max_restarts: conf.storage.max_restarts,
            max_events: conf.storage.max_events,
            max_events_by_test: conf.storage.max_events_by_test,
            max_dump_size: conf.storage.max_dump_size,
        },
        &conf.storage.hmac_key,
    )
    .context("failed to create storage")?;
    let storage = Arc::new(storage);

    let mut tasks = Tasks::new();

    tasks.register(ExpireTask {
        storage: Arc::clone(&storage),
    });

    // DNS receivers, one task per configured port.
    let dns_handler = Arc::new(DnsHandler::new(&conf.dns_receiver, Arc::clone(&storage))?);
    for port in &conf.dns_receiver.ports {
        let addr = SocketAddr::new(conf.dns_receiver.host, *port);
        let listener = DnsListener::init_and_bind(addr, Arc::clone(&dns_handler))
            .await
            .with_context(|| format!("failed to initialize DNS listener on {addr}"))?;
        tasks.register(listener);
    }

    // Plain catch-all listeners.
    let plain_router = catchall::make_router(CatchAllState {
        storage: Arc::clone(&storage),
        real_ip_header: conf.http_receiver.real_ip_header.clone(),
        tls: false,
    });
    for port in &conf.http_receiver.ports {
        let addr = SocketAddr::new(conf.http_receiver.host, *port);
        let listener = HttpListener::init_and_bind(addr, plain_router.clone(), None)
            .with_context(|| format!("failed to initialize HTTP listener on {addr}"))?;
        tasks.register(listener);
    }

    // TLS catch-all listeners.
    if !conf.http_receiver.tls_ports.is_empty() {
        let tls = conf
            .http_receiver
            .tls
            .as_ref()
            .context("HTTP receiver TLS ports configured without certificate material")?;

        let tls_router = catchall::make_router(CatchAllState {
            storage: Arc::clone(&storage),
            real_ip_header: conf.http_receiver.real_ip_header.clone(),
            tls: true,
        });

        for port in &conf.http_receiver.tls_ports {
            let addr = SocketAddr::new(conf.http_receiver.host, *port);
            let listener =
                HttpListener::init_and_bind(addr, tls_router.clone(), Some(tls.acceptor.clone()))
                    .with_context(|| format!("failed to initialize HTTPS listener on {addr}"))?;
            tasks.register(listener);
        }
    }

    // Events API, TLS only.
    let api_router = api::make_router(AppState {
        storage: Arc::clone(&storage),
        domain: conf.api.domain.clone(),
        status_path: conf.api.status_path.clone(),
    });
    let api_addr = SocketAddr::new(conf.api.host, conf.api.tls_port);
    let api_listener =
        HttpListener::init_and_bind(api_addr, api_router, Some(conf.api.tls.acceptor.clone()))
            .with_context(|| format!("failed to initialize API listener on {api_addr}"))?;
    tasks.register(api_listener);

    if let Some(status_path) = conf.api.status_path.as_deref() {
        info!("Events API status URL is https://{api_addr}{status_path}");
    }

    Ok(tasks)
}
