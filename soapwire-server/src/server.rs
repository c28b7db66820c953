//! The server: listening endpoint, admission control, suspend/resume and
//! the runtime knobs.
//!
//! The listener runs on its own thread with a current-thread runtime. Its
//! accept loop multiplexes the listening socket with a control channel, so
//! suspend/resume serialize with accepts: after `suspend()` returns no new
//! connection is admitted, and `resume()` rebinds the very same port.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::logging::{LogLevel, ServerLogger};
use crate::object::ServerObjectFactory;
use crate::pool::SoapThreadPool;
use crate::socket::handle_connection;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resume failed: port {port} is no longer available")]
    ResumeBind { port: u16 },

    #[error("server is not listening")]
    NotListening,

    #[error("server is already listening")]
    AlreadyListening,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Startup configuration. Runtime-tunable knobs (max connections, log
/// level, WSDL mapping) have setters on `Server` as well.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    /// The path SOAP POSTs must target.
    pub path: String,
    /// Live-connection ceiling; 0 means unlimited.
    pub max_connections: usize,
    /// Per-request handler deadline.
    pub request_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            path: "/".to_string(),
            max_connections: 0,
            request_timeout: None,
        }
    }
}

/// Settings the socket handler snapshots per request.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub path: String,
    pub wsdl: Option<(PathBuf, String)>,
    pub request_timeout: Option<Duration>,
}

/// State shared between the server handle, the listener loop and every
/// connection task.
pub(crate) struct SharedState {
    pub(crate) factory: Arc<dyn ServerObjectFactory>,
    pub(crate) logger: Arc<ServerLogger>,
    settings: RwLock<RuntimeSettings>,
    pub(crate) max_connections: AtomicUsize,
    pub(crate) live_connections: AtomicUsize,
    pub(crate) total_connections: AtomicUsize,
    /// Read by the accept loop and by kept-alive connections: a suspended
    /// server answers no new request, wherever it arrives.
    pub(crate) suspended: AtomicBool,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<tokio_rustls::TlsAcceptor>,
}

impl SharedState {
    pub(crate) fn settings_snapshot(&self) -> RuntimeSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

enum ControlMsg {
    Suspend(oneshot::Sender<u16>),
    Resume(oneshot::Sender<Result<(), ServerError>>),
    Stop(oneshot::Sender<()>),
}

struct Inner {
    config: ServerConfig,
    pool: Option<Arc<SoapThreadPool>>,
    control: Option<mpsc::UnboundedSender<ControlMsg>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// A SOAP server. Create it with a factory, tune it, call `listen()`.
pub struct Server {
    shared: Arc<SharedState>,
    inner: Mutex<Inner>,
    port: AtomicU16,
}

impl Server {
    /// A TLS server: accepted sockets go through the handshake before the
    /// socket handler sees them.
    #[cfg(feature = "tls")]
    pub fn new_with_tls(
        config: ServerConfig,
        factory: impl ServerObjectFactory + 'static,
        tls_config: Arc<tokio_rustls::rustls::ServerConfig>,
    ) -> Self {
        Self::build(
            config,
            factory,
            Some(tokio_rustls::TlsAcceptor::from(tls_config)),
        )
    }

    pub fn new(config: ServerConfig, factory: impl ServerObjectFactory + 'static) -> Self {
        Self::build(
            config,
            factory,
            #[cfg(feature = "tls")]
            None,
        )
    }

    fn build(
        config: ServerConfig,
        factory: impl ServerObjectFactory + 'static,
        #[cfg(feature = "tls")] tls: Option<tokio_rustls::TlsAcceptor>,
    ) -> Self {
        let settings = RuntimeSettings {
            path: config.path.clone(),
            wsdl: None,
            request_timeout: config.request_timeout,
        };
        let shared = Arc::new(SharedState {
            factory: Arc::new(factory),
            logger: Arc::new(ServerLogger::new()),
            settings: RwLock::new(settings),
            max_connections: AtomicUsize::new(config.max_connections),
            live_connections: AtomicUsize::new(0),
            total_connections: AtomicUsize::new(0),
            suspended: AtomicBool::new(false),
            #[cfg(feature = "tls")]
            tls,
        });
        Server {
            shared,
            inner: Mutex::new(Inner {
                config,
                pool: None,
                control: None,
                thread: None,
            }),
            port: AtomicU16::new(0),
        }
    }

    /// Handle connections on a worker pool instead of the listener thread.
    /// Must be called before `listen()`.
    pub fn set_thread_pool(&self, pool: Arc<SoapThreadPool>) {
        self.lock_inner().pool = Some(pool);
    }

    /// Live-connection ceiling, effective immediately. 0 means unlimited.
    pub fn set_max_connections(&self, max: usize) {
        self.shared.max_connections.store(max, Ordering::SeqCst);
    }

    pub fn set_request_timeout(&self, timeout: Option<Duration>) {
        self.write_settings(|s| s.request_timeout = timeout);
    }

    /// Publish a WSDL file: GET requests for `url_path` stream `disk_path`.
    pub fn set_wsdl_file(&self, disk_path: impl Into<PathBuf>, url_path: &str) {
        let mapping = (disk_path.into(), url_path.to_owned());
        self.write_settings(|s| s.wsdl = Some(mapping));
    }

    pub fn set_log_file_name(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        self.shared.logger.set_file(path)
    }

    pub fn log_file_name(&self) -> Option<PathBuf> {
        self.shared.logger.file_name()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.logger.set_level(level);
    }

    pub fn log_level(&self) -> LogLevel {
        self.shared.logger.level()
    }

    pub fn flush_log_file(&self) {
        self.shared.logger.flush();
    }

    /// Raise the process file-descriptor limit to accommodate `count`
    /// sockets. Returns whether the limit now suffices.
    pub fn set_expected_socket_count(count: usize) -> bool {
        #[cfg(unix)]
        unsafe {
            let mut limit = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
                return false;
            }
            if limit.rlim_cur as usize >= count {
                return true;
            }
            limit.rlim_cur = (count as libc::rlim_t).min(limit.rlim_max);
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
                return false;
            }
            limit.rlim_cur as usize >= count
        }
        #[cfg(not(unix))]
        {
            let _ = count;
            true
        }
    }

    /// Bind and start accepting. Spawns the listener thread.
    pub fn listen(&self) -> Result<(), ServerError> {
        let mut inner = self.lock_inner();
        if inner.control.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let addr = format!("{}:{}", inner.config.host, inner.config.port);
        let listener = std::net::TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        self.port.store(port, Ordering::SeqCst);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let pool = inner.pool.clone();
        let host = inner.config.host.clone();
        let thread = std::thread::Builder::new()
            .name("soap-listener".to_string())
            .spawn(move || listener_main(listener, control_rx, shared, pool, host))?;

        inner.control = Some(control_tx);
        inner.thread = Some(thread);
        debug!("listening on port {port}");
        Ok(())
    }

    /// `http://host:port<path>`, or `None` while suspended / not listening.
    pub fn endpoint(&self) -> Option<String> {
        if self.shared.suspended.load(Ordering::SeqCst) {
            return None;
        }
        let port = self.port.load(Ordering::SeqCst);
        if port == 0 {
            return None;
        }
        let inner = self.lock_inner();
        if inner.control.is_none() {
            return None;
        }
        let scheme = if cfg!(feature = "tls") && self.has_tls() {
            "https"
        } else {
            "http"
        };
        let path = self.shared.settings_snapshot().path;
        Some(format!("{scheme}://{}:{port}{path}", inner.config.host))
    }

    fn has_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.shared.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// The bound port. Survives suspend so `resume()` can verify symmetry.
    pub fn server_port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Connections currently alive.
    pub fn connection_count(&self) -> usize {
        self.shared.live_connections.load(Ordering::SeqCst)
    }

    /// Connections admitted since startup.
    pub fn total_connection_count(&self) -> usize {
        self.shared.total_connections.load(Ordering::SeqCst)
    }

    pub fn reset_total_connection_count(&self) {
        self.shared.total_connections.store(0, Ordering::SeqCst);
    }

    /// Stop accepting without touching live connections. The port is
    /// remembered for `resume()`.
    pub fn suspend(&self) -> Result<(), ServerError> {
        let control = self.control_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        control
            .send(ControlMsg::Suspend(reply_tx))
            .map_err(|_| ServerError::NotListening)?;
        let port = reply_rx.blocking_recv().map_err(|_| ServerError::NotListening)?;
        self.port.store(port, Ordering::SeqCst);
        Ok(())
    }

    /// Reopen the listener on the pre-suspend port. Calling without a
    /// preceding `suspend()` warns and does nothing.
    pub fn resume(&self) -> Result<(), ServerError> {
        if !self.shared.suspended.load(Ordering::SeqCst) {
            warn!("resume() called without calling suspend() first");
            return Ok(());
        }
        let control = self.control_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        control
            .send(ControlMsg::Resume(reply_tx))
            .map_err(|_| ServerError::NotListening)?;
        reply_rx.blocking_recv().map_err(|_| ServerError::NotListening)?
    }

    /// Stop the listener and join its thread. Live connections drain on
    /// their worker threads; the pool applies its own grace period.
    pub fn stop(&self) {
        let (control, thread) = {
            let mut inner = self.lock_inner();
            (inner.control.take(), inner.thread.take())
        };
        if let Some(control) = control {
            let (reply_tx, reply_rx) = oneshot::channel();
            if control.send(ControlMsg::Stop(reply_tx)).is_ok() {
                let _ = reply_rx.blocking_recv();
            }
        }
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("listener thread panicked");
            }
        }
        self.shared.suspended.store(false, Ordering::SeqCst);
        self.port.store(0, Ordering::SeqCst);
    }

    fn control_sender(&self) -> Result<mpsc::UnboundedSender<ControlMsg>, ServerError> {
        self.lock_inner()
            .control
            .clone()
            .ok_or(ServerError::NotListening)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_settings(&self, f: impl FnOnce(&mut RuntimeSettings)) {
        let mut settings = self
            .shared
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut settings);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LiveGuard(Arc<SharedState>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

fn listener_main(
    listener: std::net::TcpListener,
    mut control: mpsc::UnboundedReceiver<ControlMsg>,
    shared: Arc<SharedState>,
    pool: Option<Arc<SoapThreadPool>>,
    host: String,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to build listener runtime: {e}");
            return;
        }
    };

    runtime.block_on(async move {
        let mut active = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => Some(l),
            Err(e) => {
                error!("failed to register listener: {e}");
                None
            }
        };
        let mut saved_port = active
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(0);

        loop {
            let msg = if let Some(listener) = &active {
                tokio::select! {
                    msg = control.recv() => msg,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _peer)) => admit(stream, &shared, pool.as_ref()),
                            Err(e) => warn!("accept failed: {e}"),
                        }
                        continue;
                    }
                }
            } else {
                control.recv().await
            };

            match msg {
                Some(ControlMsg::Suspend(reply)) => {
                    if let Some(listener) = active.take() {
                        if let Ok(addr) = listener.local_addr() {
                            saved_port = addr.port();
                        }
                    }
                    shared.suspended.store(true, Ordering::SeqCst);
                    debug!("suspended, port {saved_port} saved");
                    let _ = reply.send(saved_port);
                }
                Some(ControlMsg::Resume(reply)) => {
                    let result = rebind(&host, saved_port);
                    match result {
                        Ok(listener) => {
                            active = Some(listener);
                            shared.suspended.store(false, Ordering::SeqCst);
                            debug!("resumed on port {saved_port}");
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            warn!("resume failed on port {saved_port}: {e}");
                            let _ = reply.send(Err(ServerError::ResumeBind { port: saved_port }));
                        }
                    }
                }
                Some(ControlMsg::Stop(reply)) => {
                    let _ = reply.send(());
                    break;
                }
                None => break,
            }
        }
    });
}

/// Rebind with `SO_REUSEADDR`: connections accepted before the suspend may
/// still sit in TIME_WAIT on this port, but a live listener elsewhere must
/// still make the bind fail.
fn rebind(host: &str, port: u16) -> std::io::Result<tokio::net::TcpListener> {
    let addr: std::net::SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Admission control, then hand-off to the pool or the listener's own
/// runtime. Runs inside the listener loop, so it must not block.
fn admit(
    stream: tokio::net::TcpStream,
    shared: &Arc<SharedState>,
    pool: Option<&Arc<SoapThreadPool>>,
) {
    let max = shared.max_connections.load(Ordering::SeqCst);
    if max > 0 && shared.live_connections.load(Ordering::SeqCst) >= max {
        shared.logger.log_error(&format!(
            "Too many connections ({max}), incoming connection rejected"
        ));
        warn!("Too many connections ({max}), incoming connection rejected");
        return;
    }
    shared.live_connections.fetch_add(1, Ordering::SeqCst);
    shared.total_connections.fetch_add(1, Ordering::SeqCst);
    let live_guard = LiveGuard(shared.clone());

    match pool {
        Some(pool) => {
            let std_stream = match stream.into_std() {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to detach socket for pool dispatch: {e}");
                    drop(live_guard);
                    return;
                }
            };
            let shared = shared.clone();
            pool.dispatch(move |active_guard| {
                match tokio::net::TcpStream::from_std(std_stream) {
                    Ok(stream) => {
                        tokio::spawn(async move {
                            let _active = active_guard;
                            let _live = live_guard;
                            serve_stream(stream, shared).await;
                        });
                    }
                    Err(e) => error!("failed to register socket on worker: {e}"),
                }
            });
        }
        None => {
            let shared = shared.clone();
            tokio::spawn(async move {
                let _live = live_guard;
                serve_stream(stream, shared).await;
            });
        }
    }
}

async fn serve_stream(stream: tokio::net::TcpStream, shared: Arc<SharedState>) {
    #[cfg(feature = "tls")]
    if let Some(acceptor) = shared.tls.clone() {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => return handle_connection(tls_stream, shared).await,
            Err(e) => {
                error!("TLS handshake failed: {e}");
                return;
            }
        }
    }
    handle_connection(stream, shared).await
}
