use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use foldhash::fast::RandomState;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{BoxedReader, BoxedWriter, CodecType, FrameReader, FrameWriter, Header};
use crate::error::{Error, ErrorKind, Result};
use crate::option::{MAGIC_NUMBER, Options};
use crate::service::{Method, Service};

/// Accepts connections and multiplexes many in-flight requests per
/// connection, dispatching each to a registered [`Service`] method.
pub struct Server {
    services: DashMap<String, Arc<Service>, RandomState>,
    stop_token: CancellationToken,
    connections: TaskTracker,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::default(),
            stop_token: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Publishes a service. Services are immutable once registered.
    ///
    /// # Errors
    ///
    /// Re-registering an already published name fails.
    pub fn register(&self, service: Service) -> Result<()> {
        match self.services.entry(service.name().to_string()) {
            Entry::Occupied(_) => Err(Error::new(
                ErrorKind::DuplicateService,
                format!("rpc: service already defined: {}", service.name()),
            )),
            Entry::Vacant(entry) => {
                for method in service.method_names() {
                    tracing::info!("rpc server: register {}.{}", service.name(), method);
                }
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    fn find_method(&self, service_method: &str) -> Result<Arc<Method>> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(Error::new(
                ErrorKind::InvalidServiceMethod,
                format!("rpc server: service/method request ill-formed: {service_method}"),
            ));
        };
        let Some(service) = self.services.get(service_name).map(|s| s.value().clone()) else {
            return Err(Error::new(
                ErrorKind::ServiceNotFound,
                format!("rpc server: can't find service {service_name}"),
            ));
        };
        match service.method(method_name) {
            Some(method) => Ok(method.clone()),
            None => Err(Error::new(
                ErrorKind::MethodNotFound,
                format!("rpc server: can't find method {method_name}"),
            )),
        }
    }

    /// Binds `addr` and accepts connections until [`Server::stop`].
    ///
    /// Returns the bound address, so callers may listen on port 0.
    ///
    /// # Errors
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;

        let server = self.clone();
        let stop_token = self.stop_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop_token.cancelled() => {
                    tracing::info!("stop accept loop");
                }
                () = async {
                    tracing::info!("start listening: {listener_addr}");
                    server.accept(listener).await;
                } => {}
            }
        });

        Ok(listener_addr)
    }

    /// Accepts every incoming connection and serves it in its own task.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    let stop_token = self.stop_token.clone();
                    self.connections.spawn(async move {
                        tokio::select! {
                            () = stop_token.cancelled() => {}
                            () = server.serve_conn(stream) => {}
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("rpc server: accept error: {e}");
                    return;
                }
            }
        }
    }

    /// Accepts connections on a Unix listener, for the `unix@` scheme.
    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: tokio::net::UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    let stop_token = self.stop_token.clone();
                    self.connections.spawn(async move {
                        tokio::select! {
                            () = stop_token.cancelled() => {}
                            () = server.serve_conn(stream) => {}
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("rpc server: accept error: {e}");
                    return;
                }
            }
        }
    }

    /// Runs the per-connection protocol on any bidirectional stream.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        self.serve_split(Box::new(read), Box::new(write)).await;
    }

    pub(crate) async fn serve_split(self: Arc<Self>, read: BoxedReader, write: BoxedWriter) {
        if let Err(e) = self.serve_inner(read, write).await {
            // handshake failures close the connection without a response
            tracing::error!("rpc server: {e}");
        }
    }

    async fn serve_inner(self: &Arc<Self>, read: BoxedReader, write: BoxedWriter) -> Result<()> {
        let mut read = BufReader::new(read);
        let mut line = String::new();
        read.read_line(&mut line)
            .await
            .map_err(|e| Error::new(ErrorKind::RecvFailed, format!("options error: {e}")))?;
        let opt: Options = serde_json::from_str(&line)
            .map_err(|e| Error::new(ErrorKind::DeserializeFailed, format!("options error: {e}")))?;
        if opt.magic_number != MAGIC_NUMBER {
            return Err(Error::new(
                ErrorKind::InvalidMagic,
                format!("invalid magic number {:#x}", opt.magic_number),
            ));
        }

        self.serve_codec(
            FrameReader::new(read, opt.codec_type),
            FrameWriter::new(write, opt.codec_type),
            &opt,
        )
        .await;
        Ok(())
    }

    async fn serve_codec(
        self: &Arc<Self>,
        mut reader: FrameReader,
        writer: FrameWriter,
        opt: &Options,
    ) {
        let writer = Arc::new(Mutex::new(writer));
        let handlers = TaskTracker::new();

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    if e.kind != ErrorKind::Eof {
                        tracing::error!("rpc server: read header error: {e}");
                    }
                    break;
                }
            };
            match self.find_method(&header.service_method) {
                Ok(method) => {
                    let body = match reader.read_body().await {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::error!("rpc server: read body error: {e}");
                            break;
                        }
                    };
                    let writer = writer.clone();
                    let kind = opt.codec_type;
                    let handle_timeout = opt.handle_timeout;
                    handlers.spawn(async move {
                        Self::handle_request(method, kind, body, header, &writer, handle_timeout)
                            .await;
                    });
                }
                Err(e) => {
                    // the body segment must still be consumed to keep the stream in sync
                    if let Err(e) = reader.read_body().await {
                        tracing::error!("rpc server: read body error: {e}");
                        break;
                    }
                    Self::send_error_response(&writer, header, &e).await;
                }
            }
        }

        // new requests are no longer accepted; drain the in-flight handlers
        handlers.close();
        handlers.wait().await;
    }

    /// Runs one invocation and writes exactly one response frame.
    ///
    /// The invocation gets its own task, so a timed-out method may keep
    /// running, but its late result is discarded rather than written.
    async fn handle_request(
        method: Arc<Method>,
        kind: CodecType,
        body: bytes::Bytes,
        mut header: Header,
        writer: &Mutex<FrameWriter>,
        handle_timeout: Duration,
    ) {
        let invocation = tokio::spawn(method.invoke(kind, body));
        let result = if handle_timeout.is_zero() {
            match invocation.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("rpc server: handler aborted: {e}");
                    return;
                }
            }
        } else {
            match tokio::time::timeout(handle_timeout, invocation).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    tracing::error!("rpc server: handler aborted: {e}");
                    return;
                }
                Err(_) => Err(Error::new(
                    ErrorKind::HandleTimeout,
                    format!(
                        "rpc server: request handle timeout: except within {}",
                        humantime::format_duration(handle_timeout)
                    ),
                )),
            }
        };

        match result {
            Ok(reply) => {
                header.error.clear();
                let mut writer = writer.lock().await;
                if let Err(e) = writer.write_reply_frame(&header, &reply).await {
                    tracing::error!("rpc server: write response error: {e}");
                }
            }
            Err(e) => Self::send_error_response(writer, header, &e).await,
        }
    }

    async fn send_error_response(writer: &Mutex<FrameWriter>, mut header: Header, err: &Error) {
        header.error = err.to_string();
        let mut writer = writer.lock().await;
        if let Err(e) = writer.write_error_frame(&header).await {
            tracing::error!("rpc server: write response error: {e}");
        }
    }

    /// Stops the accept loops and tears down active connections.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    /// Waits until every connection task has finished.
    pub async fn join(&self) {
        self.connections.close();
        self.connections.wait().await;
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    pub(crate) fn connections(&self) -> &TaskTracker {
        &self.connections
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish()
    }
}

static DEFAULT_SERVER: LazyLock<Arc<Server>> = LazyLock::new(|| Arc::new(Server::new()));

/// The process-wide server used by the free [`register`] and [`accept`].
#[must_use]
pub fn default_server() -> Arc<Server> {
    DEFAULT_SERVER.clone()
}

/// Registers `service` on the default server.
///
/// # Errors
pub fn register(service: Service) -> Result<()> {
    DEFAULT_SERVER.register(service)
}

/// Accepts connections on the default server.
pub async fn accept(listener: TcpListener) {
    default_server().accept(listener).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        num1: i64,
        num2: i64,
    }

    fn sum_service(name: &str) -> Service {
        let mut service = Service::new(name).unwrap();
        service
            .register_method("Sum", |args: SumArgs| async move {
                Ok(args.num1 + args.num2)
            })
            .unwrap();
        service
    }

    #[test]
    fn test_duplicate_service() {
        let server = Server::new();
        server.register(sum_service("Foo")).unwrap();
        let err = server.register(sum_service("Foo")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateService);
    }

    #[test]
    fn test_find_method() {
        let server = Server::new();
        server.register(sum_service("Foo")).unwrap();

        server.find_method("Foo.Sum").unwrap();

        let err = server.find_method("FooSum").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidServiceMethod);
        assert!(err.to_string().contains("service/method request ill-formed"));

        let err = server.find_method("").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidServiceMethod);

        let err = server.find_method("Bar.Sum").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceNotFound);
        assert!(err.to_string().contains("can't find service Bar"));

        let err = server.find_method("Foo.Mul").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);
        assert!(err.to_string().contains("can't find method Mul"));
    }

    #[test]
    fn test_method_name_split_on_last_dot() {
        let server = Server::new();
        server.register(sum_service("Outer.Foo")).unwrap();
        server.find_method("Outer.Foo.Sum").unwrap();
    }
}
