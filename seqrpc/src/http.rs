use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::client::Client;
use crate::error::{Error, ErrorKind, Result};
use crate::option::Options;
use crate::server::Server;

/// Well-known path the CONNECT upgrade is served on.
pub const DEFAULT_RPC_PATH: &str = "/_seqrpc_";

const CONNECTED: &str = "200 Connected to seqrpc";

impl Server {
    /// Binds `addr` and serves RPC over HTTP CONNECT upgrades until
    /// [`Server::stop`]. Returns the bound address.
    ///
    /// # Errors
    pub async fn listen_http(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;

        let server = self.clone();
        let stop_token = self.stop_token().clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop_token.cancelled() => {
                    tracing::info!("stop http accept loop");
                }
                () = async {
                    tracing::info!("start http listening: {listener_addr}");
                    server.accept_http(listener).await;
                } => {}
            }
        });

        Ok(listener_addr)
    }

    /// Accepts HTTP connections and upgrades each in its own task.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    let stop_token = self.stop_token().clone();
                    self.connections().spawn(async move {
                        tokio::select! {
                            () = stop_token.cancelled() => {}
                            () = server.serve_http_conn(stream) => {}
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

    /// Hijacks one HTTP connection: a `CONNECT` on the RPC path turns the
    /// socket into a raw RPC stream, anything else is refused.
    pub async fn serve_http_conn(self: Arc<Self>, stream: TcpStream) {
        if let Err(e) = self.serve_http_inner(stream).await {
            tracing::error!("rpc server: http upgrade error: {e}");
        }
    }

    async fn serve_http_inner(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut request_line = String::new();
        reader
            .read_line(&mut request_line)
            .await
            .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
        // drain the header block; the upgrade needs nothing from it
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
            if n == 0 || line == "\n" || line == "\r\n" {
                break;
            }
        }

        let mut parts = request_line.split_whitespace();
        let (method, path) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
        if method != "CONNECT" || path != DEFAULT_RPC_PATH {
            write
                .write_all(b"HTTP/1.0 405 must CONNECT\n\n")
                .await
                .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
            return Ok(());
        }

        write
            .write_all(format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes())
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;

        self.serve_split(Box::new(reader), Box::new(write)).await;
        Ok(())
    }
}

/// Dials an HTTP endpoint serving the CONNECT upgrade, with default options.
///
/// # Errors
pub async fn dial_http(addr: impl ToSocketAddrs) -> Result<Client> {
    dial_http_with(addr, Options::default()).await
}

/// Dials an HTTP endpoint: CONNECT upgrade first, then the normal option
/// handshake, all raced against `opt.connect_timeout`.
///
/// # Errors
pub async fn dial_http_with(addr: impl ToSocketAddrs, opt: Options) -> Result<Client> {
    let timeout = opt.connect_timeout;
    let stream = crate::client::connect_within(
        async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))
        },
        timeout,
    )
    .await?;
    crate::client::connect_within(http_handshake(stream, opt), timeout).await
}

async fn http_handshake(stream: TcpStream, opt: Options) -> Result<Client> {
    let (read, mut write) = stream.into_split();
    write
        .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())
        .await
        .map_err(|e| Error::new(ErrorKind::HttpHandshakeFailed, e.to_string()))?;

    let mut reader = BufReader::new(read);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| Error::new(ErrorKind::HttpHandshakeFailed, e.to_string()))?;
    if status_line.trim_end() != format!("HTTP/1.0 {CONNECTED}") {
        return Err(Error::new(
            ErrorKind::HttpHandshakeFailed,
            format!("unexpected HTTP response: {}", status_line.trim_end()),
        ));
    }
    // consume the blank line terminating the response head
    let mut blank = String::new();
    reader
        .read_line(&mut blank)
        .await
        .map_err(|e| Error::new(ErrorKind::HttpHandshakeFailed, e.to_string()))?;

    Client::new_split(Box::new(reader), Box::new(write), opt).await
}
