use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::{BoxedReader, BoxedWriter, CodecType, FrameReader, FrameWriter, Header};
use crate::error::{Error, ErrorKind, Result};
use crate::option::Options;

/// What the receive loop delivers for one call: raw reply bytes or an error.
type Outcome = Result<Bytes>;

struct ClientState {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<Outcome>, RandomState>,
    /// Set by a user-initiated close.
    closing: bool,
    /// Set when the receive loop dies on an error.
    shutdown: bool,
}

struct Shared {
    kind: CodecType,
    state: Mutex<ClientState>,
    /// Serializes framed writes so request frames never interleave.
    sending: tokio::sync::Mutex<FrameWriter>,
    stop: CancellationToken,
}

impl Shared {
    fn register_call(&self) -> Result<(u64, oneshot::Receiver<Outcome>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(Error::shutdown());
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<Outcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }
}

/// One in-flight request.
///
/// Dropping a `Call` frees its pending slot, so a reply that arrives for an
/// abandoned call is silently discarded.
pub struct Call<R> {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<Outcome>,
    shared: Arc<Shared>,
    _reply: PhantomData<fn() -> R>,
}

impl<R> Call<R> {
    /// The sequence number carried on the wire; 0 marks a call that failed
    /// before it was registered.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    fn failed(shared: Arc<Shared>, service_method: &str, err: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            seq: 0,
            service_method: service_method.to_string(),
            rx,
            shared,
            _reply: PhantomData,
        }
    }
}

impl<R: DeserializeOwned> Call<R> {
    /// Waits for the reply and decodes it.
    ///
    /// # Errors
    ///
    /// The remote error from the response header, the connection error that
    /// terminated the client, or a reply decode failure.
    pub async fn recv(mut self) -> Result<R> {
        let outcome = (&mut self.rx).await.unwrap_or_else(|_| Err(Error::shutdown()));
        let bytes = outcome?;
        self.shared.kind.decode(&bytes).map_err(|e| {
            Error::new(ErrorKind::DeserializeFailed, format!("reading body {e}"))
        })
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        self.shared.remove_call(self.seq);
    }
}

impl<R> std::fmt::Debug for Call<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("seq", &self.seq)
            .field("service_method", &self.service_method)
            .finish()
    }
}

/// An RPC connection that pipelines calls and correlates replies by
/// sequence number.
pub struct Client {
    shared: Arc<Shared>,
    opt: Options,
}

impl Client {
    /// Performs the option handshake on `stream` and starts the receive loop.
    ///
    /// # Errors
    pub async fn new<S>(stream: S, opt: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::new_split(Box::new(read), Box::new(write), opt).await
    }

    pub(crate) async fn new_split(
        read: BoxedReader,
        mut write: BoxedWriter,
        opt: Options,
    ) -> Result<Self> {
        // the option always travels as one JSON line, before any codec takes over
        let mut line = serde_json::to_vec(&opt)
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, format!("options error: {e}")))?;
        line.push(b'\n');
        write
            .write_all(&line)
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, format!("options error: {e}")))?;
        write
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, format!("options error: {e}")))?;

        let kind = opt.codec_type;
        let shared = Arc::new(Shared {
            kind,
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::default(),
                closing: false,
                shutdown: false,
            }),
            sending: tokio::sync::Mutex::new(FrameWriter::new(write, kind)),
            stop: CancellationToken::new(),
        });
        let reader = FrameReader::new(BufReader::new(read), kind);
        tokio::spawn(Self::receive(shared.clone(), reader));
        Ok(Self { shared, opt })
    }

    /// Dials a TCP endpoint with the default options.
    ///
    /// # Errors
    pub async fn dial(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::dial_with(addr, Options::default()).await
    }

    /// Dials a TCP endpoint; both the connect and the handshake race
    /// `opt.connect_timeout` (zero disables the deadline).
    ///
    /// # Errors
    pub async fn dial_with(addr: impl ToSocketAddrs, opt: Options) -> Result<Self> {
        let timeout = opt.connect_timeout;
        let stream = connect_within(
            async {
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))
            },
            timeout,
        )
        .await?;
        connect_within(Self::new(stream, opt), timeout).await
    }

    /// Dials a Unix socket path, for the `unix@` scheme.
    ///
    /// # Errors
    #[cfg(unix)]
    pub async fn dial_unix_with(path: impl AsRef<std::path::Path>, opt: Options) -> Result<Self> {
        let timeout = opt.connect_timeout;
        let stream = connect_within(
            async {
                tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))
            },
            timeout,
        )
        .await?;
        connect_within(Self::new(stream, opt), timeout).await
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.opt
    }

    /// False once the client is closing or has shut down on an error.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        !state.shutdown && !state.closing
    }

    /// Closes the connection; pending calls finish with the shutdown error.
    ///
    /// # Errors
    ///
    /// A second close returns the shutdown sentinel.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closing {
                return Err(Error::shutdown());
            }
            state.closing = true;
        }
        self.shared.stop.cancel();
        Ok(())
    }

    /// Issues a call asynchronously; the returned [`Call`] resolves when the
    /// reply (or a failure) arrives.
    ///
    /// Requests reach the wire in submission order because registration and
    /// the frame write happen under the sending lock.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize,
    {
        let mut writer = self.shared.sending.lock().await;
        let (seq, rx) = match self.shared.register_call() {
            Ok(registered) => registered,
            Err(e) => return Call::failed(self.shared.clone(), service_method, e),
        };
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(e) = writer.write_frame(&header, args).await {
            // the receive loop may already have consumed and removed the
            // call; only complete it if the slot is still ours
            if let Some(tx) = self.shared.remove_call(seq) {
                let _ = tx.send(Err(e));
            }
        }
        Call {
            seq,
            service_method: service_method.to_string(),
            rx,
            shared: self.shared.clone(),
            _reply: PhantomData,
        }
    }

    /// Calls `service_method` and waits for the reply.
    ///
    /// # Errors
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.recv().await
    }

    /// Like [`Client::call`], but gives up when `token` fires. Cancellation
    /// frees the pending slot, so a late reply is dropped.
    ///
    /// # Errors
    pub async fn call_with_cancel<A, R>(
        &self,
        service_method: &str,
        args: &A,
        token: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await;
        tokio::select! {
            () = token.cancelled() => Err(Error::new(
                ErrorKind::Canceled,
                "rpc client: call failed: context canceled",
            )),
            result = call.recv() => result,
        }
    }

    /// Like [`Client::call`], but bounded by `timeout` (zero disables it).
    ///
    /// # Errors
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if timeout.is_zero() {
            return self.call(service_method, args).await;
        }
        let call = self.go(service_method, args).await;
        match tokio::time::timeout(timeout, call.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorKind::Canceled,
                "rpc client: call failed: context deadline exceeded",
            )),
        }
    }

    async fn receive(shared: Arc<Shared>, mut reader: FrameReader) {
        let err = tokio::select! {
            () = shared.stop.cancelled() => Error::shutdown(),
            err = Self::receive_loop(&shared, &mut reader) => err,
        };
        Self::terminate_calls(&shared, err).await;
    }

    async fn receive_loop(shared: &Shared, reader: &mut FrameReader) -> Error {
        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => return e,
            };
            match shared.remove_call(header.seq) {
                // no pending call for this seq: the request was cancelled
                // or half-failed on write; skip the body
                None => {
                    if let Err(e) = reader.read_body().await {
                        return e;
                    }
                }
                Some(tx) if !header.error.is_empty() => {
                    let skipped = reader.read_body().await;
                    let _ = tx.send(Err(Error::new(ErrorKind::Remote, header.error)));
                    if let Err(e) = skipped {
                        return e;
                    }
                }
                Some(tx) => match reader.read_body().await {
                    Ok(bytes) => {
                        let _ = tx.send(Ok(bytes));
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.clone()));
                        return e;
                    }
                },
            }
        }
    }

    async fn terminate_calls(shared: &Shared, err: Error) {
        let _sending = shared.sending.lock().await;
        let mut state = shared.state.lock().unwrap();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec_type", &self.shared.kind)
            .finish()
    }
}

pub(crate) async fn connect_within<T>(
    fut: impl Future<Output = Result<T>>,
    timeout: Duration,
) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(
            ErrorKind::ConnectTimeout,
            format!(
                "rpc client: connect timeout: expect within {}",
                humantime::format_duration(timeout)
            ),
        )),
    }
}

/// Dials a `scheme@address` endpoint with default options.
///
/// # Errors
pub async fn x_dial(rpc_addr: &str) -> Result<Client> {
    x_dial_with(rpc_addr, Options::default()).await
}

/// Dials a `scheme@address` endpoint: `tcp@host:port`, `unix@/path` or
/// `http@host:port`.
///
/// # Errors
pub async fn x_dial_with(rpc_addr: &str, opt: Options) -> Result<Client> {
    let parts: Vec<&str> = rpc_addr.split('@').collect();
    if parts.len() != 2 {
        return Err(Error::new(
            ErrorKind::InvalidAddress,
            format!("rpc client err: wrong format '{rpc_addr}', expect protocol@addr"),
        ));
    }
    let (protocol, addr) = (parts[0], parts[1]);
    match protocol {
        "http" => crate::http::dial_http_with(addr, opt).await,
        "tcp" => Client::dial_with(addr, opt).await,
        #[cfg(unix)]
        "unix" => Client::dial_unix_with(addr, opt).await,
        _ => Err(Error::new(
            ErrorKind::UnsupportedProtocol,
            format!("rpc client err: unsupported protocol: {protocol}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_within_deadline() {
        let err = connect_within(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectTimeout);
        assert!(err.to_string().contains("connect timeout: expect within"));
    }

    #[tokio::test]
    async fn test_connect_within_zero_disables_deadline() {
        connect_within(
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            },
            Duration::ZERO,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_x_dial_address_format() {
        let err = x_dial("tcp-127.0.0.1:9999").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAddress);

        let err = x_dial("tcp@127.0.0.1@9999").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAddress);
        assert!(err.to_string().contains("expect protocol@addr"));

        let err = x_dial("quic@127.0.0.1:9999").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedProtocol);
        assert!(err.to_string().contains("unsupported protocol"));
    }
}
