//! Service-discovery and load-balancing front end.
//!
//! An [`XClient`] owns one cached [`Client`] per server address and fans
//! calls out according to a [`Discovery`] strategy.

mod discovery;
pub use discovery::{Discovery, MultiServersDiscovery, SelectMode};

use std::collections::HashMap;
use std::sync::Arc;

use foldhash::fast::RandomState;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, x_dial_with};
use crate::error::{Error, ErrorKind, Result};
use crate::option::Options;

/// Load-balancing client over a set of equivalent servers.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opt: Options,
    clients: Mutex<HashMap<String, Arc<Client>, RandomState>>,
}

impl<D: Discovery> XClient<D> {
    #[must_use]
    pub fn new(discovery: D, mode: SelectMode, opt: Options) -> Self {
        Self {
            discovery,
            mode,
            opt,
            clients: Mutex::new(HashMap::default()),
        }
    }

    #[must_use]
    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Closes every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close();
        }
    }

    /// Returns a healthy cached client for `rpc_addr`, dialing a fresh one
    /// if the cached entry is gone or no longer available.
    async fn dial_cached(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let _ = client.close();
            clients.remove(rpc_addr);
        }
        let client = Arc::new(x_dial_with(rpc_addr, self.opt.clone()).await?);
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    /// Picks one server by the configured mode and calls it.
    ///
    /// # Errors
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode)?;
        let client = self.dial_cached(&rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Invokes `service_method` on every known server concurrently.
    ///
    /// The first failure cancels the remaining calls and is returned; only
    /// the first successful reply is kept.
    ///
    /// # Errors
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all()?;
        let token = CancellationToken::new();
        let mut calls: FuturesUnordered<_> = servers
            .iter()
            .map(|rpc_addr| {
                let token = token.clone();
                async move {
                    let client = self.dial_cached(rpc_addr).await?;
                    client
                        .call_with_cancel::<A, R>(service_method, args, &token)
                        .await
                }
            })
            .collect();

        let mut reply = None;
        let mut first_err = None;
        while let Some(result) = calls.next().await {
            match result {
                Ok(value) => {
                    if reply.is_none() {
                        reply = Some(value);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        token.cancel();
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => reply.ok_or_else(|| {
                Error::new(
                    ErrorKind::NoAvailableServers,
                    "rpc discovery: no available servers",
                )
            }),
        }
    }
}

impl<D: Discovery> std::fmt::Debug for XClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient").field("mode", &self.mode).finish()
    }
}
