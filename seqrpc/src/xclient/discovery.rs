use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, ErrorKind, Result};

/// How [`Discovery::get`] picks among the known servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

/// Supplies server addresses and a selection policy.
pub trait Discovery: Send + Sync {
    /// Re-reads the server list from its upstream source.
    ///
    /// # Errors
    fn refresh(&self) -> Result<()>;

    /// Replaces the server list.
    ///
    /// # Errors
    fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Picks one server according to `mode`.
    ///
    /// # Errors
    fn get(&self, mode: SelectMode) -> Result<String>;

    /// Returns a copy of all known servers.
    ///
    /// # Errors
    fn get_all(&self) -> Result<Vec<String>>;
}

struct MultiState {
    rng: StdRng,
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a fixed, caller-maintained server list.
pub struct MultiServersDiscovery {
    state: Mutex<MultiState>,
}

impl MultiServersDiscovery {
    #[must_use]
    pub fn new(servers: Vec<String>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        // a random starting point so restarts don't all hammer server 0
        let index = rng.gen_range(0..i32::MAX as usize - 1);
        Self {
            state: Mutex::new(MultiState {
                rng,
                servers,
                index,
            }),
        }
    }
}

impl Discovery for MultiServersDiscovery {
    fn refresh(&self) -> Result<()> {
        // a static list has no upstream source
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        self.state.lock().unwrap().servers = servers;
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let n = state.servers.len();
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NoAvailableServers,
                "rpc discovery: no available servers",
            ));
        }
        match mode {
            SelectMode::Random => {
                let i = state.rng.gen_range(0..n);
                Ok(state.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                // the list may have shrunk since the last call; mod by the
                // current length
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().servers.clone())
    }
}

impl std::fmt::Debug for MultiServersDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiServersDiscovery").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tcp@127.0.0.1:{}", 9000 + i)).collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let discovery = MultiServersDiscovery::new(addrs(3));
        let first = discovery.get(SelectMode::RoundRobin).unwrap();
        let second = discovery.get(SelectMode::RoundRobin).unwrap();
        let third = discovery.get(SelectMode::RoundRobin).unwrap();
        let fourth = discovery.get(SelectMode::RoundRobin).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[test]
    fn test_random_stays_within_set() {
        let servers = addrs(3);
        let discovery = MultiServersDiscovery::new(servers.clone());
        for _ in 0..32 {
            let picked = discovery.get(SelectMode::Random).unwrap();
            assert!(servers.contains(&picked));
        }
    }

    #[test]
    fn test_empty_list() {
        let discovery = MultiServersDiscovery::new(vec![]);
        let err = discovery.get(SelectMode::RoundRobin).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAvailableServers);
    }

    #[test]
    fn test_update_replaces_servers() {
        let discovery = MultiServersDiscovery::new(addrs(2));
        discovery.update(vec!["tcp@10.0.0.1:1".to_string()]).unwrap();
        assert_eq!(discovery.get_all().unwrap().len(), 1);
        assert_eq!(
            discovery.get(SelectMode::RoundRobin).unwrap(),
            "tcp@10.0.0.1:1"
        );
        discovery.refresh().unwrap();
    }
}
