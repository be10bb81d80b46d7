use super::{Pool, PoolConfig};
use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Pools memoized by `(host, port)`.
///
/// Clients built against the same endpoint through one registry share a
/// single pool. Isolated pools are made with [`Pool::create`] instead.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    config: PoolConfig,
    pools: Mutex<HashMap<(String, u16), Pool>>,
}

impl PoolRegistry {
    /// New pools start from `config`.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u16), Pool>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The pool for `host:port`, created on first use.
    pub fn get(&self, host: &str, port: u16) -> io::Result<Pool> {
        let mut pools = self.lock();
        let key = (host.to_string(), port);
        if let Some(pool) = pools.get(&key) {
            if !pool.is_shutdown() {
                return Ok(pool.clone());
            }
        }

        let pool = Pool::create(host, port, self.config.clone())?;
        debug!(endpoint = pool.endpoint(), "Registered pool");
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down and forget every pool.
    pub fn shutdown(&self) {
        let pools: Vec<_> = self.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolError;

    #[test]
    fn test_memoizes_by_endpoint() {
        let registry = PoolRegistry::default();
        let a = registry.get("127.0.0.1", 11211).unwrap();
        let b = registry.get("127.0.0.1", 11211).unwrap();
        let c = registry.get("127.0.0.1", 11212).unwrap();

        a.configure(|config| config.max_connections = 7);
        assert_eq!(b.config().max_connections, 7);
        assert_eq!(c.config().max_connections, 100);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_shutdown_tears_down_pools() {
        let registry = PoolRegistry::new(PoolConfig {
            max_connections: 3,
            ..Default::default()
        });
        let pool = registry.get("localhost", 11211).unwrap();
        assert_eq!(pool.config().max_connections, 3);

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(matches!(pool.acquire(), Err(PoolError::Shutdown)));

        let fresh = registry.get("localhost", 11211).unwrap();
        assert!(!fresh.is_shutdown());
    }
}
