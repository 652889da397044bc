//! Worker port allocation.
//!
//! Selection is hybrid: a specifically requested port is honoured when
//! both the registry and the host agree it is free; otherwise a handful
//! of random candidates are probed before falling back to a linear scan
//! of the whole range. The host probe is inherently racy against
//! processes outside the registry's control, so it is best-effort only —
//! a worker that still loses the race records a launch failure instead.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::PortConfig;
use crate::error::{ControlError, ControlResult};

/// Random candidates tried before the linear scan.
const RANDOM_ATTEMPTS: usize = 10;

/// Picks free ports for new deployments.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    probe_timeout: Duration,
}

impl PortAllocator {
    /// Create an allocator for the configured range.
    #[must_use]
    pub fn new(config: &PortConfig) -> Self {
        Self {
            min: config.min,
            max: config.max,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    /// Find an available port.
    ///
    /// `used` is the set of ports already held by registry records. A
    /// requested port that is taken falls through to automatic
    /// selection rather than erroring.
    pub async fn allocate(
        &self,
        requested: Option<u16>,
        used: &HashSet<u16>,
    ) -> ControlResult<u16> {
        if let Some(port) = requested {
            if used.contains(&port) {
                debug!(port, "requested port is held by another deployment");
            } else if self.is_port_in_use(port).await {
                debug!(port, "requested port is in use on the host");
            } else {
                return Ok(port);
            }
        }

        for _ in 0..RANDOM_ATTEMPTS {
            let port = { rand::thread_rng().gen_range(self.min..=self.max) };
            if !used.contains(&port) && !self.is_port_in_use(port).await {
                return Ok(port);
            }
        }

        for port in self.min..=self.max {
            if !used.contains(&port) && !self.is_port_in_use(port).await {
                return Ok(port);
            }
        }

        Err(ControlError::PortExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Probe whether something on the host already answers on `port`.
    async fn is_port_in_use(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new(&PortConfig {
            min,
            max,
            probe_timeout_ms: 100,
        })
    }

    #[tokio::test]
    async fn requested_free_port_is_honoured() {
        // Grab an OS-assigned port, release it, then request it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let allocator = allocator(8001, 9999);
        let allocated = allocator
            .allocate(Some(port), &HashSet::new())
            .await
            .expect("allocate");
        assert_eq!(allocated, port);
    }

    #[tokio::test]
    async fn registry_held_port_is_reassigned() {
        let allocator = allocator(18101, 18110);
        let used: HashSet<u16> = [18105].into_iter().collect();

        let allocated = allocator
            .allocate(Some(18105), &used)
            .await
            .expect("allocate");
        assert_ne!(allocated, 18105);
        assert!((18101..=18110).contains(&allocated));
    }

    #[tokio::test]
    async fn host_occupied_port_is_reassigned() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // The requested port stays bound, so allocation must pick from
        // the fallback range instead.
        let allocator = allocator(18111, 18120);
        let allocated = allocator
            .allocate(Some(port), &HashSet::new())
            .await
            .expect("allocate");
        assert_ne!(allocated, port);
        assert!((18111..=18120).contains(&allocated));
    }

    #[tokio::test]
    async fn exhausted_range_errors() {
        let allocator = allocator(18121, 18122);
        let used: HashSet<u16> = [18121, 18122].into_iter().collect();

        let result = allocator.allocate(None, &used).await;
        assert!(matches!(result, Err(ControlError::PortExhausted { .. })));
    }

    #[tokio::test]
    async fn automatic_selection_avoids_used_ports() {
        let allocator = allocator(18131, 18140);
        let used: HashSet<u16> = (18131..=18139).collect();

        let allocated = allocator.allocate(None, &used).await.expect("allocate");
        assert_eq!(allocated, 18140);
    }
}
