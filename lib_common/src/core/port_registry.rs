//! # Port Registry
//!
//! Tracks which serial port is held by which device task. Two devices must
//! never open the same port, and a device that loses its link should get its
//! own port back when the link returns rather than losing it to a neighbour
//! that happened to be rediscovering at the same moment.
//!
//! Released ports therefore *linger* for a while: they stay reserved for the
//! previous owner until the linger timer expires or that owner reclaims them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Claim {
    owner: String,
    /// `Some` while the port is lingering after a release.
    linger: Option<CancellationToken>,
}

/// Shared port ownership table.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    claims: Arc<Mutex<HashMap<String, Claim>>>,
    linger: Duration,
}

impl PortRegistry {
    /// A registry whose released ports stay reserved for `linger`.
    pub fn new(linger: Duration) -> Self {
        Self {
            claims: Arc::new(Mutex::new(HashMap::new())),
            linger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Claim>> {
        lock_claims(&self.claims)
    }

    /// Tries to take `port` for `owner`.
    ///
    /// Succeeds if the port is free, or if it is lingering after a release by
    /// the same owner (the pending expiry is cancelled).
    pub fn claim(&self, port: &str, owner: &str) -> bool {
        let mut claims = self.lock();
        match claims.get_mut(port) {
            None => {
                claims.insert(
                    port.to_string(),
                    Claim {
                        owner: owner.to_string(),
                        linger: None,
                    },
                );
                log::debug!("Port {} claimed by {}", port, owner);
                true
            }
            Some(claim) if claim.owner == owner => {
                if let Some(token) = claim.linger.take() {
                    token.cancel();
                    log::debug!("Port {} reclaimed by {} during linger", port, owner);
                }
                true
            }
            Some(_) => false,
        }
    }

    /// Whether `port` is held or lingering for anyone other than `owner`.
    pub fn is_reserved_for_other(&self, port: &str, owner: &str) -> bool {
        self.lock()
            .get(port)
            .map(|c| c.owner != owner)
            .unwrap_or(false)
    }

    /// Whether `port` is held or lingering.
    pub fn is_claimed(&self, port: &str) -> bool {
        self.lock().contains_key(port)
    }

    /// Ports currently held or lingering, sorted.
    pub fn claimed_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.lock().keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Gives `port` up. It stays reserved for its owner for the linger period.
    ///
    /// Must be called from within a tokio runtime when the linger is non-zero.
    pub fn release(&self, port: &str) {
        let mut claims = self.lock();

        if self.linger.is_zero() {
            claims.remove(port);
            return;
        }

        let Some(claim) = claims.get_mut(port) else {
            return;
        };
        if claim.linger.is_some() {
            return;
        }

        let token = CancellationToken::new();
        claim.linger = Some(token.clone());

        let port_name = port.to_string();
        let claims_handle = Arc::clone(&self.claims);
        let linger_duration = self.linger;

        tokio::spawn(async move {
            tokio::select! {
                // The owner came back for it.
                _ = token.cancelled() => {
                    log::debug!("Linger cancelled for {}", port_name);
                },
                _ = sleep(linger_duration) => {
                    let mut lock = lock_claims(&claims_handle);
                    let expired = lock
                        .get(&port_name)
                        .map(|c| c.linger.as_ref().is_some_and(|t| !t.is_cancelled()))
                        .unwrap_or(false);
                    if expired {
                        lock.remove(&port_name);
                        log::info!("Linger expired for {}, port is free", port_name);
                    }
                }
            }
        });
    }
}

fn lock_claims(claims: &Mutex<HashMap<String, Claim>>) -> MutexGuard<'_, HashMap<String, Claim>> {
    // A panic while holding the lock leaves the map itself consistent.
    claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
