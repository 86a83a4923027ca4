use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{FleetError, Result};
use crate::registry::{CredentialManager, HostRegistry};
use crate::session::transport::{RemoteSession, Transport};

/// A live connection borrowed from the pool for one attempt.
///
/// Must be handed back via [`SessionPool::release`]; dropping it without a
/// release leaks a connection slot until the pool is rebuilt.
pub struct SessionHandle {
    host_id: String,
    session: Box<dyn RemoteSession>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("host_id", &self.host_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn session_mut(&mut self) -> &mut (dyn RemoteSession + 'static) {
        self.session.as_mut()
    }

    /// Split the handle for use on a blocking worker and reassemble after.
    pub fn into_parts(self) -> (String, Box<dyn RemoteSession>) {
        (self.host_id, self.session)
    }

    pub fn from_parts(host_id: String, session: Box<dyn RemoteSession>) -> Self {
        Self { host_id, session }
    }
}

struct IdleEntry {
    session: Box<dyn RemoteSession>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<String, Vec<IdleEntry>>,
    live_total: usize,
    live_per_host: HashMap<String, usize>,
}

impl PoolState {
    fn decrement(&mut self, host_id: &str) {
        self.live_total = self.live_total.saturating_sub(1);
        if let Some(count) = self.live_per_host.get_mut(host_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.live_per_host.remove(host_id);
            }
        }
    }

    fn prune_stale(&mut self, idle_timeout: Duration) -> usize {
        let mut evicted = Vec::new();
        for (host_id, entries) in self.idle.iter_mut() {
            entries.retain(|entry| {
                if entry.since.elapsed() > idle_timeout {
                    evicted.push(host_id.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.idle.retain(|_, entries| !entries.is_empty());
        let count = evicted.len();
        for host_id in evicted {
            self.decrement(&host_id);
        }
        count
    }

    /// Evict the idle handle that has been unused the longest, freeing one
    /// connection slot. Returns false if nothing is idle.
    fn evict_oldest_idle(&mut self) -> bool {
        let oldest = self
            .idle
            .iter()
            .filter_map(|(host_id, entries)| {
                entries
                    .iter()
                    .map(|e| e.since)
                    .min()
                    .map(|since| (host_id.clone(), since))
            })
            .min_by_key(|(_, since)| *since);

        let Some((host_id, since)) = oldest else {
            return false;
        };
        if let Some(entries) = self.idle.get_mut(&host_id) {
            if let Some(pos) = entries.iter().position(|e| e.since == since) {
                entries.remove(pos);
            }
            if entries.is_empty() {
                self.idle.remove(&host_id);
            }
        }
        self.decrement(&host_id);
        true
    }
}

enum AcquirePlan {
    Reuse(Box<dyn RemoteSession>),
    Connect,
    Wait,
}

/// Bounded pool of live SSH connections keyed by host.
///
/// Connection setup (handshake plus auth) dominates per-attempt latency, so
/// healthy handles are reused across attempts to the same host. Caps bound
/// both total connections and connections per host; idle handles past the
/// idle timeout are closed, and a handle that errored during use is never
/// returned to the pool.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    registry: Arc<HostRegistry>,
    credentials: Arc<CredentialManager>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    freed: Notify,
}

impl SessionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<HostRegistry>,
        credentials: Arc<CredentialManager>,
        config: PoolConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            credentials,
            config,
            state: Mutex::new(PoolState::default()),
            freed: Notify::new(),
        }
    }

    /// Borrow a session for `host_id`, reusing an idle healthy handle when
    /// one exists, otherwise connecting (subject to the caps) or waiting for
    /// capacity. Auth rejections and unavailable credentials are escalated
    /// immediately; they do not trigger internal retries.
    pub async fn acquire(
        self: &Arc<Self>,
        host_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle> {
        loop {
            let plan = {
                let mut state = self.state.lock().expect("pool lock poisoned");
                state.prune_stale(self.config.idle_timeout);

                if let Some(entries) = state.idle.get_mut(host_id) {
                    let entry = entries.pop().expect("idle lists are never empty");
                    if entries.is_empty() {
                        state.idle.remove(host_id);
                    }
                    AcquirePlan::Reuse(entry.session)
                } else {
                    let per_host = state.live_per_host.get(host_id).copied().unwrap_or(0);
                    if per_host >= self.config.max_per_host {
                        AcquirePlan::Wait
                    } else if state.live_total < self.config.max_sessions
                        || state.evict_oldest_idle()
                    {
                        state.live_total += 1;
                        *state.live_per_host.entry(host_id.to_string()).or_insert(0) += 1;
                        AcquirePlan::Connect
                    } else {
                        AcquirePlan::Wait
                    }
                }
            };

            match plan {
                AcquirePlan::Reuse(session) => {
                    let mut session = session;
                    let healthy = tokio::task::spawn_blocking(move || {
                        let ok = session.is_healthy();
                        (ok, session)
                    })
                    .await;
                    match healthy {
                        Ok((true, session)) => {
                            return Ok(SessionHandle {
                                host_id: host_id.to_string(),
                                session,
                            });
                        }
                        Ok((false, _)) | Err(_) => {
                            tracing::debug!(host = host_id, "Discarding broken idle session");
                            self.forget(host_id);
                            continue;
                        }
                    }
                }
                AcquirePlan::Connect => match self.connect(host_id).await {
                    Ok(session) => {
                        return Ok(SessionHandle {
                            host_id: host_id.to_string(),
                            session,
                        });
                    }
                    Err(e) => {
                        self.forget(host_id);
                        return Err(e);
                    }
                },
                AcquirePlan::Wait => {
                    tokio::select! {
                        _ = self.freed.notified() => {}
                        // Fallback poll so a missed notification cannot
                        // strand a waiter.
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                    }
                }
            }
        }
    }

    async fn connect(&self, host_id: &str) -> Result<Box<dyn RemoteSession>> {
        let host = self.registry.resolve(host_id)?.clone();
        let auth = self.credentials.resolve(&host.credential)?;
        let transport = Arc::clone(&self.transport);

        tokio::task::spawn_blocking(move || transport.connect(&host, &auth))
            .await
            .map_err(|e| FleetError::Internal(format!("connect task panicked: {e}")))?
    }

    /// Return a borrowed handle. Healthy handles go back to the idle set for
    /// reuse; unhealthy ones are closed and their slot freed.
    pub fn release(&self, handle: SessionHandle, healthy: bool) {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            if healthy {
                state
                    .idle
                    .entry(handle.host_id)
                    .or_default()
                    .push(IdleEntry {
                        session: handle.session,
                        since: Instant::now(),
                    });
            } else {
                state.decrement(&handle.host_id);
            }
        }
        self.freed.notify_waiters();
    }

    /// Close idle handles past the idle timeout. Returns how many were
    /// evicted.
    pub fn evict_idle(&self) -> usize {
        let evicted = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.prune_stale(self.config.idle_timeout)
        };
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle sessions");
            self.freed.notify_waiters();
        }
        evicted
    }

    /// Drop accounting for a handle that failed during establishment or
    /// turned out broken on reuse.
    fn forget(&self, host_id: &str) {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.decrement(host_id);
        }
        self.freed.notify_waiters();
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").live_total
    }

    pub fn idle_sessions(&self) -> usize {
        self.state
            .lock()
            .expect("pool lock poisoned")
            .idle
            .values()
            .map(Vec::len)
            .sum()
    }
}
