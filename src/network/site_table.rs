use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use super::Ack;
use super::Connection;
use crate::config::AckPolicy;
use crate::config::BackoffPolicy;
use crate::metrics::PERM_FAILED;
use crate::replication::enough_potential_acks;
use crate::replication::is_durable;
use crate::replication::SendOutcome;
use crate::replication::SiteAckState;
use crate::Lsn;
use crate::NetworkError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    Idle,
    Connecting,
    Connected,
}

/// One known remote site.
pub struct Site {
    pub eid: u32,
    pub host: String,
    pub port: u16,
    /// Election priority learned from the handshake; -1 until we have ever
    /// completed one with this site
    pub priority: i32,
    pub state: SiteState,
    pub max_ack: Lsn,
    pub conn: Option<Arc<Connection>>,
    retry_attempts: u32,
    retry_at: Option<Instant>,
}

/// The set of known remote sites and their connection/ack state, under one
/// coarse lock (always acquired after the gap lock when both are needed).
/// Also owns retry scheduling and the durability wait.
pub struct SiteTable {
    inner: Mutex<Vec<Site>>,
    ack_wake: Notify,
    backoff: BackoffPolicy,
    group_size: usize,
    ack_timeout: Duration,
}

impl SiteTable {
    pub fn new(backoff: BackoffPolicy, group_size: usize, ack_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            ack_wake: Notify::new(),
            backoff,
            group_size,
            ack_timeout,
        }
    }

    /// Adds a site (or returns the existing one), scheduled for an
    /// immediate connection attempt.
    pub fn add_site(&self, host: &str, port: u16) -> u32 {
        let mut sites = self.inner.lock();
        if let Some(site) = sites.iter().find(|s| s.host == host && s.port == port) {
            return site.eid;
        }
        let eid = sites.len() as u32;
        info!("site {} added: {}:{}", eid, host, port);
        sites.push(Site {
            eid,
            host: host.to_string(),
            port,
            priority: -1,
            state: SiteState::Idle,
            max_ack: Lsn::ZERO,
            conn: None,
            retry_attempts: 0,
            retry_at: Some(Instant::now()),
        });
        eid
    }

    pub fn find_eid(&self, host: &str, port: u16) -> Option<u32> {
        self.inner
            .lock()
            .iter()
            .find(|s| s.host == host && s.port == port)
            .map(|s| s.eid)
    }

    /// Binds a live connection to a site. Rejected when the site already
    /// has one: the newcomer is redundant. `priority` is set only when a
    /// handshake supplied it; an outbound connect does not yet know it.
    pub fn bind_connected(
        &self,
        eid: u32,
        conn: Arc<Connection>,
        priority: Option<u32>,
    ) -> Result<()> {
        let mut sites = self.inner.lock();
        let site = site_mut(&mut sites, eid)?;
        if site.state == SiteState::Connected
            && site.conn.as_ref().is_some_and(|c| !c.is_defunct())
        {
            return Err(NetworkError::Unavailable { eid }.into());
        }
        site.state = SiteState::Connected;
        site.conn = Some(conn);
        if let Some(priority) = priority {
            site.priority = priority as i32;
        }
        site.retry_attempts = 0;
        site.retry_at = None;
        Ok(())
    }

    pub fn set_priority(&self, eid: u32, priority: u32) {
        let mut sites = self.inner.lock();
        if let Some(site) = sites.iter_mut().find(|s| s.eid == eid) {
            site.priority = priority as i32;
        }
    }

    /// Reverts a site to idle after its connection died, arming the retry
    /// timer with exponential backoff and a little jitter. A no-op unless
    /// `conn_id` still is the site's current connection (a rejected
    /// redundant connection must not knock out the live one).
    pub fn detach_conn(&self, eid: u32, conn_id: u64) -> bool {
        let mut sites = self.inner.lock();
        let Some(site) = sites.iter_mut().find(|s| s.eid == eid) else {
            return false;
        };
        match &site.conn {
            Some(conn) if conn.id() == conn_id => {}
            _ => return false,
        }
        site.conn = None;
        site.state = SiteState::Idle;
        let delay = jittered(self.backoff.delay_for(site.retry_attempts));
        site.retry_attempts += 1;
        site.retry_at = Some(Instant::now() + delay);
        debug!("site {} idle; retrying in {:?}", eid, delay);
        true
    }

    /// Marks a connect attempt failed, rearming the retry timer.
    pub fn connect_failed(&self, eid: u32) {
        let mut sites = self.inner.lock();
        if let Some(site) = sites.iter_mut().find(|s| s.eid == eid) {
            site.state = SiteState::Idle;
            site.conn = None;
            let delay = jittered(self.backoff.delay_for(site.retry_attempts));
            site.retry_attempts += 1;
            site.retry_at = Some(Instant::now() + delay);
            debug!("connect to site {} failed; retrying in {:?}", eid, delay);
        }
    }

    /// Idle sites whose retry timers came due; each is flipped to
    /// `Connecting` and handed to the caller for a connect attempt.
    pub fn due_retries(&self) -> Vec<(u32, String, u16)> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut sites = self.inner.lock();
        for site in sites.iter_mut() {
            if site.state == SiteState::Idle && site.retry_at.is_some_and(|at| at <= now) {
                site.state = SiteState::Connecting;
                site.retry_at = None;
                due.push((site.eid, site.host.clone(), site.port));
            }
        }
        due
    }

    /// The connection to use for a direct send, if the site is usable.
    pub fn site_conn(&self, eid: u32) -> Option<(Arc<Connection>, i32)> {
        let sites = self.inner.lock();
        let site = sites.iter().find(|s| s.eid == eid)?;
        if site.state != SiteState::Connected {
            return None;
        }
        let conn = site.conn.as_ref()?;
        if conn.is_defunct() {
            return None;
        }
        Some((conn.clone(), site.priority))
    }

    /// Election priority of a site, -1 when unknown.
    pub fn priority_of(&self, eid: u32) -> i32 {
        self.inner
            .lock()
            .iter()
            .find(|s| s.eid == eid)
            .map(|s| s.priority)
            .unwrap_or(-1)
    }

    /// A site that can serve an "anywhere" request: an electable peer when
    /// one is connected (sparing the primary), except for re-requests,
    /// which go straight to the primary since the peer route already
    /// failed to deliver.
    pub fn anywhere_conn(
        &self,
        rerequest: bool,
        primary: Option<u32>,
    ) -> Option<(u32, Arc<Connection>)> {
        if !rerequest {
            let sites = self.inner.lock();
            let peer = sites.iter().find(|s| {
                s.state == SiteState::Connected
                    && s.priority > 0
                    && Some(s.eid) != primary
                    && s.conn.as_ref().is_some_and(|c| !c.is_defunct())
            });
            if let Some(site) = peer {
                debug!("sending request to peer {}", site.eid);
                return Some((site.eid, site.conn.as_ref()?.clone()));
            }
        }
        let eid = primary?;
        self.site_conn(eid).map(|(conn, _)| (eid, conn))
    }

    /// Records an acknowledgement. Stale generations are ignored, and an
    /// ack can only ever move a site's high-water mark forward.
    pub fn record_ack(&self, eid: u32, ack: Ack, current_generation: u32) {
        if ack.generation < current_generation {
            debug!(
                "ignoring stale ack ({}<{}) from site {}",
                ack.generation, current_generation, eid
            );
            return;
        }
        let mut sites = self.inner.lock();
        let Some(site) = sites.iter_mut().find(|s| s.eid == eid) else {
            return;
        };
        if ack.generation == current_generation && ack.lsn > site.max_ack {
            debug!("got ack {}({}) from site {}", ack.lsn, ack.generation, eid);
            site.max_ack = ack.lsn;
            drop(sites);
            self.ack_wake.notify_waiters();
        }
    }

    /// Ack state snapshot for the durability arithmetic.
    pub fn ack_states(&self) -> Vec<SiteAckState> {
        self.inner
            .lock()
            .iter()
            .map(|s| SiteAckState {
                eid: s.eid,
                priority: s.priority,
                max_ack: s.max_ack,
            })
            .collect()
    }

    /// Blocks until `lsn` satisfies `policy` or the wait cannot succeed.
    /// Fails fast with "unavailable" when the record reached too few sites
    /// for the policy to ever be met, rather than blocking out the full
    /// timeout for acks that will never come.
    pub async fn await_ack(&self, lsn: Lsn, policy: AckPolicy, attempted: SendOutcome) -> Result<()> {
        if policy == AckPolicy::None {
            return Ok(());
        }
        if !enough_potential_acks(policy, attempted, self.group_size) {
            PERM_FAILED.inc();
            return Err(NetworkError::NoSiteAvailable {
                request: "durability wait",
            }
            .into());
        }
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            // Register for the wakeup before checking, so an ack landing
            // in between is not lost.
            let woken = self.ack_wake.notified();
            if is_durable(policy, &self.ack_states(), self.group_size, lsn) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, woken).await.is_err() {
                PERM_FAILED.inc();
                return Err(NetworkError::AckTimeout {
                    file: lsn.file,
                    offset: lsn.offset,
                }
                .into());
            }
        }
    }
}

fn site_mut<'a>(sites: &'a mut [Site], eid: u32) -> Result<&'a mut Site> {
    sites
        .iter_mut()
        .find(|s| s.eid == eid)
        .ok_or_else(|| NetworkError::Unavailable { eid }.into())
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.88..1.12);
    delay.mul_f64(factor)
}
