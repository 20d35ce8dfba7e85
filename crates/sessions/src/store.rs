//! The conversation state store.
//!
//! Sessions are keyed by [`SessionId`]. The map lock is only held to find
//! or create a slot; each slot has its own state lock and its own lease
//! mutex, so cycles for different sessions never contend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use juris_config::{BusyPolicy, SessionsConfig};
use juris_core::error::SessionError;
use juris_core::session::{Session, SessionId, Turn};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::eviction::{context_window, evict_to_budget};

struct SessionSlot {
    state: RwLock<Session>,
    lease: Arc<Mutex<()>>,
}

impl SessionSlot {
    fn new(id: SessionId) -> Self {
        Self {
            state: RwLock::new(Session::new(id)),
            lease: Arc::new(Mutex::new(())),
        }
    }

    fn is_leased(&self) -> bool {
        self.lease.try_lock().is_err()
    }
}

/// Exclusive right to run a reasoning cycle for one session.
///
/// Turns written through the lease always land in the leased session, and
/// the session cannot be reset or purged while the lease is held. Released
/// on drop.
pub struct SessionLease {
    session_id: SessionId,
    slot: Arc<SessionSlot>,
    budget_tokens: usize,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("budget_tokens", &self.budget_tokens)
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether the session has no turns yet.
    pub async fn is_new(&self) -> bool {
        self.slot.state.read().await.turns.is_empty()
    }

    /// Append a turn to the leased session, evicting past the budget.
    ///
    /// Returns how many turns were evicted.
    pub async fn append(&self, turn: Turn) -> usize {
        append_to(&self.slot, &self.session_id, turn, self.budget_tokens).await
    }

    /// The most recent turns of the leased session that fit `max_tokens`.
    pub async fn context(&self, max_tokens: usize) -> Vec<Turn> {
        context_window(&self.slot.state.read().await.turns, max_tokens)
    }
}

/// In-memory conversation store shared by all reasoning cycles.
pub struct ConversationStore {
    slots: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    budget_tokens: usize,
    ttl: Duration,
    busy_policy: BusyPolicy,
    max_sessions: usize,
}

impl ConversationStore {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            budget_tokens: config.budget_tokens,
            ttl: Duration::seconds(config.ttl_secs.min(i64::MAX as u64) as i64),
            busy_policy: config.busy_policy,
            max_sessions: config.max_sessions.max(1),
        }
    }

    pub fn busy_policy(&self) -> BusyPolicy {
        self.busy_policy
    }

    async fn slot(&self, session_id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.slots.read().await.get(session_id).cloned()
    }

    async fn slot_or_create(&self, session_id: &SessionId) -> Arc<SessionSlot> {
        if let Some(slot) = self.slot(session_id).await {
            return slot;
        }

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(session_id) {
            return slot.clone();
        }
        if slots.len() >= self.max_sessions {
            Self::evict_idle_session(&mut slots).await;
        }
        debug!(session_id = %session_id, "Creating session");
        let slot = Arc::new(SessionSlot::new(session_id.clone()));
        slots.insert(session_id.clone(), slot.clone());
        slot
    }

    /// Remove the least recently active session that is not leased.
    async fn evict_idle_session(slots: &mut HashMap<SessionId, Arc<SessionSlot>>) {
        let mut oldest: Option<(SessionId, DateTime<Utc>)> = None;
        for (id, slot) in slots.iter() {
            if slot.is_leased() {
                continue;
            }
            let last = slot.state.read().await.last_activity;
            if oldest.as_ref().is_none_or(|(_, t)| last < *t) {
                oldest = Some((id.clone(), last));
            }
        }
        if let Some((id, _)) = oldest {
            info!(session_id = %id, "Session cap reached, evicting idle session");
            slots.remove(&id);
        }
    }

    /// Acquire the per-session lease, creating the session if needed.
    ///
    /// Under [`BusyPolicy::Queue`] this waits for the in-flight cycle;
    /// under [`BusyPolicy::Reject`] it fails with [`SessionError::Busy`].
    pub async fn acquire(&self, session_id: &SessionId) -> Result<SessionLease, SessionError> {
        loop {
            let slot = self.slot_or_create(session_id).await;
            let guard = self.lock_slot(&slot, session_id).await?;
            // Reset or purged while we waited: start over on the new slot.
            if !self.is_current(session_id, &slot).await {
                continue;
            }
            return Ok(SessionLease {
                session_id: session_id.clone(),
                slot,
                budget_tokens: self.budget_tokens,
                _guard: guard,
            });
        }
    }

    async fn lock_slot(
        &self,
        slot: &Arc<SessionSlot>,
        session_id: &SessionId,
    ) -> Result<OwnedMutexGuard<()>, SessionError> {
        match self.busy_policy {
            BusyPolicy::Queue => Ok(slot.lease.clone().lock_owned().await),
            BusyPolicy::Reject => slot
                .lease
                .clone()
                .try_lock_owned()
                .map_err(|_| SessionError::Busy(session_id.to_string())),
        }
    }

    /// Whether `slot` is still the live slot for the session.
    async fn is_current(&self, session_id: &SessionId, slot: &Arc<SessionSlot>) -> bool {
        self.slots
            .read()
            .await
            .get(session_id)
            .is_some_and(|live| Arc::ptr_eq(live, slot))
    }

    /// Whether the session exists and has no turns yet.
    pub async fn is_new(&self, session_id: &SessionId) -> bool {
        match self.slot(session_id).await {
            Some(slot) => slot.state.read().await.turns.is_empty(),
            None => true,
        }
    }

    /// Append a turn, then evict the oldest unpinned turns past the budget.
    ///
    /// Returns how many turns were evicted.
    pub async fn append(&self, session_id: &SessionId, turn: Turn) -> usize {
        let slot = self.slot_or_create(session_id).await;
        append_to(&slot, session_id, turn, self.budget_tokens).await
    }

    /// The most recent turns that fit `max_tokens`, oldest first.
    ///
    /// Pinned turns are always part of the window. Unknown sessions have
    /// an empty context.
    pub async fn get_context(&self, session_id: &SessionId, max_tokens: usize) -> Vec<Turn> {
        match self.slot(session_id).await {
            Some(slot) => context_window(&slot.state.read().await.turns, max_tokens),
            None => Vec::new(),
        }
    }

    /// A consistent copy of the whole session.
    pub async fn snapshot(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        let slot = self
            .slot(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let session = slot.state.read().await.clone();
        Ok(session)
    }

    /// Destroy a session. Returns whether it existed.
    ///
    /// Takes the session lease first, so a reset never lands in the middle
    /// of a reasoning cycle: under [`BusyPolicy::Queue`] it waits for the
    /// cycle to finish, under [`BusyPolicy::Reject`] it fails with
    /// [`SessionError::Busy`].
    pub async fn reset(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        loop {
            let Some(slot) = self.slot(session_id).await else {
                return Ok(false);
            };
            let _guard = self.lock_slot(&slot, session_id).await?;

            let mut slots = self.slots.write().await;
            if !slots.get(session_id).is_some_and(|live| Arc::ptr_eq(live, &slot)) {
                continue;
            }
            slots.remove(session_id);
            info!(session_id = %session_id, "Session reset");
            return Ok(true);
        }
    }

    /// Remove sessions idle past the TTL.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now()).await
    }

    /// Remove sessions idle past the TTL as of `now`. Leased sessions are kept.
    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self.slots.write().await;
        let mut expired = Vec::new();
        for (id, slot) in slots.iter() {
            if slot.is_leased() {
                continue;
            }
            if now - slot.state.read().await.last_activity > self.ttl {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            slots.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Purged expired sessions");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

async fn append_to(slot: &SessionSlot, session_id: &SessionId, turn: Turn, budget: usize) -> usize {
    let mut session = slot.state.write().await;
    session.push(turn);
    let evicted = evict_to_budget(&mut session.turns, budget);
    if !evicted.is_empty() {
        debug!(
            session_id = %session_id,
            evicted = evicted.len(),
            remaining = session.turns.len(),
            "Evicted turns over budget"
        );
    }
    evicted.len()
}
