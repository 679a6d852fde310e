//! Lease-based exclusive locks.
//!
//! Locks are identified by opaque byte descriptors. A granted request is
//! represented by a [`LockToken`]; the locks behind a token stay held until the
//! token is unlocked or its lease runs out without being refreshed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use snapkv_common::{Cell, TableRef, Timestamp};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::buffer::ChangeMetadata;

/// Table owning the commit locks, one row per start timestamp.
const COMMIT_LOCK_TABLE: &str = "_transactions";
const COMMIT_LOCK_COLUMN: &[u8] = b"t";
/// Table owning the immutable timestamp locks.
const IMMUTABLE_LOCK_TABLE: &str = "_immutable_timestamps";

/// The name of a lock.
///
/// Row and cell descriptors are length-prefixed so that no row descriptor can
/// collide with a cell descriptor of the same table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockDescriptor(Bytes);

impl LockDescriptor {
    /// Lock protecting a whole row.
    pub fn row(table: &TableRef, row: &[u8]) -> Self {
        let mut buf = Self::table_prefix(table, row.len() + 4);
        put_component(&mut buf, row);
        Self(buf.freeze())
    }

    /// Lock protecting a single cell.
    pub fn cell(table: &TableRef, cell: &Cell) -> Self {
        let mut buf = Self::table_prefix(table, cell.row().len() + cell.column().len() + 8);
        put_component(&mut buf, cell.row());
        put_component(&mut buf, cell.column());
        Self(buf.freeze())
    }

    /// The lock a committer holds from lock acquisition until it has published
    /// its outcome.
    pub fn commit_lock(start_ts: Timestamp) -> Self {
        let table = TableRef::without_namespace(COMMIT_LOCK_TABLE);
        Self::cell(&table, &Cell::new(start_ts.to_be_bytes().to_vec(), COMMIT_LOCK_COLUMN))
    }

    pub(crate) fn immutable_timestamp(ts: Timestamp) -> Self {
        Self::row(
            &TableRef::without_namespace(IMMUTABLE_LOCK_TABLE),
            &ts.to_be_bytes(),
        )
    }

    /// An application-defined lock.
    pub fn advisory(name: impl Into<Bytes>) -> Self {
        Self(name.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn table_prefix(table: &TableRef, extra: usize) -> BytesMut {
        let name = table.qualified_name().as_bytes();
        let mut buf = BytesMut::with_capacity(name.len() + 1 + extra);
        buf.put_slice(name);
        buf.put_u8(0);
        buf
    }
}

fn put_component(buf: &mut BytesMut, component: &[u8]) {
    buf.put_u32(component.len() as u32);
    buf.put_slice(component);
}

impl fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0).escape_debug())
    }
}

/// Proof of holding the locks of one granted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub(crate) fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A request for a set of exclusive locks, granted all at once or not at all.
#[derive(Debug, Clone)]
pub struct LockRequest {
    descriptors: BTreeSet<LockDescriptor>,
    metadata: BTreeMap<LockDescriptor, ChangeMetadata>,
    acquire_timeout: Duration,
}

impl LockRequest {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            descriptors: BTreeSet::new(),
            metadata: BTreeMap::new(),
            acquire_timeout,
        }
    }

    pub fn with_descriptors<I>(self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = LockDescriptor>,
    {
        let mut request = self;
        request.descriptors.extend(descriptors);
        request
    }

    pub fn add(&mut self, descriptor: LockDescriptor) {
        self.descriptors.insert(descriptor);
    }

    /// Add a lock together with the change it protects.
    pub fn add_with_metadata(&mut self, descriptor: LockDescriptor, metadata: ChangeMetadata) {
        self.metadata.insert(descriptor.clone(), metadata);
        self.descriptors.insert(descriptor);
    }

    pub fn descriptors(&self) -> &BTreeSet<LockDescriptor> {
        &self.descriptors
    }

    pub fn metadata(&self) -> &BTreeMap<LockDescriptor, ChangeMetadata> {
        &self.metadata
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

struct HeldLocks {
    descriptors: Vec<LockDescriptor>,
    expires_at: Instant,
}

#[derive(Default)]
struct LockState {
    owners: HashMap<LockDescriptor, LockToken>,
    held: HashMap<LockToken, HeldLocks>,
    metadata: HashMap<LockDescriptor, ChangeMetadata>,
}

impl LockState {
    fn remove(&mut self, token: &LockToken) -> bool {
        let Some(held) = self.held.remove(token) else {
            return false;
        };
        for descriptor in held.descriptors {
            self.owners.remove(&descriptor);
            self.metadata.remove(&descriptor);
        }
        true
    }

    /// Drop every grant whose lease ran out. Returns whether any was dropped.
    fn expire(&mut self, now: Instant) -> bool {
        let expired: Vec<LockToken> = self
            .held
            .iter()
            .filter(|(_, held)| held.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in &expired {
            debug!(%token, "lock lease expired");
            self.remove(token);
        }
        !expired.is_empty()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.held.values().map(|held| held.expires_at).min()
    }
}

/// In-memory lock table with leases.
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
    lease: Duration,
}

impl LockTable {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            lease,
        }
    }

    /// Block until every lock of the request is free, or the acquire timeout
    /// elapses. Returns `None` on timeout.
    pub fn acquire(&self, request: &LockRequest) -> Option<LockToken> {
        let deadline = Instant::now() + request.acquire_timeout();
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            if state.expire(now) {
                self.released.notify_all();
            }
            let free = request
                .descriptors()
                .iter()
                .all(|descriptor| !state.owners.contains_key(descriptor));
            if free {
                let token = LockToken::random();
                for descriptor in request.descriptors() {
                    state.owners.insert(descriptor.clone(), token);
                }
                for (descriptor, metadata) in request.metadata() {
                    state.metadata.insert(descriptor.clone(), metadata.clone());
                }
                state.held.insert(
                    token,
                    HeldLocks {
                        descriptors: request.descriptors().iter().cloned().collect(),
                        expires_at: now + self.lease,
                    },
                );
                trace!(%token, locks = request.len(), "granted locks");
                return Some(token);
            }
            if now >= deadline {
                return None;
            }
            let wake_at = state
                .next_expiry()
                .map_or(deadline, |expiry| expiry.min(deadline));
            self.released.wait_until(&mut state, wake_at);
        }
    }

    /// Extend the lease of every still-valid token. Returns the valid ones.
    pub fn refresh(&self, tokens: &[LockToken]) -> HashSet<LockToken> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.expire(now) {
            self.released.notify_all();
        }
        tokens
            .iter()
            .filter(|token| match state.held.get_mut(*token) {
                Some(held) => {
                    held.expires_at = now + self.lease;
                    true
                }
                None => false,
            })
            .copied()
            .collect()
    }

    /// Whether the token still holds its locks, without extending the lease.
    pub fn is_valid(&self, token: &LockToken) -> bool {
        let state = self.state.lock();
        state
            .held
            .get(token)
            .is_some_and(|held| held.expires_at > Instant::now())
    }

    pub fn release(&self, tokens: &[LockToken]) {
        let mut state = self.state.lock();
        let mut released = false;
        for token in tokens {
            released |= state.remove(token);
        }
        if released {
            self.released.notify_all();
        }
    }

    /// Current holder of a lock, if any.
    pub fn holder(&self, descriptor: &LockDescriptor) -> Option<LockToken> {
        self.state.lock().owners.get(descriptor).copied()
    }

    /// Change metadata attached to a currently held lock.
    pub fn metadata(&self, descriptor: &LockDescriptor) -> Option<ChangeMetadata> {
        self.state.lock().metadata.get(descriptor).cloned()
    }
}
