//! Per-peer cookie cache for conversations initiated by this host
//!
//! Entries live in a fixed slot arena. A hash index maps peer address to slot,
//! and a FIFO queue of slots records creation order so the oldest entry can be
//! evicted in O(1), no matter how recently it was looked up.

use crate::clock::Timestamp;
use ipcookie_common::{Cookie, LIFETIME_LOG2_INFINITE, LT_LOG2_MASK};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv6Addr;
use tracing::debug;

/// Cookie state for a single peer
///
/// Flags and lifetime only change through the named mutators below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    peer: Ipv6Addr,
    cookie: Cookie,
    mtime: Timestamp,
    lifetime_log2: u8,
    disable_cookies: bool,
    expecting_setcookie: bool,
}

impl CacheEntry {
    fn new(peer: Ipv6Addr, cookie: Cookie, policy_disable_cookies: bool, now: Timestamp) -> Self {
        if policy_disable_cookies {
            Self {
                peer,
                cookie,
                mtime: now,
                lifetime_log2: LIFETIME_LOG2_INFINITE,
                disable_cookies: true,
                expecting_setcookie: false,
            }
        } else {
            Self {
                peer,
                cookie,
                mtime: now,
                lifetime_log2: 0,
                disable_cookies: false,
                expecting_setcookie: true,
            }
        }
    }

    pub fn peer(&self) -> Ipv6Addr {
        self.peer
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn mtime(&self) -> Timestamp {
        self.mtime
    }

    pub fn lifetime_log2(&self) -> u8 {
        self.lifetime_log2
    }

    /// Lifetime in seconds, `None` for the infinite sentinel
    pub fn lifetime_secs(&self) -> Option<u64> {
        if self.lifetime_log2 == LIFETIME_LOG2_INFINITE {
            None
        } else {
            Some(1u64 << self.lifetime_log2)
        }
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = cookie;
    }

    pub fn update_mtime(&mut self, now: Timestamp) {
        self.mtime = now;
    }

    pub fn set_lifetime_log2(&mut self, lifetime_log2: u8) {
        self.lifetime_log2 = lifetime_log2 & LT_LOG2_MASK;
    }

    /// Move mtime to `now - 2^lifetime_log2` so the entry sits at the very start
    /// of its renewal window
    pub fn backdate_mtime_by_lifetime(&mut self, now: Timestamp) {
        let lifetime = self.lifetime_secs().unwrap_or(0);
        self.mtime = now.saturating_sub(lifetime);
    }

    pub fn set_disable_cookies(&mut self) {
        self.disable_cookies = true;
    }

    pub fn clear_disable_cookies(&mut self) {
        self.disable_cookies = false;
    }

    pub fn is_disable_cookies(&self) -> bool {
        self.disable_cookies
    }

    pub fn set_expecting_setcookie(&mut self) {
        self.expecting_setcookie = true;
    }

    pub fn clear_expecting_setcookie(&mut self) {
        self.expecting_setcookie = false;
    }

    pub fn is_expecting_setcookie(&self) -> bool {
        self.expecting_setcookie
    }
}

/// Fixed-capacity peer table with FIFO eviction
#[derive(Debug)]
pub struct PeerCookieCache {
    slots: Vec<Option<CacheEntry>>,
    index: HashMap<Ipv6Addr, usize>,
    /// Occupied slots, oldest first
    order: VecDeque<usize>,
    free: Vec<usize>,
    capacity: usize,
}

impl PeerCookieCache {
    /// Create an empty cache; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            free: (0..capacity).rev().collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn lookup(&self, peer: &Ipv6Addr) -> Option<&CacheEntry> {
        let slot = *self.index.get(peer)?;
        self.slots[slot].as_ref()
    }

    pub fn lookup_mut(&mut self, peer: &Ipv6Addr) -> Option<&mut CacheEntry> {
        let slot = *self.index.get(peer)?;
        self.slots[slot].as_mut()
    }

    /// Create the entry for a new peer, evicting the oldest entry when full
    ///
    /// An existing entry for `peer` is returned unchanged.
    pub fn insert_new(
        &mut self,
        peer: Ipv6Addr,
        policy_disable_cookies: bool,
        initial_cookie: Cookie,
        now: Timestamp,
    ) -> &mut CacheEntry {
        if let Some(&slot) = self.index.get(&peer) {
            return self.slot_mut(slot);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => self.evict_oldest(),
        };

        self.slots[slot] = Some(CacheEntry::new(peer, initial_cookie, policy_disable_cookies, now));
        self.index.insert(peer, slot);
        self.order.push_back(slot);

        debug!(
            peer = %peer,
            disable_cookies = policy_disable_cookies,
            entries = self.index.len(),
            "Created peer cookie entry"
        );

        self.slot_mut(slot)
    }

    /// Remove a peer's entry
    pub fn remove(&mut self, peer: &Ipv6Addr) -> Option<CacheEntry> {
        let slot = self.index.remove(peer)?;
        self.order.retain(|s| *s != slot);
        self.free.push(slot);
        self.slots[slot].take()
    }

    /// Entries in creation order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.order.iter().filter_map(|slot| self.slots[*slot].as_ref())
    }

    fn evict_oldest(&mut self) -> usize {
        // Only called with no free slot, so the queue holds `capacity` slots
        let slot = self
            .order
            .pop_front()
            .expect("full cache has a FIFO head");
        if let Some(evicted) = self.slots[slot].take() {
            self.index.remove(&evicted.peer);
            debug!(peer = %evicted.peer, "Evicted oldest peer cookie entry");
        }
        slot
    }

    fn slot_mut(&mut self, slot: usize) -> &mut CacheEntry {
        self.slots[slot]
            .as_mut()
            .expect("indexed slot is occupied")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    fn cookie(fill: u8) -> Cookie {
        Cookie::new([fill; 12])
    }

    #[test]
    fn test_new_entry_with_cookies_enabled() {
        let mut cache = PeerCookieCache::new(4);
        let entry = cache.insert_new(peer(1), false, cookie(1), 100);

        assert_eq!(entry.lifetime_log2(), 0);
        assert!(entry.is_expecting_setcookie());
        assert!(!entry.is_disable_cookies());
        assert_eq!(entry.mtime(), 100);
        assert_eq!(entry.cookie(), cookie(1));
    }

    #[test]
    fn test_new_entry_with_cookies_disabled() {
        let mut cache = PeerCookieCache::new(4);
        let entry = cache.insert_new(peer(1), true, cookie(1), 100);

        assert_eq!(entry.lifetime_log2(), LIFETIME_LOG2_INFINITE);
        assert_eq!(entry.lifetime_secs(), None);
        assert!(!entry.is_expecting_setcookie());
        assert!(entry.is_disable_cookies());
    }

    #[test]
    fn test_lookup_has_no_side_effects() {
        let mut cache = PeerCookieCache::new(2);
        cache.insert_new(peer(1), false, cookie(1), 0);
        let before = cache.lookup(&peer(1)).cloned();
        let _ = cache.lookup(&peer(1));
        assert_eq!(cache.lookup(&peer(1)).cloned(), before);
        assert!(cache.lookup(&peer(9)).is_none());
    }

    #[test]
    fn test_fifo_eviction_ignores_lookup_recency() {
        let mut cache = PeerCookieCache::new(3);
        cache.insert_new(peer(1), false, cookie(1), 0);
        cache.insert_new(peer(2), false, cookie(2), 1);
        cache.insert_new(peer(3), false, cookie(3), 2);

        // Touch the oldest entry repeatedly; it must still be the one to go
        for _ in 0..5 {
            cache.lookup_mut(&peer(1)).unwrap().update_mtime(50);
        }

        cache.insert_new(peer(4), false, cookie(4), 3);

        assert_eq!(cache.len(), 3);
        assert!(cache.lookup(&peer(1)).is_none());
        assert!(cache.lookup(&peer(2)).is_some());
        assert!(cache.lookup(&peer(4)).is_some());

        let order: Vec<_> = cache.iter().map(|e| e.peer()).collect();
        assert_eq!(order, vec![peer(2), peer(3), peer(4)]);
    }

    #[test]
    fn test_insert_existing_peer_returns_untouched_entry() {
        let mut cache = PeerCookieCache::new(2);
        cache.insert_new(peer(1), false, cookie(1), 10);
        let entry = cache.insert_new(peer(1), true, cookie(9), 20);
        assert_eq!(entry.cookie(), cookie(1));
        assert_eq!(entry.mtime(), 10);
        assert!(!entry.is_disable_cookies());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut cache = PeerCookieCache::new(2);
        cache.insert_new(peer(1), false, cookie(1), 0);
        cache.insert_new(peer(2), false, cookie(2), 0);
        assert!(cache.remove(&peer(1)).is_some());
        cache.insert_new(peer(3), false, cookie(3), 0);

        // Nothing was evicted since a slot was free
        assert!(cache.lookup(&peer(2)).is_some());
        assert!(cache.lookup(&peer(3)).is_some());
        assert!(cache.remove(&peer(1)).is_none());
    }

    #[test]
    fn test_backdate_saturates() {
        let mut cache = PeerCookieCache::new(1);
        let entry = cache.insert_new(peer(1), false, cookie(1), 5);
        entry.set_lifetime_log2(4);
        entry.backdate_mtime_by_lifetime(100);
        assert_eq!(entry.mtime(), 84);
        entry.backdate_mtime_by_lifetime(3);
        assert_eq!(entry.mtime(), 0);
    }

    #[test]
    fn test_lifetime_is_masked() {
        let mut cache = PeerCookieCache::new(1);
        let entry = cache.insert_new(peer(1), false, cookie(1), 0);
        entry.set_lifetime_log2(0x23);
        assert_eq!(entry.lifetime_log2(), 0x03);
        assert_eq!(entry.lifetime_secs(), Some(8));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut cache = PeerCookieCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert_new(peer(1), false, cookie(1), 0);
        cache.insert_new(peer(2), false, cookie(2), 0);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&peer(2)).is_some());
    }
}
