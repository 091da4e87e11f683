//! Channel id allocation and the live-channel table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::BrokerError;

use super::{ChannelId, ChannelKind, ChannelState, Transport};

struct ChannelEntry {
    kind: ChannelKind,
    state: ChannelState,
    transport: Arc<dyn Transport>,
}

/// Allocates channel ids and tracks live transports.
///
/// Ids start at 1, strictly increase and are never handed out twice for the
/// lifetime of the registry. Every operation is a single short critical
/// section; nothing here blocks on I/O.
pub struct ChannelRegistry {
    /// Last id handed out.
    last_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    /// Set by shutdown; registration is refused afterwards.
    sealed: AtomicBool,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            last_id: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelEntry>> {
        // A panic while holding this lock cannot leave the map half-updated
        // (all mutations are single insert/remove calls), so keep going.
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out a fresh id.
    pub fn allocate(&self) -> ChannelId {
        ChannelId(self.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Hand out a fresh id unless the registry is sealed.
    ///
    /// Takes the map lock, so once [`seal`](Self::seal) has returned no
    /// caller can obtain another id.
    pub fn try_allocate(&self) -> Result<ChannelId, BrokerError> {
        let _channels = self.channels();
        if self.is_sealed() {
            return Err(BrokerError::ShuttingDown);
        }
        Ok(self.allocate())
    }

    /// Record a live channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ShuttingDown`] once the registry is sealed.
    pub fn register(
        &self,
        id: ChannelId,
        transport: Arc<dyn Transport>,
    ) -> Result<(), BrokerError> {
        let mut channels = self.channels();
        // Checked under the map lock so seal() + list() in shutdown never
        // misses a channel registered concurrently.
        if self.is_sealed() {
            return Err(BrokerError::ShuttingDown);
        }
        channels.insert(
            id,
            ChannelEntry {
                kind: transport.kind(),
                state: ChannelState::Open,
                transport,
            },
        );
        Ok(())
    }

    /// Drop a channel from the table, returning its transport if it was live.
    pub fn unregister(&self, id: ChannelId) -> Option<Arc<dyn Transport>> {
        self.channels().remove(&id).map(|entry| entry.transport)
    }

    /// Snapshot of live channel ids, in ascending order.
    pub fn list(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<dyn Transport>> {
        self.channels().get(&id).map(|entry| entry.transport.clone())
    }

    pub fn kind(&self, id: ChannelId) -> Option<ChannelKind> {
        self.channels().get(&id).map(|entry| entry.kind)
    }

    /// Lifecycle state of `id`. Ids that were allocated but are no longer
    /// (or never got) registered report `Closed`.
    pub fn state(&self, id: ChannelId) -> Option<ChannelState> {
        if let Some(entry) = self.channels().get(&id) {
            return Some(entry.state);
        }
        (id.0 >= 1 && id.0 <= self.last_id.load(Ordering::SeqCst)).then_some(ChannelState::Closed)
    }

    /// Move an open channel to `Closing`. Returns false if it is not live.
    pub fn mark_closing(&self, id: ChannelId) -> bool {
        match self.channels().get_mut(&id) {
            Some(entry) => {
                entry.state = ChannelState::Closing;
                true
            }
            None => false,
        }
    }

    /// Refuse all further registrations.
    pub fn seal(&self) {
        let _channels = self.channels();
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.channels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;
    use std::thread;

    struct NullTransport(ChannelKind);

    impl Transport for NullTransport {
        fn read(&self, _max: usize) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn write(&self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }
        fn kind(&self) -> ChannelKind {
            self.0
        }
        fn describe(&self) -> String {
            "null".to_string()
        }
    }

    fn null(kind: ChannelKind) -> Arc<dyn Transport> {
        Arc::new(NullTransport(kind))
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.allocate(), ChannelId(1));
        assert_eq!(registry.allocate(), ChannelId(2));
        assert_eq!(registry.allocate(), ChannelId(3));
    }

    #[test]
    fn test_concurrent_allocation_is_unique_and_ordered() {
        let registry = Arc::new(ChannelRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || (0..500).map(|_| registry.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            // Each caller sees its own allocations strictly increasing.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn test_register_list_unregister() {
        let registry = ChannelRegistry::new();
        let a = registry.allocate();
        let b = registry.allocate();
        registry.register(b, null(ChannelKind::Process)).unwrap();
        registry.register(a, null(ChannelKind::Socket)).unwrap();

        assert_eq!(registry.list(), vec![a, b]);
        assert_eq!(registry.kind(b), Some(ChannelKind::Process));
        assert_eq!(registry.state(a), Some(ChannelState::Open));

        assert!(registry.unregister(a).is_some());
        assert!(registry.unregister(a).is_none());
        assert_eq!(registry.list(), vec![b]);
        assert_eq!(registry.state(a), Some(ChannelState::Closed));
    }

    #[test]
    fn test_state_transitions() {
        let registry = ChannelRegistry::new();
        let id = registry.allocate();
        assert_eq!(registry.state(id), Some(ChannelState::Closed));
        assert_eq!(registry.state(ChannelId(99)), None);

        registry.register(id, null(ChannelKind::Socket)).unwrap();
        assert!(registry.mark_closing(id));
        assert_eq!(registry.state(id), Some(ChannelState::Closing));

        registry.unregister(id);
        assert!(!registry.mark_closing(id));
        assert_eq!(registry.state(id), Some(ChannelState::Closed));
    }

    #[test]
    fn test_sealed_registry_refuses_registration() {
        let registry = ChannelRegistry::new();
        registry.seal();
        let id = registry.allocate();
        let err = registry.register(id, null(ChannelKind::Socket)).unwrap_err();
        assert!(matches!(err, BrokerError::ShuttingDown));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sealed_registry_allocates_nothing() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.try_allocate().unwrap(), ChannelId(1));
        registry.seal();
        assert!(matches!(
            registry.try_allocate(),
            Err(BrokerError::ShuttingDown)
        ));
        // The refused call did not consume an id.
        assert_eq!(registry.state(ChannelId(2)), None);
    }
}
