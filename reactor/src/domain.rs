use std::collections::{HashMap, HashSet};

use slotmap::DefaultKey;

/// Per-loop registry mapping a 64-bit domain id to the set of member
/// channels' slot keys. A channel with no domain id is not tracked here.
/// Performs no I/O; it exists purely so application code can enumerate or
/// broadcast to a named group of channels.
#[derive(Default)]
pub struct DomainRegistry {
    members: HashMap<u64, HashSet<DefaultKey>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, domain_id: u64, key: DefaultKey) {
        self.members.entry(domain_id).or_default().insert(key);
    }

    pub fn leave(&mut self, domain_id: u64, key: DefaultKey) {
        if let Some(set) = self.members.get_mut(&domain_id) {
            set.remove(&key);
            if set.is_empty() {
                self.members.remove(&domain_id);
            }
        }
    }

    pub fn members(&self, domain_id: u64) -> impl Iterator<Item = &DefaultKey> {
        self.members.get(&domain_id).into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn membership_moves_on_rejoin() {
        let mut sm: SlotMap<DefaultKey, ()> = SlotMap::new();
        let k = sm.insert(());
        let mut reg = DomainRegistry::new();
        reg.join(1, k);
        assert_eq!(reg.members(1).count(), 1);
        reg.leave(1, k);
        assert_eq!(reg.members(1).count(), 0);
    }
}
