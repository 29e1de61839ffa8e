//! Consumer-side staleness filter.
//!
//! A slot (tag) wants exactly one identifier at a time. When a slot is
//! re-pointed at another identifier before the first fetch finishes, the
//! late delivery for the old identifier must not be shown in that slot.

use std::collections::HashMap;

use pixcache_client::Delivery;

#[derive(Debug, Default)]
pub struct Wanted {
    slots: HashMap<String, String>,
}

impl Wanted {
    /// Point `tag` at `identifier`, replacing whatever it wanted before.
    pub fn want(&mut self, tag: &str, identifier: &str) {
        self.slots.insert(tag.to_string(), identifier.to_string());
    }

    /// Stop waiting on `tag`.
    pub fn release(&mut self, tag: &str) {
        self.slots.remove(tag);
    }

    /// True if the delivery still matches its slot. A matching delivery
    /// settles the slot.
    pub fn accept<V>(&mut self, delivery: &Delivery<V>) -> bool {
        match self.slots.get(&delivery.tag) {
            Some(identifier) if *identifier == delivery.identifier => {
                self.slots.remove(&delivery.tag);
                true
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
