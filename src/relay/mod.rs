use std::collections::HashMap;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::RELAY_SLOT_COUNT;

/// Unordered pair of logins sharing one relay slot.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct Couple(String, String);

impl Couple {
    fn new(a: &str, b: &str) -> Couple {
        if a <= b {
            Couple(a.to_string(), b.to_string())
        } else {
            Couple(b.to_string(), a.to_string())
        }
    }
    fn contains(&self, login: &str) -> bool {
        self.0 == login || self.1 == login
    }
}

/// The fixed pool of relay slots shared by the whole server process.
///
/// A login occupies one slot per active relayed pairing, so the same slot
/// number is reusable across couples that share no login. Construct one per
/// process and inject it; this is deliberately not a global.
#[derive(Clone)]
pub struct RelayPool {
    slots: u8,
    couples: Arc<Mutex<HashMap<Couple, u8>>>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(RELAY_SLOT_COUNT)
    }
}

impl RelayPool {
    pub fn new(slots: u8) -> RelayPool {
        Self {
            slots,
            couples: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Slot already recorded for this exact pair, if any.
    pub fn slot_of(&self, a: &str, b: &str) -> Option<u8> {
        self.couples.lock().get(&Couple::new(a, b)).copied()
    }

    /// Assign the smallest slot free for both logins, reusing an existing
    /// assignment for the same pair. `None` means the pool is exhausted for
    /// this pairing; the caller surfaces that as a user notice and skips the
    /// connection this round.
    pub fn assign(&self, a: &str, b: &str) -> Option<u8> {
        let couple = Couple::new(a, b);
        let mut couples = self.couples.lock();
        if let Some(slot) = couples.get(&couple) {
            return Some(*slot);
        }
        let slot = (0..self.slots).find(|slot| {
            !couples
                .iter()
                .any(|(c, s)| s == slot && (c.contains(a) || c.contains(b)))
        })?;
        couples.insert(couple, slot);
        Some(slot)
    }

    /// Free every pairing that references `login`, and only those.
    pub fn release(&self, login: &str) {
        self.couples.lock().retain(|c, _| !c.contains(login));
    }

    pub fn active_couples(&self) -> usize {
        self.couples.lock().len()
    }
}
