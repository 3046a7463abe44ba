//! Ticket number allocation.
//!
//! Numbers derive from the current second (`YYYYMMDDHHMMSS`) with a
//! two-digit counter suffix appended on same-second collisions, so the
//! sequence is strictly increasing within one process. The DB unique
//! constraint on `ticket.tn` is the cross-process backstop; CreateTicket
//! retries allocation on a duplicate.

use chrono::Utc;
use parking_lot::Mutex;

/// Monotonic ticket-number generator. One instance per service.
pub struct TnGenerator {
    state: Mutex<TnState>,
}

struct TnState {
    last_stamp: String,
    counter: u16,
}

impl TnGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TnState {
                last_stamp: String::new(),
                counter: 0,
            }),
        }
    }

    /// Generate the next ticket number. Same-second calls append an
    /// incrementing two-digit suffix (widening past 99, which keeps
    /// uniqueness at the cost of lexicographic order for that second).
    pub fn next(&self) -> String {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut state = self.state.lock();

        if state.last_stamp != stamp {
            state.last_stamp = stamp.clone();
            state.counter = 0;
            return stamp;
        }

        state.counter += 1;
        format!("{}{:02}", stamp, state.counter)
    }
}

impl Default for TnGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_unique_within_same_second() {
        let gen = TnGenerator::new();
        let mut seen = HashSet::new();
        // 50 allocations land inside one or two seconds; all must be unique.
        for _ in 0..50 {
            assert!(seen.insert(gen.next()));
        }
    }

    #[test]
    fn test_first_allocation_is_bare_stamp() {
        let gen = TnGenerator::new();
        let tn = gen.next();
        assert_eq!(tn.len(), 14);
        assert!(tn.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_same_second_suffix_is_ordered() {
        let gen = TnGenerator::new();
        let first = gen.next();
        let second = gen.next();
        let third = gen.next();
        // Suffixed numbers share the stamp prefix and sort after the bare one.
        if second.len() > first.len() {
            assert!(second.starts_with(&first[..14]));
            assert!(third > second);
        }
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        use std::sync::Arc;
        let gen = Arc::new(TnGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(std::thread::spawn(move || {
                (0..20).map(|_| gen.next()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for tn in handle.join().unwrap() {
                assert!(seen.insert(tn));
            }
        }
    }
}
