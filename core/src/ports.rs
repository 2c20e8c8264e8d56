//! Port allocation: lowest unused offset above the configured base port.
//! Pure function of the in-memory registry; the OS is never probed for bind
//! availability (a worker that fails to bind surfaces as a spawn failure instead).

use crate::registry::SessionRecord;

/// Return `base_port + k` for the smallest `k >= 1` such that no record uses that port.
/// Deterministic and O(n * k) in session count. Panics if every port up to 65535 is
/// taken, which would need tens of thousands of live sessions.
pub fn allocate(base_port: u16, records: &[SessionRecord]) -> u16 {
    for candidate in base_port.saturating_add(1)..=u16::MAX {
        if !records.iter().any(|r| r.port == candidate) {
            return candidate;
        }
    }
    panic!("port space above {base_port} exhausted");
}
