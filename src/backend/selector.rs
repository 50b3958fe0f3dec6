use rand::seq::SliceRandom;

use crate::registry::BackendStatus;

/// Choose the least-loaded available backend.
///
/// Filters to `available` backends, breaks ties with a random shuffle (so
/// equally-loaded backends don't always favor the first one registered),
/// then stably sorts by `total_load()` ascending and returns the front.
///
/// If no backend is available, falls back to the first backend by
/// insertion order in `snapshot` — callers still get an address to try
/// rather than an immediate failure, matching the original load balancer's
/// degenerate-case behavior.
pub fn select_backend(snapshot: &[BackendStatus]) -> Option<String> {
    if snapshot.is_empty() {
        return None;
    }

    let mut available: Vec<&BackendStatus> = snapshot.iter().filter(|b| b.available).collect();

    if available.is_empty() {
        return snapshot.first().map(|b| b.address.clone());
    }

    available.shuffle(&mut rand::thread_rng());
    available.sort_by_key(|b| b.total_load());

    available.first().map(|b| b.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(address: &str, available: bool, load: u64) -> BackendStatus {
        BackendStatus {
            address: address.to_string(),
            available,
            queue_running: load as u32,
            queue_pending: 0,
            in_flight: 0,
            last_probe_at: None,
            consecutive_errors: 0,
        }
    }

    #[test]
    fn test_empty_snapshot_returns_none() {
        assert_eq!(select_backend(&[]), None);
    }

    #[test]
    fn test_picks_least_loaded_available() {
        let snapshot = vec![
            status("a:1", true, 5),
            status("b:1", true, 1),
            status("c:1", true, 3),
        ];
        assert_eq!(select_backend(&snapshot), Some("b:1".to_string()));
    }

    #[test]
    fn test_skips_unavailable_backends() {
        let snapshot = vec![status("a:1", false, 0), status("b:1", true, 9)];
        assert_eq!(select_backend(&snapshot), Some("b:1".to_string()));
    }

    #[test]
    fn test_all_unavailable_falls_back_to_first_by_insertion_order() {
        let snapshot = vec![status("a:1", false, 0), status("b:1", false, 0)];
        assert_eq!(select_backend(&snapshot), Some("a:1".to_string()));
    }
}
