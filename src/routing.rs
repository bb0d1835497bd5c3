//! Peer → worker affinity.
//!
//! A peer address always maps to the same worker id for a given pool size.
//! The mapping is a pure function of its inputs, so it survives worker
//! respawns and needs no shared state between processes.

/// Worker id serving `peer` in a pool of `worker_num` workers.
///
/// `crc32(peer) % worker_num`. Returns `None` for an empty pool.
pub fn route(peer: &str, worker_num: usize) -> Option<usize> {
    if worker_num == 0 {
        return None;
    }
    Some(crc32fast::hash(peer.as_bytes()) as usize % worker_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // crc32("123456789") == 0xCBF43926.
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        assert_eq!(route("123456789", 10), Some(0xCBF4_3926 % 10));
        assert_eq!(route("123456789", 10), Some(2));
        assert_eq!(route("123456789", 4), Some(2));
    }

    #[test]
    fn test_route_is_stable() {
        let peer = "10.0.0.1:5000";
        let first = route(peer, 7);
        for _ in 0..100 {
            assert_eq!(route(peer, 7), first);
        }
    }

    #[test]
    fn test_route_within_bounds() {
        for port in 0..500u16 {
            let peer = format!("192.168.0.1:{port}");
            let id = route(&peer, 3).unwrap();
            assert!(id < 3);
        }
    }

    #[test]
    fn test_single_worker_takes_everything() {
        assert_eq!(route("1.1.1.1:1", 1), Some(0));
        assert_eq!(route("[::1]:65535", 1), Some(0));
    }

    #[test]
    fn test_empty_pool_has_no_route() {
        assert_eq!(route("1.1.1.1:1", 0), None);
    }

    #[test]
    fn test_peers_spread_across_workers() {
        let mut seen = [false; 4];
        for port in 1000..1200u16 {
            if let Some(id) = route(&format!("127.0.0.1:{port}"), 4) {
                seen[id] = true;
            }
        }
        assert!(seen.iter().all(|s| *s), "{seen:?}");
    }
}
