use super::*;

fn node(id: u64, addrs: &[&str]) -> Node {
    Node {
        id,
        addresses: addrs.iter().map(|a| a.to_string()).collect(),
    }
}

/// Two-partition ring over three nodes, each partition replicated on all
/// three in a different order.
fn small_ring() -> Ring {
    Ring::new(
        1,
        vec![
            node(1, &["10.0.0.1:12345", "10.0.0.1:12346"]),
            node(2, &["10.0.0.2:12345", "10.0.0.2:12346"]),
            node(3, &["10.0.0.3:12345", "10.0.0.3:12346"]),
        ],
        vec![vec![0, 1, 2], vec![2, 0, 1]],
        7,
    )
    .unwrap()
}

#[test]
fn partition_uses_high_bits_of_first_half() {
    let key = Key::new(0x8000_0000_0000_0000, 99);
    assert_eq!(key.partition(1), 1);
    assert_eq!(key.partition(2), 2);
    assert_eq!(key.partition(16), 0x8000);

    // The low half never affects placement.
    let sibling = Key::new(key.hi, 12345);
    assert_eq!(key.partition(8), sibling.partition(8));

    assert_eq!(Key::new(0, 0).partition(32), 0);
    assert_eq!(Key::new(u64::MAX, 0).partition(32), u32::MAX);
}

#[test]
fn responsible_nodes_are_ordered() {
    let ring = small_ring();
    let first: Vec<u64> = ring.responsible_nodes(0).iter().map(|n| n.id).collect();
    assert_eq!(first, vec![1, 2, 3]);
    let second: Vec<u64> = ring.responsible_nodes(1).iter().map(|n| n.id).collect();
    assert_eq!(second, vec![3, 1, 2]);
}

#[test]
fn out_of_range_partition_is_empty() {
    let ring = small_ring();
    assert!(ring.responsible_nodes(2).is_empty());
}

#[test]
fn node_address_selection() {
    let ring = small_ring();
    let nodes = ring.responsible_nodes(0);
    assert_eq!(nodes[0].address(0), Some("10.0.0.1:12345"));
    assert_eq!(nodes[0].address(1), Some("10.0.0.1:12346"));
    assert_eq!(nodes[0].address(2), None);
}

#[test]
fn persist_load_round_trip() {
    let ring = small_ring();
    let mut buf = Vec::new();
    ring.persist(&mut buf).unwrap();

    let loaded = Ring::load(buf.as_slice()).unwrap();
    assert_eq!(loaded.partition_bit_count(), ring.partition_bit_count());
    assert_eq!(loaded.version(), 7);
    assert_eq!(loaded.nodes(), ring.nodes());
    let ids: Vec<u64> = loaded.responsible_nodes(1).iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![3, 1, 2]);
}

#[test]
fn load_rejects_garbage() {
    assert!(matches!(
        Ring::load(&b"not a ring"[..]),
        Err(RingError::Codec(_))
    ));
}

#[test]
fn new_rejects_wrong_partition_count() {
    let err = Ring::new(2, vec![node(1, &["a:1"])], vec![vec![0]], 0).unwrap_err();
    assert!(matches!(
        err,
        RingError::PartitionCount { got: 1, want: 4 }
    ));
}

#[test]
fn new_rejects_out_of_range_node_index() {
    let err = Ring::new(1, vec![node(1, &["a:1"])], vec![vec![0], vec![3]], 0).unwrap_err();
    assert!(matches!(
        err,
        RingError::NodeIndex {
            partition: 1,
            index: 3,
            ..
        }
    ));
}

#[test]
fn new_rejects_zero_partition_bits() {
    let err = Ring::new(0, vec![node(1, &["a:1"])], vec![], 0).unwrap_err();
    assert!(matches!(err, RingError::PartitionBits(0)));
}

#[test]
fn new_rejects_addressless_node() {
    let err = Ring::new(1, vec![node(9, &[])], vec![vec![0], vec![0]], 0).unwrap_err();
    assert!(matches!(err, RingError::NodeWithoutAddress { id: 9 }));
}

mod cache_behavior {
    use super::*;
    use crate::ring::cache;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(cache::load(&dir.path().join("ring")).is_none());
    }

    #[test]
    fn load_corrupt_file_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");
        std::fs::write(&path, b"{\"partition_bit_count\":").unwrap();
        assert!(cache::load(&path).is_none());
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");
        let ring = small_ring();

        cache::store(&path, &ring);
        let loaded = cache::load(&path).expect("cached ring should load");
        assert_eq!(loaded.version(), ring.version());
        assert_eq!(loaded.nodes(), ring.nodes());
    }

    #[test]
    fn store_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("ring");

        cache::store(&path, &small_ring());
        assert!(cache::load(&path).is_some());
    }

    #[test]
    fn store_replaces_previous_ring_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");

        cache::store(&path, &small_ring());
        let replacement = Ring::new(
            1,
            vec![node(9, &["10.9.9.9:12345"])],
            vec![vec![0], vec![0]],
            8,
        )
        .unwrap();
        cache::store(&path, &replacement);

        assert_eq!(cache::load(&path).unwrap().version(), 8);
        // Only the cache file itself remains in the directory.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
