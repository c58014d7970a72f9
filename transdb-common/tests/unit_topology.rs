use transdb_common::Topology;

#[test]
fn test_topology_single_node() {
    let t = Topology { primary_addr: "127.0.0.1:3000".to_string(), replica_addr: None };
    assert_eq!(t.primary_addr, "127.0.0.1:3000");
}

#[test]
fn test_topology_equality() {
    let a = Topology { primary_addr: "127.0.0.1:3000".to_string(), replica_addr: None };
    let b = Topology { primary_addr: "127.0.0.1:3000".to_string(), replica_addr: None };
    let c = Topology { primary_addr: "10.0.0.1:3000".to_string(), replica_addr: None };
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_topology_roundtrip_json() {
    let original = Topology { primary_addr: "127.0.0.1:3000".to_string(), replica_addr: None };
    let json = serde_json::to_string(&original).unwrap();
    assert!(!json.contains("replica_addr"), "absent replica_addr should be omitted from JSON");
    let decoded: Topology = serde_json::from_str(&json).unwrap();
    assert_eq!(original, decoded);
}

#[test]
fn test_topology_with_replica_roundtrips() {
    let original = Topology {
        primary_addr: "127.0.0.1:3000".to_string(),
        replica_addr: Some("127.0.0.1:3001".to_string()),
    };
    let json = serde_json::to_string(&original).unwrap();
    let decoded: Topology = serde_json::from_str(&json).unwrap();
    assert_eq!(original, decoded);
}
