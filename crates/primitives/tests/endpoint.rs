use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use fluxseed_primitives::endpoint::{Endpoint, ONIONCAT_PREFIX};

#[test]
fn parse_forms() {
    let v4 = Endpoint::parse("198.51.100.7", 16125).expect("bare v4");
    assert_eq!(v4.port(), 16125);
    assert!(v4.is_ipv4());
    assert_eq!(v4.to_string(), "198.51.100.7:16125");

    let v4_port = Endpoint::parse("198.51.100.7:9999", 16125).expect("v4 with port");
    assert_eq!(v4_port.port(), 9999);

    let v6 = Endpoint::parse("2a01:4f8::1", 16125).expect("bare v6");
    assert!(v6.is_ipv6());
    assert_eq!(v6.to_string(), "[2a01:4f8::1]:16125");

    let v6_port = Endpoint::parse("[2a01:4f8::1]:26125", 16125).expect("bracketed v6");
    assert_eq!(v6_port.port(), 26125);

    assert!(Endpoint::parse("", 16125).is_err());
    assert!(Endpoint::parse("not-an-address", 16125).is_err());
    assert!(Endpoint::parse("300.1.2.3", 16125).is_err());
}

#[test]
fn onion_roundtrip() {
    let onion = Endpoint::parse("fluxseedab23cdef.onion:16125", 16125).expect("onion");
    assert!(onion.is_onion());
    assert!(!onion.is_ipv4());
    assert!(onion.ip().is_none());
    assert_eq!(onion.wire_addr()[..6], ONIONCAT_PREFIX);
    assert_eq!(onion.onion_host().as_deref(), Some("fluxseedab23cdef.onion"));
    assert_eq!(onion.to_string(), "fluxseedab23cdef.onion:16125");

    let default_port = Endpoint::parse("fluxseedab23cdef.onion", 16125).expect("onion default");
    assert_eq!(default_port.port(), 16125);

    // Wrong identifier length must not parse.
    assert!(Endpoint::parse("shortonion.onion", 16125).is_err());
}

#[test]
fn canonical_ordering_uses_mapped_bytes() {
    let low_v4 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 16125);
    let high_v4 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5)), 16125);
    let native_v6 = Endpoint::new(IpAddr::V6("2a01::1".parse::<Ipv6Addr>().unwrap()), 16125);
    assert!(low_v4 < high_v4);
    // v4-mapped addresses lead with ten zero bytes, sorting below 2a01::.
    assert!(low_v4 < native_v6);

    let low_port = Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 1);
    assert!(low_port < low_v4);
}

#[test]
fn equality_is_ip_and_port() {
    let a = Endpoint::parse("198.51.100.7:9999", 16125).unwrap();
    let b = Endpoint::parse("198.51.100.7:9999", 1).unwrap();
    let c = Endpoint::parse("198.51.100.7:9998", 16125).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn wire_form_roundtrip() {
    for raw in ["198.51.100.7:9999", "[2a01:4f8::1]:26125"] {
        let endpoint = Endpoint::parse(raw, 16125).unwrap();
        let back = Endpoint::from_wire(endpoint.wire_addr(), endpoint.port());
        assert_eq!(back, endpoint);
        assert_eq!(back.to_string(), raw);
    }
}

#[test]
fn routability() {
    let routable = [
        "198.51.101.7:16125",
        "[2a01:4f8::1]:16125",
        "fluxseedab23cdef.onion:16125",
    ];
    for raw in routable {
        assert!(Endpoint::parse(raw, 16125).unwrap().is_routable(), "{raw}");
    }
    let unroutable = [
        "0.0.0.0:16125",
        "127.0.0.1:16125",
        "10.1.2.3:16125",
        "192.168.0.9:16125",
        "169.254.1.1:16125",
        "[::1]:16125",
        "[fe80::1]:16125",
        "[fc00::1]:16125",
    ];
    for raw in unroutable {
        assert!(!Endpoint::parse(raw, 16125).unwrap().is_routable(), "{raw}");
    }
}
