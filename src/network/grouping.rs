//! Grouping key resolution
//!
//! Decides which room a connecting peer lands in.

use std::net::IpAddr;

/// Room key shared by every peer in same-segment mode
pub const SHARED_ROOM_KEY: &str = "local";

/// How peers are partitioned into rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupingMode {
    /// Every peer shares one room
    #[default]
    SameSegment,
    /// Peers are grouped by their (public) network address
    PerAddress,
}

/// Derive the room key for a peer
///
/// An explicit room identifier from the connect request takes precedence
/// over the mode.
pub fn resolve_room_key(mode: GroupingMode, addr: IpAddr, explicit_room: Option<&str>) -> String {
    if let Some(room) = explicit_room.map(str::trim).filter(|r| !r.is_empty()) {
        return format!("room:{}", room);
    }
    match mode {
        GroupingMode::SameSegment => SHARED_ROOM_KEY.to_string(),
        GroupingMode::PerAddress => normalize_addr(addr).to_string(),
    }
}

/// Collapse loopback and IPv4-mapped IPv6 forms onto their IPv4 address
pub fn normalize_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::from([127, 0, 0, 1]),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Resolve the client address, honouring the first `X-Forwarded-For` hop
pub fn client_addr(forwarded_for: Option<&str>, socket_addr: IpAddr) -> IpAddr {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .map(normalize_addr)
        .unwrap_or_else(|| normalize_addr(socket_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_segment_uses_fixed_key() {
        let a = resolve_room_key(GroupingMode::SameSegment, "10.0.0.1".parse().unwrap(), None);
        let b = resolve_room_key(GroupingMode::SameSegment, "192.168.1.9".parse().unwrap(), None);
        assert_eq!(a, SHARED_ROOM_KEY);
        assert_eq!(a, b);
    }

    #[test]
    fn test_per_address_groups_by_ip() {
        let key = resolve_room_key(GroupingMode::PerAddress, "203.0.113.7".parse().unwrap(), None);
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn test_loopback_forms_share_a_room() {
        let v6 = resolve_room_key(GroupingMode::PerAddress, "::1".parse().unwrap(), None);
        let mapped = resolve_room_key(
            GroupingMode::PerAddress,
            "::ffff:127.0.0.1".parse().unwrap(),
            None,
        );
        assert_eq!(v6, "127.0.0.1");
        assert_eq!(mapped, "127.0.0.1");
    }

    #[test]
    fn test_explicit_room_wins() {
        let key = resolve_room_key(GroupingMode::PerAddress, "10.0.0.1".parse().unwrap(), Some("R"));
        assert_eq!(key, "room:R");

        let blank = resolve_room_key(GroupingMode::SameSegment, "10.0.0.1".parse().unwrap(), Some("  "));
        assert_eq!(blank, SHARED_ROOM_KEY);
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let socket: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(
            client_addr(Some("198.51.100.4, 10.0.0.1"), socket),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(client_addr(Some("garbage"), socket), socket);
        assert_eq!(client_addr(None, socket), socket);
    }
}
