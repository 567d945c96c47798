//! Routability checks for resolved instance addresses.
//!
//! The original implementation rejected `10.`/`192.`/`172.` by naive string
//! prefix, which both over- and under-rejects (it never matches `10.x` at
//! all, due to comparing 3 characters against a 4-character literal, and it
//! rejects all of `192.*`/`172.*` rather than just the `192.168.0.0/16` and
//! `172.16.0.0/12` blocks). This module does the CIDR math properly.

use std::net::Ipv4Addr;

/// True if `addr` is outside RFC1918 private space and therefore usable as a
/// routable public address, unless `allow_private` opts into private-only mode.
pub fn is_valid_hostaddr(addr: Ipv4Addr, allow_private: bool) -> bool {
    if allow_private {
        return true;
    }
    !is_rfc1918(addr)
}

fn is_rfc1918(addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    match (a, b) {
        (10, _) => true,
        (172, 16..=31) => true,
        (192, 168) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_all_three_rfc1918_blocks() {
        assert!(is_rfc1918(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_rfc1918(Ipv4Addr::new(10, 255, 255, 254)));
        assert!(is_rfc1918(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_rfc1918(Ipv4Addr::new(172, 31, 255, 254)));
        assert!(is_rfc1918(Ipv4Addr::new(192, 168, 0, 1)));
    }

    #[test]
    fn accepts_addresses_outside_the_blocks() {
        assert!(!is_rfc1918(Ipv4Addr::new(8, 8, 8, 8)));
        // 172.15 and 172.32 are outside the 172.16/12 block, unlike the
        // original's buggy wholesale rejection of all "172." addresses.
        assert!(!is_rfc1918(Ipv4Addr::new(172, 15, 0, 1)));
        assert!(!is_rfc1918(Ipv4Addr::new(172, 32, 0, 1)));
        // 192.0.2.0/24 ("TEST-NET-1") is outside 192.168/16.
        assert!(!is_rfc1918(Ipv4Addr::new(192, 0, 2, 1)));
    }

    #[test]
    fn is_valid_hostaddr_respects_allow_private() {
        let private = Ipv4Addr::new(10, 0, 0, 5);
        assert!(!is_valid_hostaddr(private, false));
        assert!(is_valid_hostaddr(private, true));
    }
}
