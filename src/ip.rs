use std::net::IpAddr;

/// An allow-list entry for a redundancy group: a single peer address.
///
/// `original_source`'s redundancy groups compare raw address bytes (4 for
/// IPv4, 16 for IPv6); `IpAddr`'s `PartialEq` already does exactly that, so
/// this type exists only to give the comparison a name at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowedClient(pub IpAddr);

impl AllowedClient {
    pub fn matches(&self, peer: IpAddr) -> bool {
        self.0 == peer
    }
}

impl From<IpAddr> for AllowedClient {
    fn from(addr: IpAddr) -> Self {
        AllowedClient(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn matches_exact_address_only() {
        let allowed: AllowedClient = Ipv4Addr::new(192, 168, 1, 1).into();
        assert!(allowed.matches(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!allowed.matches(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))));
    }
}
