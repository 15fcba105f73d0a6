use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 interface address with its network prefix. Doubles as the
/// coordinate system for kernel id issuance and for the discovery tree:
/// every host in the network has a stable 1-based position, and the 64-bit
/// id space is divided into one contiguous chunk per position.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IfaceAddr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl IfaceAddr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> IfaceAddr {
        if prefix > 32 {
            panic!("Bad network prefix {}", prefix);
        }
        IfaceAddr { addr, prefix }
    }

    #[inline]
    pub fn address(&self) -> Ipv4Addr {
        self.addr
    }

    #[inline]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    #[inline]
    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// First address of the network (the network address itself).
    #[inline]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    /// The number of host positions in the network. Prefixes of 31 and 32
    /// degenerate to 1.
    pub fn host_count(&self) -> u64 {
        let bits = 32 - self.prefix as u32;
        if bits <= 1 {
            1
        } else {
            (1u64 << bits) - 2
        }
    }

    /// 1-based position of this interface's address within the network.
    pub fn position(&self) -> u64 {
        let offset = u64::from(u32::from(self.addr) - u32::from(self.network()));
        offset.max(1)
    }

    /// The address occupying `position` (1-based) in this network.
    pub fn nth(&self, position: u64) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) + position as u32)
    }

    #[inline]
    pub fn contains(&self, other: Ipv4Addr) -> bool {
        u32::from(other) & self.mask() == u32::from(self.network())
    }

    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    /// The kernel id range `[pos0, pos1)` owned by this interface. Ranges of
    /// distinct positions within one network never overlap, so ids are
    /// globally unique without coordination.
    pub fn id_range(&self) -> (u64, u64) {
        let chunk = u64::MAX / self.host_count();
        let pos = self.position();
        (chunk * (pos - 1), chunk * pos)
    }
}

impl fmt::Display for IfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IfaceAddr {
    type Err = String;

    fn from_str(text: &str) -> Result<IfaceAddr, String> {
        let mut parts = text.splitn(2, '/');
        let addr = parts
            .next()
            .and_then(|a| a.parse::<Ipv4Addr>().ok())
            .ok_or_else(|| format!("bad interface address: {}", text))?;
        let prefix = match parts.next() {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 32)
                .ok_or_else(|| format!("bad network prefix: {}", text))?,
            None => 32,
        };
        Ok(IfaceAddr::new(addr, prefix))
    }
}
