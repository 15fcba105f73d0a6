//! A node's view of the discovery tree on one interface: at most one
//! superior and a set of subordinates, each link carrying a weight (the
//! number of nodes reachable through it).

use std::fmt;
use std::net::SocketAddr;

use indexmap::IndexMap;

use crate::addr::Endpoint;
use crate::ifaddr::IfaceAddr;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HierarchyNode {
    socket_address: Endpoint,
    weight: u32,
}

impl HierarchyNode {
    pub fn new(socket_address: Endpoint, weight: u32) -> HierarchyNode {
        HierarchyNode {
            socket_address,
            weight,
        }
    }

    #[inline]
    pub fn socket_address(&self) -> &Endpoint {
        &self.socket_address
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl fmt::Display for HierarchyNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}*{}", self.socket_address, self.weight)
    }
}

/// A serializable snapshot of one hierarchy, reported over the control
/// surface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HierarchySnapshot {
    pub ifaddr: IfaceAddr,
    pub socket_address: Endpoint,
    pub superior: Option<(Endpoint, u32)>,
    pub subordinates: Vec<(Endpoint, u32)>,
}

pub struct Hierarchy {
    ifaddr: IfaceAddr,
    socket_address: Endpoint,
    superior: Option<HierarchyNode>,
    subordinates: IndexMap<Endpoint, u32>,
}

impl Hierarchy {
    pub fn new(ifaddr: IfaceAddr, port: u16) -> Hierarchy {
        let socket_address = Endpoint::Ip(SocketAddr::new(ifaddr.address().into(), port));
        Hierarchy {
            ifaddr,
            socket_address,
            superior: None,
            subordinates: IndexMap::new(),
        }
    }

    #[inline]
    pub fn interface_address(&self) -> IfaceAddr {
        self.ifaddr
    }

    #[inline]
    pub fn socket_address(&self) -> &Endpoint {
        &self.socket_address
    }

    #[inline]
    pub fn superior(&self) -> Option<&HierarchyNode> {
        self.superior.as_ref()
    }

    #[inline]
    pub fn has_superior(&self) -> bool {
        self.superior.is_some()
    }

    pub fn superior_is(&self, addr: &Endpoint) -> bool {
        self.superior
            .as_ref()
            .map(|s| s.socket_address() == addr)
            .unwrap_or(false)
    }

    /// Install a new superior. The address leaves the subordinate set if it
    /// was there. Returns false when nothing changed.
    pub fn set_superior(&mut self, addr: Endpoint) -> bool {
        if self.superior_is(&addr) {
            return false;
        }
        self.subordinates.shift_remove(&addr);
        self.superior = Some(HierarchyNode::new(addr, 0));
        true
    }

    pub fn remove_superior(&mut self) -> bool {
        self.superior.take().is_some()
    }

    pub fn set_superior_weight(&mut self, weight: u32) -> bool {
        match &mut self.superior {
            Some(superior) if superior.weight != weight => {
                superior.weight = weight;
                true
            }
            _ => false,
        }
    }

    /// A new subordinate starts with weight 1: itself, until it reports a
    /// bigger subtree.
    pub fn add_subordinate(&mut self, addr: Endpoint) -> bool {
        if self.superior_is(&addr) {
            return false;
        }
        match self.subordinates.get(&addr) {
            Some(_) => false,
            None => {
                self.subordinates.insert(addr, 1);
                true
            }
        }
    }

    pub fn remove_subordinate(&mut self, addr: &Endpoint) -> bool {
        self.subordinates.shift_remove(addr).is_some()
    }

    pub fn has_subordinate(&self, addr: &Endpoint) -> bool {
        self.subordinates.contains_key(addr)
    }

    pub fn set_subordinate_weight(&mut self, addr: &Endpoint, weight: u32) -> bool {
        match self.subordinates.get_mut(addr) {
            Some(current) if *current != weight => {
                *current = weight;
                true
            }
            _ => false,
        }
    }

    pub fn subordinate_weight(&self, addr: &Endpoint) -> Option<u32> {
        self.subordinates.get(addr).copied()
    }

    pub fn subordinates(&self) -> impl Iterator<Item = (&Endpoint, u32)> {
        self.subordinates.iter().map(|(addr, weight)| (addr, *weight))
    }

    #[inline]
    pub fn num_subordinates(&self) -> usize {
        self.subordinates.len()
    }

    #[inline]
    pub fn num_neighbours(&self) -> usize {
        self.num_subordinates() + usize::from(self.has_superior())
    }

    /// The size of the subtree rooted here: this node plus everything its
    /// subordinates report.
    pub fn subtree_weight(&self) -> u32 {
        1 + self.subordinates.values().sum::<u32>()
    }

    /// Every node this one has observed, in either direction.
    pub fn total_weight(&self) -> u32 {
        self.subtree_weight() + self.superior.as_ref().map(|s| s.weight).unwrap_or(0)
    }

    /// What we tell the superior: the subtree behind this link.
    pub fn superior_report(&self) -> u32 {
        self.subtree_weight()
    }

    /// What we tell subordinate `addr`: everything visible through us that
    /// is not behind its own link.
    pub fn subordinate_report(&self, addr: &Endpoint) -> u32 {
        let behind = self.subordinate_weight(addr).unwrap_or(0);
        self.total_weight().saturating_sub(behind)
    }

    pub fn snapshot(&self) -> HierarchySnapshot {
        HierarchySnapshot {
            ifaddr: self.ifaddr,
            socket_address: self.socket_address.clone(),
            superior: self
                .superior
                .as_ref()
                .map(|s| (s.socket_address.clone(), s.weight)),
            subordinates: self
                .subordinates
                .iter()
                .map(|(addr, weight)| (addr.clone(), *weight))
                .collect(),
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: ", self.socket_address)?;
        match &self.superior {
            Some(superior) => write!(f, "^{}", superior)?,
            None => write!(f, "^-")?,
        }
        for (addr, weight) in self.subordinates.iter() {
            write!(f, " v{}*{}", addr, weight)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(d: u8) -> Endpoint {
        Endpoint::v4(10, 0, 0, d, 5000)
    }

    fn hierarchy() -> Hierarchy {
        Hierarchy::new("10.0.0.2/16".parse().unwrap(), 5000)
    }

    #[test]
    fn test_superior_replaces_subordinate() {
        let mut h = hierarchy();
        assert!(h.add_subordinate(addr(1)));
        assert!(h.set_superior(addr(1)));
        assert!(!h.has_subordinate(&addr(1)));
        assert!(h.superior_is(&addr(1)));
        // same superior again changes nothing
        assert!(!h.set_superior(addr(1)));
    }

    #[test]
    fn test_subordinate_never_duplicates_superior() {
        let mut h = hierarchy();
        h.set_superior(addr(1));
        assert!(!h.add_subordinate(addr(1)));
        assert_eq!(h.num_neighbours(), 1);
    }

    #[test]
    fn test_weights() {
        // the node 2 of the eight-node tree: subordinates 4 (subtree 2) and
        // 5 (subtree 1), superior 1 reporting 4
        let mut h = hierarchy();
        h.set_superior(addr(1));
        h.add_subordinate(addr(4));
        h.add_subordinate(addr(5));
        assert!(h.set_subordinate_weight(&addr(4), 2));
        assert!(h.set_superior_weight(4));

        assert_eq!(h.subtree_weight(), 4);
        assert_eq!(h.total_weight(), 8);
        assert_eq!(h.superior_report(), 4);
        // node 4 sees everything except its own subtree
        assert_eq!(h.subordinate_report(&addr(4)), 6);
        assert_eq!(h.subordinate_report(&addr(5)), 7);
    }

    #[test]
    fn test_weight_updates_report_change() {
        let mut h = hierarchy();
        h.add_subordinate(addr(4));
        assert!(!h.set_subordinate_weight(&addr(4), 1));
        assert!(h.set_subordinate_weight(&addr(4), 3));
        assert!(!h.set_subordinate_weight(&addr(9), 3));
    }

    #[test]
    fn test_snapshot() {
        let mut h = hierarchy();
        h.set_superior(addr(1));
        h.add_subordinate(addr(4));
        let snapshot = h.snapshot();
        assert_eq!(snapshot.superior, Some((addr(1), 0)));
        assert_eq!(snapshot.subordinates, vec![(addr(4), 1)]);
    }
}
