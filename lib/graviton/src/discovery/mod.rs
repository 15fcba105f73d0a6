//! Hierarchical cluster discovery: every interface address runs a
//! discoverer kernel that elects a superior among the tree ancestors laid
//! over the interface's address range, maintains the subordinate set, and
//! keeps link weights flowing so the socket pipeline can balance fan-out.

pub mod discoverer;
pub mod hierarchy;
pub mod kernels;
pub mod master;
pub mod tree;


pub use discoverer::Discoverer;
pub use hierarchy::{Hierarchy, HierarchyNode, HierarchySnapshot};
pub use kernels::{HierarchyKernel, Probe, StatusKernel, TerminateKernel};
pub use master::{MasterProperties, NetworkMaster};
pub use tree::TreePosition;
