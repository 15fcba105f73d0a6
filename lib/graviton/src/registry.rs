use std::sync::Mutex;

use hashbrown::HashMap;

use quark::logging::{self, Logger};

use crate::kernel::{Kernel, KernelBox, KernelId};

enum Slot {
    /// The kernel is owned by the registry, waiting for children.
    Present(KernelBox),
    /// The kernel is temporarily out, being dispatched by a worker. The id
    /// stays claimed so concurrent lookups do not mistake it for missing.
    Busy,
}

/// Result of taking a kernel out of the registry for dispatch.
pub enum Checkout {
    Kernel(KernelBox),
    Busy,
    Missing,
}

/// The process-wide `id -> kernel` table. A kernel lives here while it has
/// outstanding children that have not yet returned; no two entries ever
/// share an id.
pub struct InstanceRegistry {
    instances: Mutex<HashMap<KernelId, Slot>>,
    log: Logger,
}

impl InstanceRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> InstanceRegistry {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        InstanceRegistry {
            instances: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Store a kernel under its id. Rejects unidentifiable kernels and
    /// duplicate ids; the rejected kernel is handed back.
    pub fn insert(&self, kernel: KernelBox) -> Result<(), KernelBox> {
        let id = kernel.header().id();
        if id == 0 {
            return Err(kernel);
        }
        let mut instances = self.lock();
        match instances.get(&id) {
            None | Some(Slot::Busy) => {
                instances.insert(id, Slot::Present(kernel));
                logging::trace!(self.log, "register instance"; "id" => id);
                Ok(())
            }
            Some(Slot::Present(_)) => {
                logging::error!(self.log, "duplicate instance id"; "id" => id);
                Err(kernel)
            }
        }
    }

    /// Take the kernel out for dispatch, leaving the id claimed. The caller
    /// must follow up with `checkin` or `erase`.
    pub fn checkout(&self, id: KernelId) -> Checkout {
        let mut instances = self.lock();
        match instances.get_mut(&id) {
            None => Checkout::Missing,
            Some(slot @ Slot::Present(_)) => {
                let taken = std::mem::replace(slot, Slot::Busy);
                match taken {
                    Slot::Present(kernel) => Checkout::Kernel(kernel),
                    Slot::Busy => unreachable!(),
                }
            }
            Some(Slot::Busy) => Checkout::Busy,
        }
    }

    /// Return a checked-out kernel.
    pub fn checkin(&self, kernel: KernelBox) {
        let id = kernel.header().id();
        let mut instances = self.lock();
        instances.insert(id, Slot::Present(kernel));
    }

    /// Release an id for good (checked-out or resident).
    pub fn erase(&self, id: KernelId) {
        let mut instances = self.lock();
        instances.remove(&id);
        logging::trace!(self.log, "erase instance"; "id" => id);
    }

    pub fn contains(&self, id: KernelId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every resident kernel. Used at teardown.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<HashMap<KernelId, Slot>> {
        match self.instances.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Header, Kernel};
    use crate::kernel_cast;

    struct Waiting(Header);

    impl Kernel for Waiting {
        fn header(&self) -> &Header {
            &self.0
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.0
        }

        kernel_cast!();
    }

    fn waiting(id: u64) -> KernelBox {
        let mut header = Header::new();
        header.set_id(id);
        Box::new(Waiting(header))
    }

    #[test]
    fn test_insert_checkout_checkin() {
        let registry = InstanceRegistry::new(None);
        registry.insert(waiting(7)).ok().unwrap();
        assert!(registry.contains(7));

        let kernel = match registry.checkout(7) {
            Checkout::Kernel(k) => k,
            _ => panic!("Expected a kernel"),
        };
        // id stays claimed while the kernel is out
        assert!(registry.contains(7));
        assert!(matches!(registry.checkout(7), Checkout::Busy));

        registry.checkin(kernel);
        assert!(matches!(registry.checkout(7), Checkout::Kernel(_)));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let registry = InstanceRegistry::new(None);
        registry.insert(waiting(7)).ok().unwrap();
        assert!(registry.insert(waiting(7)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unidentified_kernel_is_rejected() {
        let registry = InstanceRegistry::new(None);
        assert!(registry.insert(waiting(0)).is_err());
    }

    #[test]
    fn test_erase() {
        let registry = InstanceRegistry::new(None);
        registry.insert(waiting(7)).ok().unwrap();
        registry.erase(7);
        assert!(matches!(registry.checkout(7), Checkout::Missing));
    }
}
