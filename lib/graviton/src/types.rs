use hashbrown::HashMap;

use crate::kernel::KernelBox;

/// Reserved wire type of an application's main kernel; its downstream
/// arrival at the parent process signals application completion.
pub const MAIN_KERNEL_TYPE: u16 = 1;

/// Maps wire type ids to constructor functions so the receiving side can
/// rebuild kernels polymorphically. Frozen after factory assembly; no
/// global state.
pub struct TypeRegistry {
    constructors: HashMap<u16, fn() -> KernelBox>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            constructors: HashMap::new(),
        }
    }

    /// Register a constructor for `type_id`. Type 0 is reserved for
    /// non-mobile kernels and duplicate registrations are programmer error.
    pub fn register(&mut self, type_id: u16, constructor: fn() -> KernelBox) {
        if type_id == 0 {
            panic!("Type id 0 is reserved for non-mobile kernels");
        }
        if self.constructors.insert(type_id, constructor).is_some() {
            panic!("Duplicate kernel type id {}", type_id);
        }
    }

    #[inline]
    pub fn construct(&self, type_id: u16) -> Option<KernelBox> {
        self.constructors.get(&type_id).map(|ctor| ctor())
    }

    #[inline]
    pub fn contains(&self, type_id: u16) -> bool {
        self.constructors.contains_key(&type_id)
    }
}

impl Default for TypeRegistry {
    fn default() -> TypeRegistry {
        TypeRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Header, Kernel};
    use crate::kernel_cast;

    struct Probe(Header);

    impl Kernel for Probe {
        fn header(&self) -> &Header {
            &self.0
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.0
        }

        fn wire_type(&self) -> u16 {
            9
        }

        kernel_cast!();
    }

    #[test]
    fn test_register_and_construct() {
        let mut types = TypeRegistry::new();
        types.register(9, || Box::new(Probe(Header::new())));
        assert!(types.contains(9));
        let k = types.construct(9).unwrap();
        assert_eq!(k.wire_type(), 9);
        assert!(types.construct(10).is_none());
    }

    #[test]
    #[should_panic]
    fn test_duplicate_registration_panics() {
        let mut types = TypeRegistry::new();
        types.register(9, || Box::new(Probe(Header::new())));
        types.register(9, || Box::new(Probe(Header::new())));
    }
}
