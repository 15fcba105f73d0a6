//! Coordinates in the fanout-ary tree laid over an address range. Linear
//! positions are 1-based: position 1 is the root, positions 2..=1+fanout
//! its children, and so on layer by layer.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TreePosition {
    layer: u64,
    offset: u64,
    fanout: u64,
}

impl TreePosition {
    pub fn from_linear(mut linear: u64, fanout: u64) -> TreePosition {
        assert!(linear >= 1, "Linear positions are 1-based");
        assert!(fanout >= 1, "Fanout must be positive");
        let mut layer = 0;
        let mut layer_size = 1;
        while linear > layer_size {
            linear -= layer_size;
            layer += 1;
            layer_size *= fanout;
        }
        TreePosition {
            layer,
            offset: linear - 1,
            fanout,
        }
    }

    pub fn to_linear(&self) -> u64 {
        let mut position = 0;
        let mut layer_size = 1;
        for _ in 0..self.layer {
            position += layer_size;
            layer_size *= self.fanout;
        }
        position + self.offset + 1
    }

    #[inline]
    pub fn layer(&self) -> u64 {
        self.layer
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The parent coordinate, or `None` at the root.
    pub fn parent(&self) -> Option<TreePosition> {
        if self.layer == 0 {
            return None;
        }
        Some(TreePosition {
            layer: self.layer - 1,
            offset: self.offset / self.fanout,
            fanout: self.fanout,
        })
    }

    /// Linear positions of every ancestor, nearest first, ending at the
    /// root.
    pub fn ancestors(&self) -> Vec<u64> {
        let mut result = Vec::new();
        let mut cursor = *self;
        while let Some(parent) = cursor.parent() {
            result.push(parent.to_linear());
            cursor = parent;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_roundtrip() {
        for fanout in 1..=4u64 {
            for linear in 1..=40u64 {
                let position = TreePosition::from_linear(linear, fanout);
                assert_eq!(position.to_linear(), linear, "fanout={}", fanout);
            }
        }
    }

    #[test]
    fn test_layers_fanout_two() {
        assert_eq!(TreePosition::from_linear(1, 2).layer(), 0);
        assert_eq!(TreePosition::from_linear(2, 2).layer(), 1);
        assert_eq!(TreePosition::from_linear(3, 2).layer(), 1);
        assert_eq!(TreePosition::from_linear(4, 2).layer(), 2);
        assert_eq!(TreePosition::from_linear(7, 2).layer(), 2);
        assert_eq!(TreePosition::from_linear(8, 2).layer(), 3);
    }

    #[test]
    fn test_parents_form_a_heap() {
        // the eight-node, fanout-2 tree: 1 <- {2,3}, 2 <- {4,5}, 3 <- {6,7},
        // 4 <- {8}
        let parent_of = |n: u64| {
            TreePosition::from_linear(n, 2)
                .parent()
                .map(|p| p.to_linear())
        };
        assert_eq!(parent_of(1), None);
        assert_eq!(parent_of(2), Some(1));
        assert_eq!(parent_of(3), Some(1));
        assert_eq!(parent_of(4), Some(2));
        assert_eq!(parent_of(5), Some(2));
        assert_eq!(parent_of(6), Some(3));
        assert_eq!(parent_of(7), Some(3));
        assert_eq!(parent_of(8), Some(4));
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(TreePosition::from_linear(8, 2).ancestors(), vec![4, 2, 1]);
        assert_eq!(TreePosition::from_linear(3, 2).ancestors(), vec![1]);
        assert!(TreePosition::from_linear(1, 2).ancestors().is_empty());
    }
}
