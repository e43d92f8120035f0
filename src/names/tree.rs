//! Radix tree keyed by vendor ID
//!
//! Four levels of sixteen-way fan-out, one per nibble of the 16-bit vendor
//! ID, most significant nibble first. Internal nodes are created on demand;
//! the fourth level holds the vendor leaves.

/// Tree depth, one level per vendor ID nibble
const LEVELS: u32 = 4;

#[inline]
fn nibble(vendor: u16, depth: u32) -> usize {
    ((vendor >> (4 * (LEVELS - 1 - depth))) & 0x0f) as usize
}

/// One device or subsystem line of the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub device_id: u16,
    /// `MATCH_ANY` for plain device lines
    pub subvendor_id: u32,
    /// `MATCH_ANY` for plain device lines
    pub subdevice_id: u32,
    pub name: String,
}

/// Everything known about one vendor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorLeaf {
    pub vendor: u16,
    pub name: Option<String>,
    /// In database order, device lines before their subsystem lines
    pub devices: Vec<DeviceEntry>,
}

impl VendorLeaf {
    fn new(vendor: u16) -> Self {
        VendorLeaf {
            vendor,
            name: None,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Node {
    Internal(Box<[Option<Box<Node>>; 16]>),
    Leaf(VendorLeaf),
}

impl Node {
    /// Fresh node for `depth`: a leaf at the bottom, empty fan-out above
    fn for_depth(vendor: u16, depth: u32) -> Node {
        if depth == LEVELS {
            Node::Leaf(VendorLeaf::new(vendor))
        } else {
            Node::Internal(Box::default())
        }
    }

    fn find(&self, vendor: u16, depth: u32) -> Option<&VendorLeaf> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(children) => children[nibble(vendor, depth)]
                .as_deref()?
                .find(vendor, depth + 1),
        }
    }

    fn descend(&mut self, vendor: u16, depth: u32) -> &mut VendorLeaf {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Internal(children) => children[nibble(vendor, depth)]
                .get_or_insert_with(|| Box::new(Node::for_depth(vendor, depth + 1)))
                .descend(vendor, depth + 1),
        }
    }
}

/// Vendor index
#[derive(Debug)]
pub struct NameTree {
    root: Node,
}

impl Default for NameTree {
    fn default() -> Self {
        NameTree::new()
    }
}

impl NameTree {
    pub fn new() -> Self {
        NameTree {
            root: Node::for_depth(0, 0),
        }
    }

    /// Leaf for `vendor` if it has been created
    pub fn get(&self, vendor: u16) -> Option<&VendorLeaf> {
        self.root.find(vendor, 0)
    }

    /// Leaf for `vendor`, creating the path to it if needed
    pub fn insert(&mut self, vendor: u16) -> &mut VendorLeaf {
        self.root.descend(vendor, 0)
    }

    /// Drop every node
    pub fn clear(&mut self) {
        self.root = Node::for_depth(0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_order() {
        assert_eq!(nibble(0x1234, 0), 1);
        assert_eq!(nibble(0x1234, 1), 2);
        assert_eq!(nibble(0x1234, 2), 3);
        assert_eq!(nibble(0x1234, 3), 4);
    }

    #[test]
    fn test_insert_then_get() {
        let mut tree = NameTree::new();
        assert!(tree.get(0x8086).is_none());

        tree.insert(0x8086).name = Some("Intel Corporation".into());
        tree.insert(0x8087);

        assert_eq!(tree.get(0x8086).and_then(|l| l.name.as_deref()), Some("Intel Corporation"));
        assert_eq!(tree.get(0x8087).map(|l| l.vendor), Some(0x8087));
        assert!(tree.get(0x8088).is_none());

        // Same leaf comes back, contents intact
        assert_eq!(tree.insert(0x8086).name.as_deref(), Some("Intel Corporation"));

        tree.clear();
        assert!(tree.get(0x8086).is_none());
    }
}
