//! Generic sparse octree node.
//!
//! A node owns its payload and, optionally, one slot array of 8 children.
//! The slot array is allocated on the first child and freed with the last,
//! so `has_children()` is a constant-time check on the array.

/// Child slot array of a node.
pub type ChildSlots<P> = [Option<Box<OcTreeNode<P>>>; 8];

#[derive(Debug, Clone, PartialEq)]
pub struct OcTreeNode<P> {
    payload: P,
    children: Option<Box<ChildSlots<P>>>,
}

impl<P: Default> Default for OcTreeNode<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P> OcTreeNode<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            children: None,
        }
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    /// True if at least one child exists.
    #[inline]
    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    pub fn child_exists(&self, index: usize) -> bool {
        self.child(index).is_some()
    }

    pub fn child(&self, index: usize) -> Option<&OcTreeNode<P>> {
        self.children.as_ref()?.get(index)?.as_deref()
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut OcTreeNode<P>> {
        self.children.as_mut()?.get_mut(index)?.as_deref_mut()
    }

    /// Number of existing children (0..=8).
    pub fn num_children(&self) -> usize {
        self.children().count()
    }

    /// Existing children with their slot index.
    pub fn children(&self) -> impl Iterator<Item = (usize, &OcTreeNode<P>)> {
        self.children
            .iter()
            .flat_map(|slots| slots.iter().enumerate())
            .filter_map(|(i, slot)| slot.as_deref().map(|child| (i, child)))
    }

    /// Mutable access to every slot (existing or not).
    pub fn children_mut(&mut self) -> impl Iterator<Item = (usize, &mut OcTreeNode<P>)> {
        self.children
            .iter_mut()
            .flat_map(|slots| slots.iter_mut().enumerate())
            .filter_map(|(i, slot)| slot.as_deref_mut().map(|child| (i, child)))
    }

    /// Create (or replace) the child at `index` and return it.
    pub fn create_child(&mut self, index: usize, payload: P) -> &mut OcTreeNode<P> {
        debug_assert!(index < 8);
        let slots = self
            .children
            .get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        slots[index].insert(Box::new(OcTreeNode::new(payload)))
    }

    /// Remove the child at `index`; frees the slot array with the last child.
    pub fn delete_child(&mut self, index: usize) -> Option<Box<OcTreeNode<P>>> {
        let slots = self.children.as_mut()?;
        let removed = slots.get_mut(index)?.take();
        if slots.iter().all(Option::is_none) {
            self.children = None;
        }
        removed
    }

    /// Allocate all 8 children at once. The node must be childless.
    pub fn set_all_children(&mut self, mut make: impl FnMut(usize) -> P) {
        debug_assert!(self.children.is_none(), "expanding a node that has children");
        self.children = Some(Box::new(std::array::from_fn(|i| {
            Some(Box::new(OcTreeNode::new(make(i))))
        })));
    }

    /// Detach the whole slot array, leaving the node childless.
    pub fn take_children(&mut self) -> Option<Box<ChildSlots<P>>> {
        self.children.take()
    }
}
