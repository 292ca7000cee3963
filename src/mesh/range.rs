//! Splittable iteration ranges for fork-join traversal.

/// A contiguous, splittable view over a traversal population (element ids,
/// node ids).
///
/// Ranges only borrow the population; splitting produces two disjoint halves
/// of the same slice. A range at or below its grain size refuses to split,
/// which is what bounds the recursion in the parallel driver.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRange<'a, T> {
    items: &'a [T],
    grain: usize,
}

/// The element population of one traversal.
pub type ElementRange<'a> = PartitionRange<'a, crate::mesh::ElementId>;

/// The node population of one nodal traversal.
pub type NodeRange<'a> = PartitionRange<'a, crate::mesh::NodeId>;

impl<'a, T> PartitionRange<'a, T> {
    /// A range over `items` that stops splitting at `grain` items. A grain
    /// of zero is treated as one.
    pub fn new(items: &'a [T], grain: usize) -> Self {
        Self {
            items,
            grain: grain.max(1),
        }
    }

    /// A range that never splits, for serial traversal.
    pub fn serial(items: &'a [T]) -> Self {
        Self {
            items,
            grain: usize::MAX,
        }
    }

    pub fn items(&self) -> &'a [T] {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn grain(&self) -> usize {
        self.grain
    }

    /// Split into two non-empty halves, or `None` if the range is already at
    /// grain size.
    pub fn try_split(&self) -> Option<(Self, Self)> {
        if self.items.len() <= self.grain {
            return None;
        }
        let mid = self.items.len() / 2;
        let (left, right) = self.items.split_at(mid);
        Some((
            Self {
                items: left,
                grain: self.grain,
            },
            Self {
                items: right,
                grain: self.grain,
            },
        ))
    }
}
