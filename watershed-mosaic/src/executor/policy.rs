//! Scheduling priority.

/// Scheduling priority of a batch task. Higher values run first.
///
/// Batches are submitted in descending area order and each gets the
/// priority `-index`, so larger batches start first whenever every worker is
/// busy.
///
/// # Example
///
/// ```ignore
/// use watershed_mosaic::executor::Priority;
///
/// assert!(Priority::for_index(0) > Priority::for_index(1));
/// assert_eq!(Priority::for_index(3).value(), -3);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub i64);

impl Priority {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Priority of the batch at position `index` of the submission order.
    pub fn for_index(index: usize) -> Self {
        Self(-(index as i64))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}
