/// Random-access source of samples for one image domain.
pub trait Dataset {
    type Item: Clone;

    fn len(&self) -> usize;

    /// Returns the sample at `idx` (panics if out of bounds).
    fn get(&self, idx: usize) -> Self::Item;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Dataset for Vec<T> {
    type Item = T;

    #[inline]
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    fn get(&self, idx: usize) -> T {
        self[idx].clone()
    }
}
