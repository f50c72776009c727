//! Single-assignment completion cell.

use std::cell::RefCell;

/// A cell that is either empty or holds one value.
///
/// Filling a full cell is refused; taking empties it again.
#[derive(Debug)]
pub struct FullEmpty<T> {
    value: RefCell<Option<T>>,
}

impl<T> Default for FullEmpty<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FullEmpty<T> {
    pub fn new() -> Self {
        Self {
            value: RefCell::new(None),
        }
    }

    /// Stores `value`, or hands it back if the cell is already full.
    pub fn fill(&self, value: T) -> Result<(), T> {
        let mut slot = self.value.borrow_mut();
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(value);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Empties the cell.
    pub fn take(&self) -> Option<T> {
        self.value.borrow_mut().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_once() {
        let cell = FullEmpty::new();
        assert!(!cell.is_full());
        cell.fill(1).unwrap();
        assert_eq!(cell.fill(2), Err(2));
        assert!(cell.is_full());
        assert_eq!(cell.take(), Some(1));
        assert_eq!(cell.take(), None);
        cell.fill(3).unwrap();
        assert_eq!(cell.take(), Some(3));
    }
}
