/// Halving used by the divide-and-conquer fan-out over independent work.
pub(crate) trait SplitAtHalf: Sized {
    fn split_at_half(self) -> (Self, Self);
}

impl<T> SplitAtHalf for &[T] {
    #[inline]
    fn split_at_half(self) -> (Self, Self) {
        self.split_at(self.len() / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::SplitAtHalf;

    #[test]
    fn halves_cover_the_slice() {
        let items = [1, 2, 3, 4, 5];
        let (lhs, rhs) = items.as_slice().split_at_half();
        assert_eq!(lhs, &[1, 2]);
        assert_eq!(rhs, &[3, 4, 5]);
        let (lhs, rhs) = [7].as_slice().split_at_half();
        assert!(lhs.is_empty());
        assert_eq!(rhs, &[7]);
    }
}
