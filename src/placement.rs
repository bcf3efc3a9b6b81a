//! New entries go to a writable cache picked at random, weighted by
//! free space, so that caches fill up at roughly the same rate
//! without any shared accounting.
//!
//! The choice itself is a pure function of the free space of each
//! candidate and a random draw, so it can be tested by fixing the
//! draw.

/// Maps `draw`, in `[0, sum(free))`, to the index of the candidate
/// whose cumulative free space interval covers it.  Candidates with
/// no free space are never picked.
///
/// Returns `None` when `draw` is out of range, which includes the
/// case where no candidate has any free space.
pub fn choose_weighted(free: &[u64], draw: u128) -> Option<usize> {
    let mut remaining = draw;

    for (index, &space) in free.iter().enumerate() {
        let space = space as u128;
        if remaining < space {
            return Some(index);
        }

        remaining -= space;
    }

    None
}

/// Picks a candidate index at random, weighted by `free`.  When no
/// candidate reports any free space, picks uniformly: the numbers
/// are probably wrong, and some cache is better than none.
///
/// Returns `None` only for an empty candidate list.
pub fn pick(free: &[u64]) -> Option<usize> {
    use rand::Rng;

    if free.is_empty() {
        return None;
    }

    let total: u128 = free.iter().map(|&space| space as u128).sum();
    let mut rnd = rand::thread_rng();
    if total == 0 {
        return Some(rnd.gen_range(0..free.len()));
    }

    choose_weighted(free, rnd.gen_range(0..total))
}

#[test]
fn test_choose_weighted() {
    let free = [10, 0, 5];

    assert_eq!(choose_weighted(&free, 0), Some(0));
    assert_eq!(choose_weighted(&free, 9), Some(0));
    // The empty cache is skipped.
    assert_eq!(choose_weighted(&free, 10), Some(2));
    assert_eq!(choose_weighted(&free, 14), Some(2));
    assert_eq!(choose_weighted(&free, 15), None);

    assert_eq!(choose_weighted(&[], 0), None);
    assert_eq!(choose_weighted(&[0, 0], 0), None);
}

#[test]
fn test_pick_single() {
    assert_eq!(pick(&[]), None);
    assert_eq!(pick(&[0]), Some(0));
    assert_eq!(pick(&[100]), Some(0));
    // The only cache with free space always wins.
    for _ in 0..100 {
        assert_eq!(pick(&[0, 100, 0]), Some(1));
    }
}

#[test]
fn test_pick_large() {
    // Sums past u64::MAX must not overflow.
    let free = [u64::MAX, u64::MAX];
    for _ in 0..100 {
        assert!(pick(&free).is_some());
    }
}
