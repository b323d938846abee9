//! Interval algebra (C3): set operations over closed integer block ranges
//! `[lo, hi]`, used to track what has already been synced per filter.

pub type BlockRange = (u64, u64);

/// Merge overlapping/adjacent ranges into a minimal sorted, disjoint set.
pub fn union(ranges: &[BlockRange]) -> Vec<BlockRange> {
    if ranges.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<BlockRange> = ranges.to_vec();
    sorted.sort_by_key(|r| r.0);

    let mut out: Vec<BlockRange> = Vec::with_capacity(sorted.len());
    for (lo, hi) in sorted {
        if hi < lo {
            continue;
        }
        match out.last_mut() {
            Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                if hi > *last_hi {
                    *last_hi = hi;
                }
            }
            _ => out.push((lo, hi)),
        }
    }
    out
}

/// `xs - ys`: every block covered by `xs` but not by any range in `ys`.
pub fn difference(xs: &[BlockRange], ys: &[BlockRange]) -> Vec<BlockRange> {
    let xs = union(xs);
    let ys = union(ys);
    if ys.is_empty() {
        return xs;
    }

    let mut out = Vec::new();
    for (lo, hi) in xs {
        let mut cur_lo = lo;
        for &(ylo, yhi) in &ys {
            if cur_lo > hi {
                break;
            }
            if yhi < cur_lo || ylo > hi {
                continue;
            }
            if ylo > cur_lo {
                out.push((cur_lo, ylo - 1));
            }
            cur_lo = yhi.saturating_add(1);
        }
        if cur_lo <= hi {
            out.push((cur_lo, hi));
        }
    }
    out
}

/// Total number of blocks covered by a set of ranges (after implicit union).
pub fn sum(ranges: &[BlockRange]) -> u64 {
    union(ranges).iter().map(|&(lo, hi)| hi - lo + 1).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_merges_overlapping_and_adjacent() {
        assert_eq!(union(&[(1, 5), (3, 8), (10, 10), (11, 12)]), vec![(1, 8), (10, 12)]);
    }

    #[test]
    fn union_keeps_disjoint_gaps() {
        assert_eq!(union(&[(1, 2), (5, 6)]), vec![(1, 2), (5, 6)]);
    }

    #[test]
    fn union_is_commutative_in_effect() {
        let a = union(&[(1, 5), (10, 15), (3, 12)]);
        let b = union(&[(10, 15), (3, 12), (1, 5)]);
        assert_eq!(a, b);
    }

    #[test]
    fn difference_splits_a_hole() {
        assert_eq!(difference(&[(1, 10)], &[(4, 6)]), vec![(1, 3), (7, 10)]);
    }

    #[test]
    fn difference_with_no_overlap_is_identity() {
        assert_eq!(difference(&[(1, 10)], &[(20, 30)]), vec![(1, 10)]);
    }

    #[test]
    fn difference_full_coverage_is_empty() {
        assert_eq!(difference(&[(1, 10)], &[(0, 20)]), Vec::<BlockRange>::new());
    }

    #[test]
    fn sum_counts_inclusive_blocks() {
        assert_eq!(sum(&[(1, 1), (5, 10)]), 1 + 6);
    }

    #[test]
    fn sum_does_not_double_count_overlap() {
        assert_eq!(sum(&[(1, 10), (5, 15)]), 15);
    }

    #[test]
    fn difference_then_union_recovers_original_minus_hole() {
        let xs = vec![(1, 100)];
        let ys = vec![(40, 60)];
        let d = difference(&xs, &ys);
        let recombined = union(&[d.clone(), ys.clone()].concat());
        assert_eq!(recombined, union(&xs));
    }
}
