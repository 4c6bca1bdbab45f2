/// Scheduling priority of a task; lower values are served first.
///
/// Premium requesters get `base - adjustment`, floored at zero.
pub fn compute_priority(base: u32, premium_adjustment: u32, premium: bool) -> u32 {
    if premium {
        base.saturating_sub(premium_adjustment)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_values() {
        assert_eq!(compute_priority(100, 50, false), 100);
        assert_eq!(compute_priority(100, 50, true), 50);
        assert_eq!(compute_priority(30, 50, true), 0);
    }

    proptest! {
        #[test]
        fn prop_premium_never_worse_and_never_negative(base in 0u32..10_000, adj in 1u32..10_000) {
            let premium = compute_priority(base, adj, true);
            let standard = compute_priority(base, adj, false);
            prop_assert!(premium <= standard);
            if base > 0 {
                prop_assert!(premium < standard);
            }
        }
    }
}
