use kbsearch_core::config::ReorderStrategy;

/// Rearrange an already ranked list for presentation.
///
/// `LongContext` puts the strongest items at both ends and the weakest in
/// the middle: `[1,2,3,4,5,6] -> [1,3,5,6,4,2]`.
pub fn reorder<T>(items: Vec<T>, strategy: ReorderStrategy) -> Vec<T> {
    match strategy {
        ReorderStrategy::None => items,
        ReorderStrategy::LongContext => long_context(items),
    }
}

fn long_context<T>(items: Vec<T>) -> Vec<T> {
    if items.len() <= 2 {
        return items;
    }
    let mut front = Vec::with_capacity(items.len());
    let mut back = Vec::with_capacity(items.len() / 2);
    for (i, item) in items.into_iter().enumerate() {
        if i % 2 == 0 {
            front.push(item);
        } else {
            back.push(item);
        }
    }
    front.extend(back.into_iter().rev());
    front
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn long_context_alternates_ends() {
        assert_eq!(reorder(vec![1, 2, 3, 4, 5, 6], ReorderStrategy::LongContext), vec![1, 3, 5, 6, 4, 2]);
        assert_eq!(reorder(vec![1, 2, 3, 4, 5], ReorderStrategy::LongContext), vec![1, 3, 5, 4, 2]);
        assert_eq!(reorder(vec![1, 2], ReorderStrategy::LongContext), vec![1, 2]);
        assert_eq!(reorder(vec![1, 2, 3], ReorderStrategy::None), vec![1, 2, 3]);
    }

    proptest! {
        #[test]
        fn reorder_is_a_permutation(items in prop::collection::vec(any::<u32>(), 0..64)) {
            let mut out = reorder(items.clone(), ReorderStrategy::LongContext);
            prop_assert_eq!(out.len(), items.len());
            if let Some(first) = items.first() {
                prop_assert_eq!(out.first(), Some(first));
            }
            let mut sorted = items;
            sorted.sort_unstable();
            out.sort_unstable();
            prop_assert_eq!(out, sorted);
        }
    }
}
