//! Small combinatorial helpers.

/// Enumerate every subset of `input`, preserving element order within each subset.
///
/// With `skip_empty` the empty subset is left out.  The exhaustive projection/filter tests use this to cover every
/// combination of selected columns.
pub fn choices<T: Clone>(input: &[T], skip_empty: bool) -> Vec<Vec<T>> {
    let mut result = vec![];
    if input.is_empty() {
        return result;
    }

    let mut selector = vec![0u8; input.len()];
    if skip_empty {
        selector[0] = 1;
    }

    while *selector.last().unwrap_or(&2) <= 1 {
        let item: Vec<T> = selector
            .iter()
            .zip(input.iter())
            .filter(|(s, _)| **s > 0)
            .map(|(_, v)| v.clone())
            .collect();
        result.push(item);

        selector[0] += 1;
        for i in 0..selector.len() - 1 {
            if selector[i] > 1 {
                selector[i] = 0;
                selector[i + 1] += 1;
            }
        }
    }

    result
}
