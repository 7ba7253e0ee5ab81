//! Weight-balanced splitting of work into task-sized blocks.

use crate::error::{FarmError, Result};

/// Consecutive items and their summed weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedBlock<T> {
    pub items: Vec<T>,
    pub weight: f64,
}

impl<T> WeightedBlock<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            weight: 0.0,
        }
    }

    fn push(&mut self, item: T, weight: f64) {
        self.items.push(item);
        self.weight += weight;
    }
}

/// Cut `items` into blocks whose weight does not exceed `max_weight`.
///
/// An item heavier than `max_weight` gets a block of its own.
pub fn block_splitter<T, W>(
    items: impl IntoIterator<Item = T>,
    max_weight: f64,
    weight: W,
) -> Result<Vec<WeightedBlock<T>>>
where
    W: Fn(&T) -> f64,
{
    if max_weight <= 0.0 || max_weight.is_nan() {
        return Err(FarmError::InvalidArgument(format!(
            "max_weight={}",
            max_weight
        )));
    }
    let mut blocks = Vec::new();
    let mut current = WeightedBlock::new();
    for item in items {
        let w = weight(&item);
        if w < 0.0 || w.is_nan() {
            return Err(FarmError::InvalidArgument(format!(
                "an item got a negative weight {}",
                w
            )));
        }
        if !current.items.is_empty() && current.weight + w > max_weight {
            blocks.push(std::mem::replace(&mut current, WeightedBlock::new()));
        }
        current.push(item, w);
    }
    if !current.items.is_empty() {
        blocks.push(current);
    }
    Ok(blocks)
}

/// Split `items` into roughly `hint` blocks of similar weight.
pub fn split_in_blocks<T, W>(items: Vec<T>, hint: usize, weight: W) -> Result<Vec<WeightedBlock<T>>>
where
    W: Fn(&T) -> f64,
{
    if hint == 0 {
        return Err(FarmError::InvalidArgument("hint must be positive".into()));
    }
    let total: f64 = items.iter().map(&weight).sum();
    let max_weight = (total / hint as f64).ceil();
    // all-zero weights end up in a single block
    let max_weight = if max_weight > 0.0 { max_weight } else { 1.0 };
    block_splitter(items, max_weight, weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_splitter_unit_weights() {
        let blocks = block_splitter(1..=5, 2.0, |_| 1.0).unwrap();
        let items: Vec<Vec<i32>> = blocks.iter().map(|b| b.items.clone()).collect();
        assert_eq!(items, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(blocks[2].weight, 1.0);
    }

    #[test]
    fn test_heavy_item_gets_own_block() {
        let blocks = block_splitter(vec![1.0, 10.0, 1.0, 1.0], 3.0, |w| *w).unwrap();
        let weights: Vec<f64> = blocks.iter().map(|b| b.weight).collect();
        assert_eq!(weights, vec![1.0, 10.0, 2.0]);
    }

    #[test]
    fn test_invalid_weights() {
        assert!(block_splitter(vec![1], 0.0, |_| 1.0).is_err());
        assert!(block_splitter(vec![1], 1.0, |_| -1.0).is_err());
        assert!(split_in_blocks(vec![1], 0, |_| 1.0).is_err());
    }

    #[test]
    fn test_split_in_blocks() {
        let items: Vec<u32> = (0..10).collect();
        let blocks = split_in_blocks(items, 3, |_| 1.0).unwrap();
        // ceil(10 / 3) = 4 items per block
        let sizes: Vec<usize> = blocks.iter().map(|b| b.items.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        let all: Vec<u32> = blocks.into_iter().flat_map(|b| b.items).collect();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_zero_weights_and_empty() {
        let blocks = split_in_blocks(vec!['a', 'b', 'c'], 2, |_| 0.0).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(split_in_blocks(Vec::<u8>::new(), 4, |_| 1.0).unwrap().is_empty());
    }
}
