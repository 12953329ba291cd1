//! Temperature sampling over a probability vector
//!
//! Probabilities are raised to `1 / T` and renormalized, computed in log
//! space with the maximum subtracted first. `T <= 0` (or NaN) picks the most
//! likely symbol, ties going to the lowest index. `T = +inf` is uniform.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Smallest probability considered before taking logs
const MIN_PROBABILITY: f32 = 1e-12;

/// Seedable categorical sampler
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Sampler with a fixed seed, or one from OS entropy
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Draw an index from `probabilities` at `temperature`
    pub fn sample(&mut self, probabilities: &[f32], temperature: f32) -> usize {
        if temperature.is_nan() || temperature <= 0.0 {
            return argmax(probabilities);
        }

        let logits: Vec<f32> = probabilities
            .iter()
            .map(|&p| p.max(MIN_PROBABILITY).ln() / temperature)
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();

        match WeightedIndex::new(&weights) {
            Ok(distribution) => distribution.sample(&mut self.rng),
            Err(_) => argmax(probabilities),
        }
    }
}

/// Index of the largest value; the first one wins ties, NaN never wins
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (index, &value) in values.iter().enumerate() {
        if value > values[best] || values[best].is_nan() {
            best = index;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_temperature_is_argmax() {
        let mut sampler = Sampler::new(None);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.1, 0.6, 0.3], 0.0), 1);
        }
    }

    #[test]
    fn test_argmax_ties_pick_lowest() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), 1);
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[f32::NAN, 0.1]), 1);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let probabilities = [0.2, 0.3, 0.5];
        let mut a = Sampler::new(Some(42));
        let mut b = Sampler::new(Some(42));
        let first: Vec<usize> = (0..50).map(|_| a.sample(&probabilities, 1.0)).collect();
        let second: Vec<usize> = (0..50).map(|_| b.sample(&probabilities, 1.0)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_probability_not_sampled_at_low_temperature() {
        // A zero probability keeps a tiny floor, which low temperature crushes
        let mut sampler = Sampler::new(Some(1));
        for _ in 0..200 {
            assert_ne!(sampler.sample(&[0.0, 1.0], 0.1), 0);
        }
    }

    #[test]
    fn test_low_temperature_sharpens() {
        let probabilities = [0.4, 0.6];
        let mut sampler = Sampler::new(Some(9));
        let hits = (0..1000)
            .filter(|_| sampler.sample(&probabilities, 0.05) == 1)
            .count();
        assert!(hits > 990, "hits = {hits}");
    }

    #[test]
    fn test_high_temperature_flattens() {
        let probabilities = [0.1, 0.9];
        let mut sampler = Sampler::new(Some(3));
        let hits = (0..2000)
            .filter(|_| sampler.sample(&probabilities, 100.0) == 0)
            .count();
        // Close to a fair coin
        assert!((800..1200).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn test_infinite_temperature_is_uniform() {
        let probabilities = [0.01, 0.99];
        let mut sampler = Sampler::new(Some(5));
        let hits = (0..2000)
            .filter(|_| sampler.sample(&probabilities, f32::INFINITY) == 0)
            .count();
        assert!((850..1150).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn test_nan_temperature_is_argmax() {
        let mut sampler = Sampler::new(Some(5));
        assert_eq!(sampler.sample(&[0.3, 0.7], f32::NAN), 1);
    }
}
