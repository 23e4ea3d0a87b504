//! Random layer assignment.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Draws node levels from an exponential distribution.
///
/// Uses the formula: floor(-ln(uniform(0,1)) * m_L)
/// where m_L = 1/ln(M)
///
/// This gives an exponential distribution where the probability of
/// reaching layer L is roughly 1/M^L.
pub struct LevelGenerator {
    rng: Mutex<StdRng>,
    m_l: f64,
    max_layers: usize,
}

impl LevelGenerator {
    pub fn new(m: usize, max_layers: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            m_l: 1.0 / (m.max(2) as f64).ln(),
            max_layers: max_layers.max(1),
        }
    }

    /// Draw a level in `0..max_layers`.
    pub fn draw(&self) -> usize {
        // gen() is in [0, 1); flip it so ln never sees 0
        let uniform: f64 = 1.0 - self.rng.lock().gen::<f64>();
        let level = (-uniform.ln() * self.m_l).floor() as usize;
        level.min(self.max_layers - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_distribution() {
        let generator = LevelGenerator::new(16, 16, Some(7));
        let mut counts = vec![0usize; 16];

        for _ in 0..10000 {
            let level = generator.draw();
            assert!(level < 16);
            counts[level] += 1;
        }

        // ~15/16 of draws land on layer 0, ~1/16 on layer 1
        assert!(counts[0] > 9000);
        assert!(counts[0] > counts[1]);
        assert!(counts[1] > 0);
    }

    #[test]
    fn test_seeded_draws_repeat() {
        let a = LevelGenerator::new(4, 8, Some(42));
        let b = LevelGenerator::new(4, 8, Some(42));
        let da: Vec<usize> = (0..100).map(|_| a.draw()).collect();
        let db: Vec<usize> = (0..100).map(|_| b.draw()).collect();
        assert_eq!(da, db);
    }

    #[test]
    fn test_max_layers_caps_level() {
        let generator = LevelGenerator::new(2, 1, Some(1));
        assert!((0..1000).all(|_| generator.draw() == 0));
    }
}
