use crate::{Error, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Weight initialization strategies.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WeightInit {
    /// Uniform in `+/- sqrt(scale / (fan_in + fan_out))`. Scale is usually 6.
    Xavier { scale: f32 },
    /// Uniform in `+/- scale / sqrt(fan_in)`. Scale is usually 1.
    Lecun { scale: f32 },
    /// Normal with mean 0.
    Gaussian { sigma: f32 },
    /// Normal with `sigma = sqrt(scale / fan_in)`. Scale is usually 2.
    He { scale: f32 },
    Constant(f32),
}

impl WeightInit {
    pub fn xavier() -> Self {
        Self::Xavier { scale: 6. }
    }
    pub fn lecun() -> Self {
        Self::Lecun { scale: 1. }
    }
    pub fn he() -> Self {
        Self::He { scale: 2. }
    }
    /// Checks that the parameter is finite, and for random fills, not
    /// negative.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::Config`] otherwise.
    pub fn validate(&self) -> Result<()> {
        let (name, value, signed) = match *self {
            Self::Xavier { scale } => ("scale", scale, false),
            Self::Lecun { scale } => ("scale", scale, false),
            Self::Gaussian { sigma } => ("sigma", sigma, false),
            Self::He { scale } => ("scale", scale, false),
            Self::Constant(value) => ("value", value, true),
        };
        if value.is_finite() && (signed || value >= 0.) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "weight init {self:?} has invalid {name} {value}"
            )))
        }
    }
    /// Overwrites `values`.
    ///
    /// Random fills with an invalid parameter, see [`validate`](Self::validate),
    /// write zeros.
    pub fn fill<R: Rng + ?Sized>(
        &self,
        values: &mut [f32],
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) {
        let fan_in = fan_in.max(1) as f32;
        let fan_out = fan_out as f32;
        match *self {
            Self::Xavier { scale } => {
                fill_uniform(values, (scale / (fan_in + fan_out)).sqrt(), rng);
            }
            Self::Lecun { scale } => {
                fill_uniform(values, scale / fan_in.sqrt(), rng);
            }
            Self::Gaussian { sigma } => fill_normal(values, sigma, rng),
            Self::He { scale } => fill_normal(values, (scale / fan_in).sqrt(), rng),
            Self::Constant(value) => values.fill(value),
        }
    }
}

impl Default for WeightInit {
    fn default() -> Self {
        Self::xavier()
    }
}

fn fill_uniform<R: Rng + ?Sized>(values: &mut [f32], range: f32, rng: &mut R) {
    if range.is_finite() && range >= 0. {
        fill_random(values, Uniform::new_inclusive(-range, range), rng);
    } else {
        values.fill(0.);
    }
}

fn fill_normal<R: Rng + ?Sized>(values: &mut [f32], sigma: f32, rng: &mut R) {
    match Normal::new(0., sigma) {
        Ok(normal) => fill_random(values, normal, rng),
        // sigma is 0 or not finite
        Err(_) => values.fill(0.),
    }
}

fn fill_random<D: Distribution<f32>, R: Rng + ?Sized>(values: &mut [f32], distr: D, rng: &mut R) {
    values
        .iter_mut()
        .zip(distr.sample_iter(rng))
        .for_each(|(x, r)| *x = r);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn xavier_range() {
        let mut values = vec![0.; 1000];
        let mut rng = SmallRng::seed_from_u64(0);
        WeightInit::xavier().fill(&mut values, 10, 14, &mut rng);
        let range = 0.5;
        assert!(values.iter().all(|x| x.abs() <= range));
        assert!(values.iter().any(|x| *x != 0.));
    }

    #[test]
    fn lecun_range() {
        let mut values = vec![0.; 100];
        let mut rng = SmallRng::seed_from_u64(1);
        WeightInit::lecun().fill(&mut values, 16, 1, &mut rng);
        assert!(values.iter().all(|x| x.abs() <= 0.25));
    }

    #[test]
    fn constant_fill() {
        let mut values = vec![1.; 5];
        let mut rng = SmallRng::seed_from_u64(0);
        WeightInit::Constant(0.).fill(&mut values, 1, 1, &mut rng);
        assert_eq!(values, vec![0.; 5]);
    }

    #[test]
    fn invalid_scale() {
        for init in [
            WeightInit::Xavier { scale: -6. },
            WeightInit::Lecun { scale: f32::NAN },
            WeightInit::Gaussian { sigma: f32::INFINITY },
        ] {
            assert!(matches!(init.validate(), Err(Error::Config(_))));
            let mut values = vec![1.; 4];
            init.fill(&mut values, 2, 2, &mut SmallRng::seed_from_u64(0));
            assert_eq!(values, [0.; 4]);
        }
        assert!(WeightInit::Constant(-1.).validate().is_ok());
    }

    #[test]
    fn fill_is_deterministic() {
        let mut a = vec![0.; 32];
        let mut b = vec![0.; 32];
        WeightInit::he().fill(&mut a, 8, 8, &mut SmallRng::seed_from_u64(7));
        WeightInit::he().fill(&mut b, 8, 8, &mut SmallRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
