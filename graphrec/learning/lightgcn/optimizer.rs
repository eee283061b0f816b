use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Step size.
    pub learning_rate: f32,
    /// First-moment decay.
    pub beta1: f32,
    /// Second-moment decay.
    pub beta2: f32,
    /// Denominator fuzz.
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.005,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Dense Adam optimizer over a single parameter matrix.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    step: i32,
    m: Option<Array2<f32>>,
    v: Option<Array2<f32>>,
}

impl Adam {
    /// Creates the optimizer; moment buffers are allocated on the first step.
    #[must_use]
    pub const fn new(config: AdamConfig) -> Self {
        Self {
            config,
            step: 0,
            m: None,
            v: None,
        }
    }

    /// Number of updates applied so far.
    #[must_use]
    pub const fn steps(&self) -> i32 {
        self.step
    }

    /// Applies one bias-corrected update `params -= lr_t * m / (sqrt(v) + eps)`.
    ///
    /// Moment buffers are reset if the parameter shape changes.
    pub fn step(&mut self, params: &mut Array2<f32>, grad: &Array2<f32>) {
        debug_assert_eq!(params.dim(), grad.dim());
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let shape = params.raw_dim();
        if self.m.as_ref().map_or(true, |m| m.raw_dim() != shape) {
            self.m = Some(Array2::zeros(shape.clone()));
            self.v = Some(Array2::zeros(shape));
            self.step = 0;
        }
        let (Some(m), Some(v)) = (self.m.as_mut(), self.v.as_mut()) else {
            return;
        };

        self.step = self.step.saturating_add(1);
        let lr_t =
            learning_rate * (1.0 - beta2.powi(self.step)).sqrt() / (1.0 - beta1.powi(self.step));

        Zip::from(params)
            .and(grad)
            .and(m)
            .and(v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + epsilon);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        });
        let mut params = array![[1.0_f32, -1.0]];
        adam.step(&mut params, &array![[2.0_f32, -0.5]]);
        assert!((params[[0, 0]] - 0.9).abs() < 1e-4);
        assert!((params[[0, 1]] + 0.9).abs() < 1e-4);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimizes_quadratic() {
        let mut adam = Adam::new(AdamConfig {
            learning_rate: 0.05,
            ..AdamConfig::default()
        });
        let mut params = array![[3.0_f32, -2.0], [0.5, 4.0]];
        for _ in 0..2000 {
            let grad = params.mapv(|x| 2.0 * x);
            adam.step(&mut params, &grad);
        }
        assert!(params.iter().all(|x| x.abs() < 0.05), "{params:?}");
    }
}
