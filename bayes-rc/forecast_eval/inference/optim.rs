use ndarray::{ArrayBase, ArrayView, Data, DataMut, Dimension};

/// Adam with bias-corrected moments, one moment buffer per parameter slot.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i32,
    first: Vec<Vec<f64>>,
    second: Vec<Vec<f64>>,
}

impl Adam {
    /// Optimizer with the usual `(0.9, 0.999)` betas.
    #[must_use]
    pub fn new(lr: f64, slots: usize) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            first: vec![Vec::new(); slots],
            second: vec![Vec::new(); slots],
        }
    }

    /// Advances the shared step counter; call once per iteration.
    pub fn tick(&mut self) {
        self.step = self.step.saturating_add(1);
    }

    /// Applies one descent step to the parameter in `slot`.
    pub fn update<S, D>(&mut self, slot: usize, param: &mut ArrayBase<S, D>, grad: ArrayView<'_, f64, D>)
    where
        S: DataMut<Elem = f64>,
        D: Dimension,
    {
        let len = param.len();
        let first = &mut self.first[slot];
        let second = &mut self.second[slot];
        if first.len() != len {
            *first = vec![0.0; len];
            *second = vec![0.0; len];
        }
        let step = self.step.max(1);
        let correction1 = 1.0 - self.beta1.powi(step);
        let correction2 = 1.0 - self.beta2.powi(step);
        for (((value, g), m), v) in param
            .iter_mut()
            .zip(grad.iter())
            .zip(first.iter_mut())
            .zip(second.iter_mut())
        {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *value -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// Largest absolute entry, used to detect diverging gradients.
pub fn max_abs<S, D>(values: &ArrayBase<S, D>) -> f64
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(0.1, 1);
        let mut x = array![1.0, -1.0];
        adam.tick();
        adam.update(0, &mut x, array![3.0, -0.5].view());
        assert!((x[0] - 0.9).abs() < 1e-6);
        assert!((x[1] + 0.9).abs() < 1e-6);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut adam = Adam::new(0.05, 1);
        let mut x = array![4.0];
        for _ in 0..2000 {
            adam.tick();
            let grad = &x * 2.0 - 2.0;
            adam.update(0, &mut x, grad.view());
        }
        assert!((x[0] - 1.0).abs() < 5e-2);
        assert_eq!(max_abs(&array![-3.0, 2.0]), 3.0);
    }
}
