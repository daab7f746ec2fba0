use std::time::Instant;

use ndarray::{Array2, Axis};

use super::{
    diagnostics::{Diagnostics, MetricKey},
    optim::Adam,
    predictive::QuantilePredictive,
    scoring::Scorer,
    InferenceError, InferenceMethod, InferenceOutcome, InferenceRequest,
};
use crate::{
    model::{ModelFamily, QUANTILE_WEIGHTS},
    stats::{pinball, quantile},
};

/// Linear quantile regression over every level of the quantile list.
///
/// Minimizes the mean pinball loss plus a Gaussian-prior penalty on the
/// coefficients. Bias outputs start at the empirical target quantiles;
/// crossing outputs are rearranged by the predictive.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuantileRegression;

impl InferenceMethod for QuantileRegression {
    fn name(&self) -> &str {
        "q_regr"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Quantile
    }

    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        let scorer = Scorer::new(&request.scoring_levels()).without_sample_crps();
        let InferenceRequest {
            config,
            model,
            store,
            train,
            validation,
            test,
            rng,
            ..
        } = request;
        let levels = model
            .quantiles()
            .ok_or_else(|| InferenceError::Shape("quantile model built without levels".into()))?
            .as_slice()
            .to_vec();

        let started = Instant::now();
        let phi = model.features(train.inputs)?;
        let targets = train.targets.to_vec();
        let mut weights = store.matrix(QUANTILE_WEIGHTS)?.clone();
        let bias = weights.nrows() - 1;
        for (k, level) in levels.iter().enumerate() {
            weights[[bias, k]] = quantile(&targets, *level);
        }

        let prior_mean = model.prior_mean().insert_axis(Axis(1));
        let prior_var = model.prior_variance().insert_axis(Axis(1));
        let scale = 1.0 / (phi.nrows() * levels.len()) as f64;
        let mut adam = Adam::new(config.lr, 1);
        let mut final_loss = f64::NAN;

        for iteration in 0..config.num_iterations {
            let predictions = phi.dot(&weights);
            let mut loss = 0.0;
            let mut slope = Array2::<f64>::zeros(predictions.raw_dim());
            for ((i, k), prediction) in predictions.indexed_iter() {
                let target = train.targets[i];
                loss += pinball(target, *prediction, levels[k]);
                slope[[i, k]] = if target >= *prediction {
                    -levels[k]
                } else {
                    1.0 - levels[k]
                };
            }
            let offset = &weights - &prior_mean;
            loss = scale * (loss + 0.5 * (&offset * &offset / &prior_var).sum());
            if !loss.is_finite() {
                return Err(InferenceError::NonFinite {
                    method: "q_regr",
                    what: "pinball loss",
                    iteration,
                });
            }
            final_loss = loss;
            let grad = (phi.t().dot(&slope) + &offset / &prior_var) * scale;
            adam.tick();
            adam.update(0, &mut weights, grad.view());
        }

        store.set(QUANTILE_WEIGHTS, weights.clone())?;
        let train_time = started.elapsed().as_secs_f64();

        let predictive = QuantilePredictive::new(model.clone(), weights, levels)?;
        let scores = scorer.score(&predictive, validation, test, rng)?;

        let mut diagnostics = Diagnostics::new()
            .with(MetricKey::TrainTime, train_time)
            .with(MetricKey::InferenceTime, scores.prediction_seconds)
            .with(MetricKey::FinalLoss, final_loss);
        scores.record_into(&mut diagnostics);
        Ok(InferenceOutcome {
            predictive: Box::new(predictive),
            diagnostics,
        })
    }
}
