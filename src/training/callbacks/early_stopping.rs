//! Patience-based early stopping on eval loss

use anyhow::Result;

use super::{CallbackAction, MetricsEvent, TrainingListener};

/// Stops training after `patience` evaluations without a strict improvement
#[derive(Debug, Clone)]
pub struct EarlyStoppingCallback {
    patience: usize,
    best_eval_loss: f64,
    patience_counter: usize,
    stopped: bool,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_eval_loss: f64::INFINITY,
            patience_counter: 0,
            stopped: false,
        }
    }

    pub fn best_eval_loss(&self) -> f64 {
        self.best_eval_loss
    }

    pub fn patience_counter(&self) -> usize {
        self.patience_counter
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Feed one eval loss and get the resulting action
    pub fn observe(&mut self, eval_loss: f64) -> CallbackAction {
        if self.stopped {
            return CallbackAction::Stop;
        }

        if eval_loss < self.best_eval_loss {
            self.best_eval_loss = eval_loss;
            self.patience_counter = 0;
            tracing::info!("New best eval loss: {:.4}", eval_loss);
            return CallbackAction::Continue;
        }

        self.patience_counter += 1;
        tracing::info!(
            "Eval loss {:.4} did not improve on {:.4} ({}/{})",
            eval_loss,
            self.best_eval_loss,
            self.patience_counter,
            self.patience
        );

        if self.patience_counter >= self.patience {
            tracing::info!(
                "Early stopping: no improvement for {} evaluations",
                self.patience
            );
            self.stopped = true;
            return CallbackAction::Stop;
        }
        CallbackAction::Continue
    }
}

impl TrainingListener for EarlyStoppingCallback {
    fn name(&self) -> &'static str {
        "EarlyStoppingCallback"
    }

    fn handle_evaluate(&mut self, event: &MetricsEvent) -> Result<CallbackAction> {
        Ok(match event.metrics.eval_loss {
            Some(loss) => self.observe(loss),
            None if self.stopped => CallbackAction::Stop,
            None => CallbackAction::Continue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::callbacks::Metrics;

    fn first_stop(losses: &[f64], patience: usize) -> Option<usize> {
        let mut cb = EarlyStoppingCallback::new(patience);
        losses
            .iter()
            .position(|&l| cb.observe(l) == CallbackAction::Stop)
            .map(|i| i + 1)
    }

    #[test]
    fn test_fires_after_two_plateaus() {
        assert_eq!(first_stop(&[0.9, 0.85, 0.85, 0.85], 2), Some(4));
    }

    #[test]
    fn test_strict_improvement_resets_counter() {
        assert_eq!(first_stop(&[0.9, 0.95, 0.8, 0.95, 0.95], 2), Some(5));
        assert_eq!(first_stop(&[0.9, 0.8, 0.7, 0.6], 2), None);
    }

    #[test]
    fn test_missing_eval_loss_is_noop() {
        let mut cb = EarlyStoppingCallback::new(1);
        let event = MetricsEvent {
            step: 10,
            epoch: 0.1,
            metrics: Metrics::train(1.0, 1e-4, 0.5),
        };
        assert_eq!(cb.handle_evaluate(&event).unwrap(), CallbackAction::Continue);
        assert_eq!(cb.patience_counter(), 0);
        assert!(cb.best_eval_loss().is_infinite());
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut cb = EarlyStoppingCallback::new(1);
        cb.observe(1.0);
        assert_eq!(cb.observe(1.0), CallbackAction::Stop);
        assert_eq!(cb.observe(0.1), CallbackAction::Stop);
        assert!(cb.stopped());
    }
}
