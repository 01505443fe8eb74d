//! Early stopping on validation loss.

/// Outcome of observing one epoch's validation loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
    /// New best loss; save the model.
    Improved,
    /// No improvement, patience not yet exhausted.
    NoImprovement { epochs_without_improvement: usize },
    /// Patience exhausted; stop training.
    Stop,
}

/// Stops training when validation loss fails to improve by more than
/// `min_delta` for `patience` consecutive epochs.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_loss: f64,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f64::INFINITY,
            epochs_without_improvement: 0,
        }
    }

    pub fn observe(&mut self, val_loss: f64) -> EpochVerdict {
        if val_loss < self.best_loss - self.min_delta {
            self.best_loss = val_loss;
            self.epochs_without_improvement = 0;
            return EpochVerdict::Improved;
        }
        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            EpochVerdict::Stop
        } else {
            EpochVerdict::NoImprovement {
                epochs_without_improvement: self.epochs_without_improvement,
            }
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_epochs() {
        let mut es = EarlyStopping::new(2, 0.0);
        assert_eq!(es.observe(1.0), EpochVerdict::Improved);
        assert_eq!(es.observe(0.8), EpochVerdict::Improved);
        assert_eq!(
            es.observe(0.8),
            EpochVerdict::NoImprovement {
                epochs_without_improvement: 1
            }
        );
        assert_eq!(es.observe(0.9), EpochVerdict::Stop);
        assert_eq!(es.best_loss(), 0.8);
    }

    #[test]
    fn improvement_resets_counter() {
        let mut es = EarlyStopping::new(3, 0.0);
        es.observe(1.0);
        es.observe(1.1);
        es.observe(1.2);
        assert_eq!(es.epochs_without_improvement(), 2);
        assert_eq!(es.observe(0.5), EpochVerdict::Improved);
        assert_eq!(es.epochs_without_improvement(), 0);
    }

    #[test]
    fn min_delta_requires_margin() {
        let mut es = EarlyStopping::new(5, 0.01);
        es.observe(1.0);
        assert!(matches!(es.observe(0.995), EpochVerdict::NoImprovement { .. }));
        assert_eq!(es.observe(0.98), EpochVerdict::Improved);
    }

    #[test]
    fn nan_loss_never_improves() {
        let mut es = EarlyStopping::new(1, 0.0);
        assert_eq!(es.observe(f64::NAN), EpochVerdict::Stop);
    }
}
