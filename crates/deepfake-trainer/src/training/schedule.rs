//! Learning-rate plateau schedule and early stopping.
//!
//! Both track validation accuracy (higher is better) but keep independent
//! state: the scheduler uses a relative threshold and its own patience, early
//! stopping uses strict improvement.

use deepfake_core::PlateauConfig;

/// Halve (by `factor`) the learning rate when the monitored metric stops
/// improving.
///
/// A value counts as better when it exceeds `best * (1 + threshold)`. After
/// more than `patience` consecutive epochs without improvement the rate is
/// multiplied by `factor` (never below `min_lr`) and the counter resets.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    lr: f64,
    best: f64,
    bad_epochs: usize,
}

/// Smallest change of learning rate that is applied.
const LR_EPS: f64 = 1e-8;

impl PlateauScheduler {
    #[must_use]
    pub fn new(config: &PlateauConfig, initial_lr: f64) -> Self {
        Self {
            factor: config.factor,
            patience: config.patience,
            threshold: config.threshold,
            min_lr: config.min_lr,
            lr: initial_lr,
            best: f64::NEG_INFINITY,
            bad_epochs: 0,
        }
    }

    /// Current learning rate.
    #[must_use]
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Record one epoch's metric. Returns the new learning rate if it was
    /// reduced.
    pub fn step(&mut self, metric: f64) -> Option<f64> {
        if self.is_better(metric) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs <= self.patience {
            return None;
        }
        self.bad_epochs = 0;
        let reduced = (self.lr * self.factor).max(self.min_lr);
        if self.lr - reduced > LR_EPS {
            self.lr = reduced;
            Some(reduced)
        } else {
            None
        }
    }

    fn is_better(&self, metric: f64) -> bool {
        metric > self.best * (1.0 + self.threshold)
    }
}

/// What early stopping decided for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// New best: save the checkpoint.
    Improved,
    /// No improvement, keep training.
    Continue,
    /// `patience` epochs in a row without improvement.
    Stop,
}

/// Stop once validation accuracy has not strictly improved for `patience`
/// consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    #[must_use]
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            best_epoch: None,
            wait: 0,
        }
    }

    /// Record the metric of `epoch`.
    ///
    /// The first observation is always an improvement.
    pub fn observe(&mut self, epoch: usize, metric: f64) -> StopDecision {
        if self.best.map_or(true, |best| metric > best) {
            self.best = Some(metric);
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }

    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    #[must_use]
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Epochs since the last improvement.
    #[must_use]
    pub fn wait(&self) -> usize {
        self.wait
    }
}
