//! 検証精度が頭打ちになったら学習率を下げるスケジューラ

use serde::{Deserialize, Serialize};

/// ReduceLROnPlateau（mode = max）
///
/// 直近の最良値を `best * (1 + threshold)` より上回ったときだけ改善とみなし、
/// 改善なしが `patience` エポックを超えたら学習率に `factor` を掛ける。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceOnPlateau {
    pub lr: f64,
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub min_lr: f64,
    /// これまでの最良値（未観測なら None）
    pub best: Option<f64>,
    pub num_bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            factor: 0.5,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
            best: None,
            num_bad_epochs: 0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    fn is_improvement(&self, metric: f64) -> bool {
        match self.best {
            None => !metric.is_nan(),
            Some(best) => metric > best * (1.0 + self.threshold),
        }
    }

    /// 1エポック分の指標を渡し、次エポックの学習率を返す
    pub fn step(&mut self, metric: f64) -> f64 {
        if self.is_improvement(metric) {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            let new_lr = (self.lr * self.factor).max(self.min_lr);
            if new_lr < self.lr {
                tracing::info!("学習率を下げます: {:.2e} -> {:.2e}", self.lr, new_lr);
            }
            self.lr = new_lr;
            self.num_bad_epochs = 0;
        }

        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halves_only_after_patience_exceeded() {
        let mut sched = ReduceOnPlateau::new(1e-3);
        assert_eq!(sched.step(0.5), 1e-3);
        // 改善なし 3 回までは維持
        assert_eq!(sched.step(0.5), 1e-3);
        assert_eq!(sched.step(0.4), 1e-3);
        assert_eq!(sched.step(0.5), 1e-3);
        // 4 回目で半減
        assert_eq!(sched.step(0.5), 5e-4);
        assert_eq!(sched.num_bad_epochs, 0);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut sched = ReduceOnPlateau::new(1.0);
        sched.step(0.5);
        sched.step(0.4);
        sched.step(0.4);
        sched.step(0.6);
        assert_eq!(sched.num_bad_epochs, 0);
        assert_eq!(sched.best, Some(0.6));
        assert_eq!(sched.lr(), 1.0);
    }

    #[test]
    fn test_tiny_gain_is_not_improvement() {
        let mut sched = ReduceOnPlateau::new(1.0);
        sched.step(0.5);
        sched.step(0.5 * (1.0 + 1e-5));
        assert_eq!(sched.num_bad_epochs, 1);
    }

    #[test]
    fn test_min_lr_floor() {
        let mut sched = ReduceOnPlateau::new(1.0).with_patience(0).with_min_lr(0.3);
        sched.step(1.0);
        assert_eq!(sched.step(0.0), 0.5);
        assert_eq!(sched.step(0.0), 0.3);
        assert_eq!(sched.step(0.0), 0.3);
    }

    #[test]
    fn test_serde_roundtrip_keeps_state() {
        let mut sched = ReduceOnPlateau::new(1e-3);
        sched.step(0.7);
        sched.step(0.6);
        let json = serde_json::to_string(&sched).unwrap();
        let restored: ReduceOnPlateau = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, sched);
    }
}
