//! 学習中にエポックごとに評価する監視ポリシー
//!
//! - ベストモデルの保存判定（検証精度が向上したとき）
//! - 検証損失が停滞したら学習率を下げる
//! - 検証損失が改善しなくなったら学習を打ち切る

/// 監視する指標の向き
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// 小さいほど良い（損失）
    Min,
    /// 大きいほど良い（精度）
    Max,
}

/// 指標の最良値を追跡する
#[derive(Debug, Clone)]
pub struct BestTracker {
    mode: MonitorMode,
    min_delta: f64,
    best: Option<f64>,
}

impl BestTracker {
    pub fn new(mode: MonitorMode, min_delta: f64) -> Self {
        Self {
            mode,
            min_delta,
            best: None,
        }
    }

    /// 新しい値を記録し、最良値を更新したら true
    ///
    /// NaN は改善とみなさない。
    pub fn observe(&mut self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }

        let improved = match (self.best, self.mode) {
            (None, _) => true,
            (Some(best), MonitorMode::Min) => value < best - self.min_delta,
            (Some(best), MonitorMode::Max) => value > best + self.min_delta,
        };

        if improved {
            self.best = Some(value);
        }
        improved
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

/// 検証精度が向上したときにチェックポイントを保存するかの判定
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    tracker: BestTracker,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            tracker: BestTracker::new(MonitorMode::Max, 0.0),
        }
    }
}

impl CheckpointPolicy {
    pub fn should_save(&mut self, val_accuracy: f64) -> bool {
        self.tracker.observe(val_accuracy)
    }

    pub fn best_accuracy(&self) -> Option<f64> {
        self.tracker.best()
    }
}

/// 検証損失が停滞したら学習率を `factor` 倍する（下限 `min_lr`）
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    tracker: BestTracker,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64, min_delta: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            tracker: BestTracker::new(MonitorMode::Min, min_delta),
            wait: 0,
        }
    }

    /// エポック終了時に呼ぶ。学習率を下げた場合は新しい値を返す
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if self.tracker.observe(val_loss) {
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }

        self.wait = 0;
        let new_lr = (current_lr * self.factor).max(self.min_lr);
        (new_lr < current_lr).then_some(new_lr)
    }
}

/// 早期終了の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingDecision {
    /// 最良値を更新（この時点の重みを控えておく）
    NewBest,
    /// 改善なし（連続回数）
    NoImprovement(usize),
    /// 打ち切り
    Stop,
}

/// 検証損失が `patience` エポック改善しなければ打ち切る
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    tracker: BestTracker,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            tracker: BestTracker::new(MonitorMode::Min, min_delta),
            wait: 0,
        }
    }

    pub fn check(&mut self, val_loss: f64) -> StoppingDecision {
        if self.tracker.observe(val_loss) {
            self.wait = 0;
            return StoppingDecision::NewBest;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::NoImprovement(self.wait)
        }
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.tracker.best()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_only_on_strict_improvement() {
        let mut policy = CheckpointPolicy::default();
        assert!(policy.should_save(0.5));
        assert!(!policy.should_save(0.5));
        assert!(policy.should_save(0.6));
        assert!(!policy.should_save(0.55));
        assert_eq!(policy.best_accuracy(), Some(0.6));
    }

    #[test]
    fn test_reduce_lr_after_patience() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 5, 1e-6, 1e-4);
        let mut lr = 1e-3;

        assert_eq!(plateau.step(1.0, lr), None);
        for _ in 0..4 {
            assert_eq!(plateau.step(1.0, lr), None);
        }
        lr = plateau.step(1.0, lr).unwrap();
        assert!((lr - 5e-4).abs() < 1e-12);

        // カウンタはリセットされる
        for _ in 0..4 {
            assert_eq!(plateau.step(1.0, lr), None);
        }
        assert!(plateau.step(1.0, lr).is_some());
    }

    #[test]
    fn test_reduce_lr_ignores_tiny_improvements() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 2, 1e-6, 1e-4);
        plateau.step(1.0, 1e-3);
        assert_eq!(plateau.step(0.99995, 1e-3), None);
        assert!(plateau.step(0.99991, 1e-3).is_some());
    }

    #[test]
    fn test_reduce_lr_respects_floor() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 1, 1e-6, 1e-4);
        plateau.step(1.0, 1.5e-6);
        assert_eq!(plateau.step(1.0, 1.5e-6), Some(1e-6));
        assert_eq!(plateau.step(1.0, 1e-6), None);
    }

    #[test]
    fn test_early_stopping_after_patience() {
        let mut early = EarlyStopping::new(3, 0.0);
        assert_eq!(early.check(1.0), StoppingDecision::NewBest);
        assert_eq!(early.check(1.1), StoppingDecision::NoImprovement(1));
        assert_eq!(early.check(0.9), StoppingDecision::NewBest);
        assert_eq!(early.check(0.9), StoppingDecision::NoImprovement(1));
        assert_eq!(early.check(0.95), StoppingDecision::NoImprovement(2));
        assert_eq!(early.check(0.91), StoppingDecision::Stop);
        assert_eq!(early.best_loss(), Some(0.9));
    }

    #[test]
    fn test_nan_is_never_best() {
        let mut tracker = BestTracker::new(MonitorMode::Min, 0.0);
        assert!(!tracker.observe(f64::NAN));
        assert!(tracker.observe(2.0));
        assert!(!tracker.observe(f64::NAN));
        assert_eq!(tracker.best(), Some(2.0));
    }
}
