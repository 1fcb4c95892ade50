//! 训练循环.
//!
//! 每轮先跑 `steps` 个训练批次, 再跑 `validation_steps` 个验证批次. 监控量为验证损失
//! (没有验证批次时退化为训练损失). 监控量连续 `learning_rate_patience` 轮没有改善时学习率乘以
//! `learning_rate_drop`; 连续 `early_stopping_patience` 轮没有改善时提前停止.
//! 只有监控量改善时才保存模型.

use crate::config::Config;
use crate::consts::paths;
use crate::generator::{Batch, GeneratorError};
use crate::model::{ModelError, SegmentationModel};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// 训练错误.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// 生成批次失败.
    #[error(transparent)]
    Generator(#[from] GeneratorError),

    /// 模型训练, 评估或保存失败.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// 写训练日志失败.
    #[error("training log `{path}`: {source}")]
    Log {
        /// 日志文件.
        path: PathBuf,

        /// 底层错误.
        source: csv::Error,
    },

    /// 训练参数不合法.
    #[error("invalid training option: {0}")]
    InvalidOption(String),
}

/// 训练参数.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    /// 初始学习率.
    pub initial_learning_rate: f32,

    /// 学习率衰减倍率.
    pub learning_rate_drop: f32,

    /// 多少轮没有改善后衰减学习率.
    pub learning_rate_patience: usize,

    /// 多少轮没有改善后提前停止.
    pub early_stopping_patience: usize,

    /// 最多训练多少轮.
    pub n_epochs: usize,

    /// 每轮日志 (csv). `None` 表示不写.
    pub log_file: Option<PathBuf>,
}

impl TrainOptions {
    /// 从配置中提取训练参数. 日志写在模型文件旁边.
    pub fn from_config(config: &Config) -> Self {
        let log_file = config
            .model_file
            .parent()
            .map(|dir| dir.join(paths::TRAINING_LOG));
        Self {
            initial_learning_rate: config.initial_learning_rate,
            learning_rate_drop: config.learning_rate_drop,
            learning_rate_patience: config.patience,
            early_stopping_patience: config.early_stop,
            n_epochs: config.n_epochs,
            log_file,
        }
    }

    fn validate(&self) -> Result<(), TrainError> {
        let lr = self.initial_learning_rate;
        if lr.is_nan() || lr <= 0.0 {
            return Err(TrainError::InvalidOption(format!(
                "initial learning rate must be positive, got {lr}"
            )));
        }
        let drop = self.learning_rate_drop;
        if drop.is_nan() || drop <= 0.0 || drop > 1.0 {
            return Err(TrainError::InvalidOption(format!(
                "learning rate drop must be in (0, 1], got {drop}"
            )));
        }
        Ok(())
    }
}

/// 单轮记录. 也是训练日志的一行.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    /// 轮次, 从 0 开始.
    pub epoch: usize,

    /// 平均训练损失.
    pub loss: f32,

    /// 平均验证损失. 没有验证批次时为空.
    pub val_loss: Option<f32>,

    /// 本轮使用的学习率.
    #[serde(rename = "lr")]
    pub learning_rate: f32,
}

impl EpochRecord {
    /// 被监控的损失.
    #[inline]
    pub fn monitored(&self) -> f32 {
        self.val_loss.unwrap_or(self.loss)
    }
}

/// 一次训练的全部记录.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    /// 逐轮记录.
    pub epochs: Vec<EpochRecord>,

    /// 最优 (即最后一次保存模型的) 轮次.
    pub best_epoch: Option<usize>,

    /// 是否因早停而结束.
    pub stopped_early: bool,
}

impl TrainingHistory {
    /// 最优轮次的记录.
    pub fn best(&self) -> Option<&EpochRecord> {
        self.best_epoch.and_then(|e| self.epochs.get(e))
    }
}

/// 监控量的改善追踪.
#[derive(Debug, Clone)]
struct Plateau {
    best: f32,
    since_improvement: usize,
    since_drop: usize,
}

impl Plateau {
    fn new() -> Self {
        Self {
            best: f32::INFINITY,
            since_improvement: 0,
            since_drop: 0,
        }
    }

    /// 记录一轮的监控量, 返回是否改善.
    fn update(&mut self, loss: f32) -> bool {
        if loss < self.best {
            self.best = loss;
            self.since_improvement = 0;
            self.since_drop = 0;
            true
        } else {
            self.since_improvement += 1;
            self.since_drop += 1;
            false
        }
    }
}

/// 逐行写出的 csv 训练日志.
struct EpochLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl EpochLog {
    fn create(path: &Path) -> Result<Self, TrainError> {
        let writer = csv::Writer::from_path(path).map_err(|source| TrainError::Log {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            path: path.to_owned(),
            writer,
        })
    }

    fn append(&mut self, record: &EpochRecord) -> Result<(), TrainError> {
        let wrap = |source| TrainError::Log {
            path: self.path.clone(),
            source,
        };
        self.writer.serialize(record).map_err(wrap)?;
        self.writer
            .flush()
            .map_err(|e| wrap(csv::Error::from(e)))
    }
}

/// 对 `steps` 个批次求平均损失.
fn mean_loss<I, F>(batches: &mut I, steps: usize, mut f: F) -> Result<f32, TrainError>
where
    I: Iterator<Item = Result<Batch, GeneratorError>>,
    F: FnMut(&Batch) -> Result<f32, ModelError>,
{
    let mut total = 0.0f64;
    for batch in batches.take(steps) {
        total += f64::from(f(&batch?)?);
    }
    Ok((total / steps as f64) as f32)
}

/// 训练模型, 并把最优模型保存到 `model_file`.
///
/// `training` 与 `validation` 应为无穷迭代器. `validation_steps` 为 0 时以训练损失作为监控量.
pub fn train_model<M, T, V>(
    model: &mut M,
    model_file: &Path,
    mut training: T,
    mut validation: V,
    steps: usize,
    validation_steps: usize,
    options: &TrainOptions,
) -> Result<TrainingHistory, TrainError>
where
    M: SegmentationModel,
    T: Iterator<Item = Result<Batch, GeneratorError>>,
    V: Iterator<Item = Result<Batch, GeneratorError>>,
{
    options.validate()?;
    if steps == 0 {
        return Err(TrainError::InvalidOption(
            "steps per epoch must be positive".to_owned(),
        ));
    }
    if validation_steps == 0 {
        log::warn!("no validation batches, monitoring training loss instead");
    }
    let mut epoch_log = options
        .log_file
        .as_deref()
        .map(EpochLog::create)
        .transpose()?;

    let mut history = TrainingHistory::default();
    let mut plateau = Plateau::new();
    let mut lr = options.initial_learning_rate;
    for epoch in 0..options.n_epochs {
        let loss = mean_loss(&mut training, steps, |b| model.train_on_batch(b, lr))?;
        let val_loss = match validation_steps {
            0 => None,
            n => Some(mean_loss(&mut validation, n, |b| model.evaluate(b))?),
        };
        let record = EpochRecord {
            epoch,
            loss,
            val_loss,
            learning_rate: lr,
        };
        log::info!(
            "epoch {}/{}: loss {loss:.5}, val_loss {}, lr {lr:.3e}",
            epoch + 1,
            options.n_epochs,
            val_loss.map_or_else(|| "-".to_owned(), |v| format!("{v:.5}")),
        );
        if let Some(epoch_log) = epoch_log.as_mut() {
            epoch_log.append(&record)?;
        }

        let monitored = record.monitored();
        history.epochs.push(record);
        if plateau.update(monitored) {
            log::info!(
                "monitored loss improved to {monitored:.5}, saving model to `{}`",
                model_file.display()
            );
            model.save(model_file)?;
            history.best_epoch = Some(epoch);
            continue;
        }

        if plateau.since_improvement >= options.early_stopping_patience {
            log::info!(
                "early stopping: no improvement for {} epochs (best {:.5})",
                plateau.since_improvement,
                plateau.best
            );
            history.stopped_early = true;
            break;
        }
        if plateau.since_drop >= options.learning_rate_patience {
            lr *= options.learning_rate_drop;
            plateau.since_drop = 0;
            log::info!("reducing learning rate to {lr:.3e}");
        }
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, Array5, ArrayView4};
    use std::cell::{Cell, RefCell};
    use std::fs;

    /// 按脚本返回损失的模型.
    struct Scripted {
        train_losses: Vec<f32>,
        val_losses: Vec<f32>,
        n_train: usize,
        n_val: Cell<usize>,
        lrs: RefCell<Vec<f32>>,
        saves: Cell<usize>,
    }

    impl Scripted {
        fn new(train_losses: Vec<f32>, val_losses: Vec<f32>) -> Self {
            Self {
                train_losses,
                val_losses,
                n_train: 0,
                n_val: Cell::new(0),
                lrs: RefCell::new(Vec::new()),
                saves: Cell::new(0),
            }
        }
    }

    impl SegmentationModel for Scripted {
        fn input_shape(&self) -> [usize; 4] {
            [1, 1, 1, 1]
        }

        fn n_labels(&self) -> usize {
            1
        }

        fn train_on_batch(&mut self, _: &Batch, lr: f32) -> Result<f32, ModelError> {
            self.lrs.borrow_mut().push(lr);
            let loss = self.train_losses[self.n_train.min(self.train_losses.len() - 1)];
            self.n_train += 1;
            Ok(loss)
        }

        fn evaluate(&self, _: &Batch) -> Result<f32, ModelError> {
            let n = self.n_val.get();
            self.n_val.set(n + 1);
            Ok(self.val_losses[n.min(self.val_losses.len() - 1)])
        }

        fn predict(&self, x: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
            Ok(x.to_owned())
        }

        fn save(&self, path: &Path) -> Result<(), ModelError> {
            self.saves.set(self.saves.get() + 1);
            fs::write(path, b"ok").map_err(|source| ModelError::Io {
                path: path.to_owned(),
                source,
            })
        }
    }

    fn batches() -> impl Iterator<Item = Result<Batch, GeneratorError>> {
        std::iter::repeat_with(|| {
            Ok(Batch {
                x: Array5::zeros((1, 1, 1, 1, 1)),
                y: Array5::zeros((1, 1, 1, 1, 1)),
            })
        })
    }

    fn options(log_file: Option<PathBuf>) -> TrainOptions {
        TrainOptions {
            initial_learning_rate: 1.0,
            learning_rate_drop: 0.5,
            learning_rate_patience: 2,
            early_stopping_patience: 3,
            n_epochs: 10,
            log_file,
        }
    }

    #[test]
    fn test_plateau_and_early_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let model_file = dir.path().join("model.bin");
        let mut model = Scripted::new(vec![1.0], vec![1.0, 0.5, 0.6, 0.7, 0.8, 0.9]);
        let history = train_model(
            &mut model,
            &model_file,
            batches(),
            batches(),
            1,
            1,
            &options(None),
        )
        .unwrap();

        assert_eq!(history.epochs.len(), 5);
        assert!(history.stopped_early);
        assert_eq!(history.best_epoch, Some(1));
        assert_eq!(history.best().unwrap().val_loss, Some(0.5));
        // 第 4 轮结束后学习率减半.
        assert_eq!(*model.lrs.borrow(), vec![1.0, 1.0, 1.0, 1.0, 0.5]);
        assert!(model_file.exists());
        assert_eq!(model.saves.get(), 2);
    }

    #[test]
    fn test_best_only_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let model_file = dir.path().join("model.bin");
        let mut model = Scripted::new(vec![1.0], vec![0.9, 1.0, 0.8, 0.85]);
        let mut opts = options(None);
        opts.n_epochs = 4;
        opts.early_stopping_patience = 10;
        let history = train_model(
            &mut model,
            &model_file,
            batches(),
            batches(),
            1,
            1,
            &opts,
        )
        .unwrap();
        assert!(!history.stopped_early);
        assert_eq!(history.best_epoch, Some(2));
        let improved: Vec<_> = history
            .epochs
            .iter()
            .map(|r| r.monitored())
            .collect();
        assert_eq!(improved, vec![0.9, 1.0, 0.8, 0.85]);
        // 只在第 0 轮和第 2 轮保存.
        assert_eq!(model.saves.get(), 2);
    }

    #[test]
    fn test_training_loss_fallback_and_csv_log() {
        let dir = tempfile::tempdir().unwrap();
        let model_file = dir.path().join("model.bin");
        let log_file = dir.path().join("training.log");
        let mut model = Scripted::new(vec![0.5, 0.25, 0.125], vec![]);
        let mut opts = options(Some(log_file.clone()));
        opts.n_epochs = 3;
        let history = train_model(
            &mut model,
            &model_file,
            batches(),
            batches(),
            1,
            0,
            &opts,
        )
        .unwrap();
        assert_eq!(history.best_epoch, Some(2));
        assert!(history.epochs.iter().all(|r| r.val_loss.is_none()));
        assert_eq!(model.n_val.get(), 0);

        let text = fs::read_to_string(&log_file).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "epoch,loss,val_loss,lr");
        assert_eq!(lines[1], "0,0.5,,1.0");
    }

    #[test]
    fn test_invalid_options() {
        let dir = tempfile::tempdir().unwrap();
        let model_file = dir.path().join("model.bin");
        let mut model = Scripted::new(vec![1.0], vec![1.0]);
        let r = train_model(
            &mut model,
            &model_file,
            batches(),
            batches(),
            0,
            1,
            &options(None),
        );
        assert!(matches!(r, Err(TrainError::InvalidOption(_))));

        let mut opts = options(None);
        opts.learning_rate_drop = 0.0;
        let r = train_model(&mut model, &model_file, batches(), batches(), 1, 1, &opts);
        assert!(matches!(r, Err(TrainError::InvalidOption(_))));
    }

    #[test]
    fn test_generator_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = Scripted::new(vec![1.0], vec![1.0]);
        let failing = std::iter::repeat_with(|| Err(GeneratorError::NoTruth));
        let r = train_model(
            &mut model,
            &dir.path().join("model.bin"),
            failing,
            batches(),
            1,
            1,
            &options(None),
        );
        assert!(matches!(
            r,
            Err(TrainError::Generator(GeneratorError::NoTruth))
        ));
    }
}
