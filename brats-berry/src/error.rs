//! 流水线级运行时错误.
//!
//! 每个阶段各自持有一个错误枚举, 这里按阶段将它们收拢,
//! 以便调用方区分 "打包失败", "训练失败" 与 "某受试者重采样失败".

use crate::config::ConfigError;
use crate::dataset::{DatasetError, DiscoveryError, SplitError};
use crate::data::VolumeError;
use crate::generator::GeneratorError;
use crate::model::ModelError;
use crate::predict::PredictError;
use crate::train::TrainError;

/// 流水线运行时错误.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 配置构建或校验失败.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// 受试者发现失败.
    #[error("subject discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    /// 数据打包 (或打开已打包数据) 失败.
    #[error("dataset: {0}")]
    Materialize(#[from] DatasetError),

    /// 训练/验证划分读写失败.
    #[error("split record: {0}")]
    Split(#[from] SplitError),

    /// 生成器构建失败.
    #[error("generator: {0}")]
    Generator(#[from] GeneratorError),

    /// 模型加载或构建失败.
    #[error("model: {0}")]
    Model(#[from] ModelError),

    /// 训练失败.
    #[error("training: {0}")]
    Train(#[from] TrainError),

    /// 预测失败.
    #[error("prediction: {0}")]
    Predict(#[from] PredictError),

    /// 某个受试者的预测结果重采样失败.
    #[error("resampling subject `{subject}`: {source}")]
    Resample {
        /// 受试者 id.
        subject: String,

        /// 底层错误.
        source: VolumeError,
    },
}

/// 流水线运行时结果.
pub type Result<T> = std::result::Result<T, Error>;
