//! 分割模型契约与模型提供者.
//!
//! 流水线只通过 [`SegmentationModel`] 与模型交互. 本 crate 附带的 [`VoxelNet`]
//! 是一个逐体素的参考实现, 足以端到端地跑通训练与预测.

use crate::config::Config;
use crate::generator::Batch;
use ndarray::{Array4, ArrayView4};
use std::path::{Path, PathBuf};

mod voxel_net;

pub use voxel_net::{neighbourhood_mean, voxel_features, VoxelNet, DEFAULT_VOXELS_PER_SAMPLE};

/// 模型错误.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// 底层 I/O 错误.
    #[error("`{path}`: {source}")]
    Io {
        /// 出错的文件.
        path: PathBuf,

        /// 底层错误.
        source: std::io::Error,
    },

    /// 模型文件序列化或反序列化失败.
    #[error("`{path}`: {source}")]
    Bincode {
        /// 出错的文件.
        path: PathBuf,

        /// 底层错误.
        source: bincode::Error,
    },

    /// 输入通道数与模型不符.
    #[error("model expects {expected} input channels, got {found}")]
    Channels {
        /// 模型的通道数.
        expected: usize,

        /// 实际通道数.
        found: usize,
    },

    /// 标签数与模型不符.
    #[error("model predicts {expected} labels, got {found}")]
    Labels {
        /// 模型的标签数.
        expected: usize,

        /// 实际标签数.
        found: usize,
    },

    /// 超参数不合法.
    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    /// 数组形状操作错误.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// 分割模型.
///
/// 输入为 `通道 × X × Y × Z` 的标准化图像, 输出为 `标签数 × X × Y × Z` 的逐体素概率.
pub trait SegmentationModel {
    /// 模型输入形状 `[通道, X, Y, Z]`.
    fn input_shape(&self) -> [usize; 4];

    /// 输出标签数.
    fn n_labels(&self) -> usize;

    /// 以学习率 `learning_rate` 在一个批次上训练一步, 返回该批次的损失.
    fn train_on_batch(&mut self, batch: &Batch, learning_rate: f32) -> Result<f32, ModelError>;

    /// 计算一个批次的损失, 不更新参数.
    fn evaluate(&self, batch: &Batch) -> Result<f32, ModelError>;

    /// 预测单个样本.
    fn predict(&self, x: ArrayView4<f32>) -> Result<Array4<f32>, ModelError>;

    /// 保存到 `path`.
    fn save(&self, path: &Path) -> Result<(), ModelError>;
}

/// 加载已训练的模型.
pub fn load_old_model<P: AsRef<Path>>(path: P) -> Result<VoxelNet, ModelError> {
    let path = path.as_ref();
    log::info!("loading pre-trained model from `{}`", path.display());
    VoxelNet::load(path)
}

/// 由超参数构建新模型.
pub fn build_model(
    input_shape: [usize; 4],
    n_labels: usize,
    initial_learning_rate: f32,
    n_base_filters: usize,
    seed: Option<u64>,
) -> Result<VoxelNet, ModelError> {
    log::info!(
        "building model: input {input_shape:?}, {n_labels} labels, {n_base_filters} base filters"
    );
    VoxelNet::new(
        input_shape,
        n_labels,
        initial_learning_rate,
        n_base_filters,
        seed,
    )
}

/// 幂等地提供模型: `model_file` 存在且不要求覆盖时加载, 否则按配置构建.
///
/// 加载的模型必须与配置的通道数和标签数一致.
pub fn provide_model(config: &Config, overwrite: bool) -> Result<VoxelNet, ModelError> {
    if !overwrite && config.model_file.exists() {
        let model = load_old_model(&config.model_file)?;
        if model.input_shape()[0] != config.nb_channels() {
            return Err(ModelError::Channels {
                expected: config.nb_channels(),
                found: model.input_shape()[0],
            });
        }
        if model.n_labels() != config.n_labels() {
            return Err(ModelError::Labels {
                expected: config.n_labels(),
                found: model.n_labels(),
            });
        }
        return Ok(model);
    }
    build_model(
        config.input_shape(),
        config.n_labels(),
        config.initial_learning_rate,
        config.n_base_filters,
        config.seed,
    )
}
