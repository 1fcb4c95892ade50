//! 运行参数.
//!
//! [`Config`] 由默认值加覆盖项一次性构建, 之后以共享引用传递给各阶段.
//! 派生量 (标签数, 通道数, 输入形状等) 总是由源字段即时计算, 不单独存储.

mod overrides;

pub use overrides::{is_truthy, merge_overrides, MergePolicy};

use crate::consts::{self, paths};
use crate::Shape3d;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// 配置错误.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 不存在的键.
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),

    /// 派生键只读.
    #[error("`{0}` is derived from other keys and cannot be set")]
    DerivedKey(String),

    /// 值的类型与键不匹配.
    #[error("invalid value for `{key}`: {source}")]
    InvalidValue {
        /// 出错的键.
        key: String,

        /// 底层错误.
        source: serde_json::Error,
    },

    /// 配置文件读写错误.
    #[error("`{path}`: {source}")]
    Io {
        /// 配置文件路径.
        path: PathBuf,

        /// 底层错误.
        source: io::Error,
    },

    /// 配置文件解析错误.
    #[error("parsing `{path}`: {source}")]
    Parse {
        /// 配置文件路径.
        path: PathBuf,

        /// 底层错误.
        source: serde_json::Error,
    },

    /// 参数取值不合理.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 只读的派生键.
pub const DERIVED_KEYS: [&str; 5] = [
    "n_labels",
    "nb_channels",
    "input_shape",
    "truth_channel",
    "augment",
];

/// 全部运行参数.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 图像被裁剪/重采样到的形状.
    pub image_shape: Shape3d,

    /// 训练分块形状. `None` 表示整图训练.
    pub patch_shape: Option<Shape3d>,

    /// 标签图中的前景标签值.
    pub labels: Vec<u8>,

    /// 基础滤波器个数.
    pub n_base_filters: usize,

    /// 数据集中的全部模态.
    pub all_modalities: Vec<String>,

    /// 参与训练的模态.
    pub training_modalities: Vec<String>,

    /// 上采样时是否使用反卷积.
    pub deconvolution: bool,

    /// 训练批大小.
    pub batch_size: usize,

    /// 验证批大小.
    pub validation_batch_size: usize,

    /// 训练轮数上限.
    pub n_epochs: usize,

    /// 验证损失多少轮不下降后降低学习率.
    pub patience: usize,

    /// 验证损失多少轮不下降后停止训练.
    pub early_stop: usize,

    /// 初始学习率.
    pub initial_learning_rate: f32,

    /// 学习率衰减因子.
    pub learning_rate_drop: f32,

    /// 训练集占全部数据的比例.
    pub validation_split: f64,

    /// 是否随机翻转做数据增强.
    pub flip: bool,

    /// 是否随机置换坐标轴做数据增强 (要求立方体数据).
    pub permute: bool,

    /// 随机形变因子. `None` 表示不做形变.
    pub distort: Option<f32>,

    /// 验证分块的重叠体素数.
    pub validation_patch_overlap: usize,

    /// 训练分块的随机起始偏移上限.
    pub training_patch_start_offset: Option<Shape3d>,

    /// 是否跳过没有任何前景的分块.
    pub skip_blank: bool,

    /// 打包数据文件.
    pub data_file: PathBuf,

    /// 模型文件.
    pub model_file: PathBuf,

    /// 训练集序号文件.
    pub training_file: PathBuf,

    /// 验证集序号文件.
    pub validation_file: PathBuf,

    /// 是否覆盖已有的打包数据, 划分与模型.
    pub overwrite: bool,

    /// 训练图像根目录.
    pub img_path: PathBuf,

    /// 训练标签根目录.
    pub label_path: PathBuf,

    /// 随机种子. `None` 时从系统熵初始化.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let all_modalities = vec!["t1".to_string()];
        Self {
            image_shape: consts::IMAGE_SHAPE,
            patch_shape: None,
            labels: vec![consts::label::TUMOR],
            n_base_filters: 16,
            training_modalities: all_modalities.clone(),
            all_modalities,
            deconvolution: true,
            batch_size: 4,
            validation_batch_size: 8,
            n_epochs: 100,
            patience: 10,
            early_stop: 50,
            initial_learning_rate: 5e-4,
            learning_rate_drop: 0.5,
            validation_split: 0.8,
            flip: true,
            permute: true,
            distort: None,
            validation_patch_overlap: 0,
            training_patch_start_offset: Some(consts::TRAINING_PATCH_START_OFFSET),
            skip_blank: false,
            data_file: PathBuf::from(paths::DATA_FILE),
            model_file: PathBuf::from(paths::MODEL_FILE),
            training_file: PathBuf::from(paths::TRAINING_FILE),
            validation_file: PathBuf::from(paths::VALIDATION_FILE),
            overwrite: false,
            img_path: PathBuf::from(paths::IMG_PATH),
            label_path: PathBuf::from(paths::LABEL_PATH),
            seed: None,
        }
    }
}

impl Config {
    /// 从 JSON 文件读取配置. 文件中缺失的键取默认值, 未知键报错.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// 将配置以 JSON 格式写入文件.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|source| {
            ConfigError::Parse {
                path: path.to_owned(),
                source,
            }
        })
    }

    /// 标签个数.
    #[inline]
    pub fn n_labels(&self) -> usize {
        self.labels.len()
    }

    /// 输入通道个数, 即参与训练的模态数.
    #[inline]
    pub fn nb_channels(&self) -> usize {
        self.training_modalities.len()
    }

    /// 模型输入形状 `[通道, i, j, k]`. 有分块时取分块形状, 否则取图像形状.
    pub fn input_shape(&self) -> [usize; 4] {
        let [i, j, k] = self.patch_shape.unwrap_or(self.image_shape);
        [self.nb_channels(), i, j, k]
    }

    /// 真值在打包数据中所在的通道序号 (紧跟在全部输入通道之后).
    #[inline]
    pub fn truth_channel(&self) -> usize {
        self.nb_channels()
    }

    /// 是否需要数据增强.
    #[inline]
    pub fn augment(&self) -> bool {
        self.flip || self.distort.is_some()
    }

    /// 按键读取配置值, 包括派生键.
    pub fn get(&self, key: &str) -> Result<Value, ConfigError> {
        match key {
            "n_labels" => return Ok(Value::from(self.n_labels())),
            "nb_channels" => return Ok(Value::from(self.nb_channels())),
            "input_shape" => return Ok(Value::from(self.input_shape().to_vec())),
            "truth_channel" => return Ok(Value::from(self.truth_channel())),
            "augment" => return Ok(Value::from(self.augment())),
            _ => {}
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map
                .remove(key)
                .ok_or_else(|| ConfigError::UnknownKey(key.to_string())),
            _ => Err(ConfigError::UnknownKey(key.to_string())),
        }
    }

    /// 按键写入配置值. 派生键与未知键会被拒绝, 类型不匹配的值也会被拒绝,
    /// 被拒绝时配置保持不变.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        if DERIVED_KEYS.contains(&key) {
            return Err(ConfigError::DerivedKey(key.to_string()));
        }
        let invalid = |source| ConfigError::InvalidValue {
            key: key.to_string(),
            source,
        };
        let mut map = match serde_json::to_value(&*self).map_err(invalid)? {
            Value::Object(map) => map,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        };
        match map.get_mut(key) {
            Some(slot) => *slot = value,
            None => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        *self = serde_json::from_value(Value::Object(map)).map_err(invalid)?;
        Ok(())
    }

    /// 将全部文件路径相对 `base` 转为绝对路径. 已是绝对路径的保持不变.
    pub fn absolutized(mut self, base: &Path) -> Self {
        for p in [
            &mut self.data_file,
            &mut self.model_file,
            &mut self.training_file,
            &mut self.validation_file,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
        self
    }

    /// 检查参数取值是否合理.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Invalid(msg));

        if self.labels.is_empty() {
            return fail("`labels` must not be empty".into());
        }
        if self.training_modalities.is_empty() {
            return fail("`training_modalities` must not be empty".into());
        }
        if self.image_shape.contains(&0) {
            return fail("`image_shape` must not contain 0".into());
        }
        if self.batch_size == 0 || self.validation_batch_size == 0 {
            return fail("batch sizes must be positive".into());
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return fail(format!(
                "`validation_split` must be in (0, 1), got {}",
                self.validation_split
            ));
        }
        if !(self.learning_rate_drop > 0.0 && self.learning_rate_drop < 1.0) {
            return fail(format!(
                "`learning_rate_drop` must be in (0, 1), got {}",
                self.learning_rate_drop
            ));
        }
        if !(self.initial_learning_rate > 0.0 && self.initial_learning_rate.is_finite()) {
            return fail("`initial_learning_rate` must be positive".into());
        }
        if let Some(patch) = self.patch_shape {
            if patch.contains(&0) {
                return fail("`patch_shape` must not contain 0".into());
            }
            if patch.iter().zip(self.image_shape.iter()).any(|(p, i)| p > i) {
                return fail(format!(
                    "`patch_shape` {patch:?} exceeds `image_shape` {:?}",
                    self.image_shape
                ));
            }
            if patch.iter().any(|p| self.validation_patch_overlap >= *p) {
                return fail("`validation_patch_overlap` must be smaller than the patch".into());
            }
        }
        Ok(())
    }
}
