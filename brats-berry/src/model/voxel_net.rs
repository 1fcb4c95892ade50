//! 逐体素参考模型.
//!
//! 每个体素的特征为各通道的强度及其 3×3×3 邻域均值. 特征经过一层 ReLU 隐藏层
//! (宽度为 `n_base_filters`), 再对每个标签输出一个 sigmoid 概率.
//! 训练使用二元交叉熵与朴素 SGD, 每个样本只随机抽取部分体素参与梯度计算,
//! 其中前景体素最多占一半.

use super::{ModelError, SegmentationModel};
use crate::dataset::split::rng_from_seed;
use crate::generator::Batch;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 每个样本参与一次梯度计算的体素上限.
pub const DEFAULT_VOXELS_PER_SAMPLE: usize = 4096;

/// 推理时每次前向计算的体素个数.
const INFERENCE_CHUNK: usize = 1 << 14;

/// sigmoid 概率的截断, 避免 `ln(0)`.
const EPS: f32 = 1e-7;

fn fresh_rng() -> StdRng {
    rng_from_seed(None)
}

/// 沿 `axis` 做半径为 1 的均值滤波, 只对界内元素取平均.
fn mean_along(a: ArrayView3<f32>, axis: Axis) -> Array3<f32> {
    let mut out = Array3::zeros(a.raw_dim());
    for (src, mut dst) in a.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = src.len();
        for i in 0..n {
            let lo = i.saturating_sub(1);
            let hi = (i + 2).min(n);
            let window = src.slice(s![lo..hi]);
            dst[i] = window.sum() / window.len() as f32;
        }
    }
    out
}

/// 3×3×3 邻域均值. 三个方向的界内区域构成乘积集, 因此可以逐轴分离计算.
pub fn neighbourhood_mean(a: ArrayView3<f32>) -> Array3<f32> {
    let m = mean_along(a, Axis(0));
    let m = mean_along(m.view(), Axis(1));
    mean_along(m.view(), Axis(2))
}

/// 逐体素特征矩阵, 形状为 `(X·Y·Z) × (2·通道)`. 行按 (i, j, k) 的 C 顺序排列.
pub fn voxel_features(x: ArrayView4<f32>) -> Array2<f32> {
    let (c, nx, ny, nz) = x.dim();
    let n = nx * ny * nz;
    let mut f = Array2::zeros((n, 2 * c));
    for (ch, channel) in x.axis_iter(Axis(0)).enumerate() {
        let mean = neighbourhood_mean(channel);
        f.column_mut(2 * ch)
            .iter_mut()
            .zip(channel.iter())
            .for_each(|(o, v)| *o = *v);
        f.column_mut(2 * ch + 1)
            .iter_mut()
            .zip(mean.iter())
            .for_each(|(o, v)| *o = *v);
    }
    f
}

#[inline]
fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// 逐体素两层感知机.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelNet {
    input_shape: [usize; 4],
    n_labels: usize,
    n_base_filters: usize,
    initial_learning_rate: f32,
    voxels_per_sample: usize,
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

impl VoxelNet {
    /// 以 He 均匀分布初始化权重. 给定 `seed` 时初始化和体素抽样均可复现.
    pub fn new(
        input_shape: [usize; 4],
        n_labels: usize,
        initial_learning_rate: f32,
        n_base_filters: usize,
        seed: Option<u64>,
    ) -> Result<Self, ModelError> {
        if input_shape[0] == 0 || n_labels == 0 || n_base_filters == 0 {
            return Err(ModelError::InvalidHyperparameter(format!(
                "channels ({}), labels ({n_labels}) and base filters ({n_base_filters}) \
                 must be positive",
                input_shape[0]
            )));
        }
        if initial_learning_rate.is_nan() || initial_learning_rate <= 0.0 {
            return Err(ModelError::InvalidHyperparameter(format!(
                "learning rate must be positive, got {initial_learning_rate}"
            )));
        }
        let mut rng = rng_from_seed(seed);
        let d = 2 * input_shape[0];
        let h = n_base_filters;
        let u1 = Uniform::new_inclusive(-(6.0 / d as f32).sqrt(), (6.0 / d as f32).sqrt());
        let u2 = Uniform::new_inclusive(-(6.0 / h as f32).sqrt(), (6.0 / h as f32).sqrt());
        let w1 = Array2::from_shape_fn((h, d), |_| rng.sample(u1));
        let w2 = Array2::from_shape_fn((n_labels, h), |_| rng.sample(u2));
        Ok(Self {
            input_shape,
            n_labels,
            n_base_filters,
            initial_learning_rate,
            voxels_per_sample: DEFAULT_VOXELS_PER_SAMPLE,
            w1,
            b1: Array1::zeros(h),
            w2,
            b2: Array1::zeros(n_labels),
            rng,
        })
    }

    /// 从 `bincode` 文件加载.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ModelError::Io {
            path: path.to_owned(),
            source,
        })?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| ModelError::Bincode {
            path: path.to_owned(),
            source,
        })
    }

    /// 设置每个样本参与梯度计算的体素上限.
    pub fn with_voxels_per_sample(mut self, n: usize) -> Self {
        self.voxels_per_sample = n.max(1);
        self
    }

    /// 隐藏层宽度.
    #[inline]
    pub fn n_base_filters(&self) -> usize {
        self.n_base_filters
    }

    /// 构建时给定的初始学习率.
    #[inline]
    pub fn initial_learning_rate(&self) -> f32 {
        self.initial_learning_rate
    }

    fn check_channels(&self, found: usize) -> Result<(), ModelError> {
        if found != self.input_shape[0] {
            return Err(ModelError::Channels {
                expected: self.input_shape[0],
                found,
            });
        }
        Ok(())
    }

    fn check_labels(&self, found: usize) -> Result<(), ModelError> {
        if found != self.n_labels {
            return Err(ModelError::Labels {
                expected: self.n_labels,
                found,
            });
        }
        Ok(())
    }

    /// 前向计算. 返回 (隐藏层激活, 输出概率), 形状分别为 `n × h` 与 `n × L`.
    fn forward(&self, f: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let mut hidden = f.dot(&self.w1.t()) + &self.b1;
        hidden.mapv_inplace(|v| v.max(0.0));
        let mut out = hidden.dot(&self.w2.t()) + &self.b2;
        out.mapv_inplace(sigmoid);
        (hidden, out)
    }

    /// 平均二元交叉熵.
    fn bce(p: &Array2<f32>, y: &Array2<f32>) -> f32 {
        let n = p.len().max(1) as f32;
        let total: f32 = p
            .iter()
            .zip(y.iter())
            .map(|(&p, &y)| {
                let p = p.clamp(EPS, 1.0 - EPS);
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum();
        total / n
    }

    /// 真值矩阵, 形状为 `(X·Y·Z) × L`.
    fn target_matrix(y: ArrayView4<u8>) -> Array2<f32> {
        let (l, nx, ny, nz) = y.dim();
        let mut t = Array2::zeros((nx * ny * nz, l));
        for (label, channel) in y.axis_iter(Axis(0)).enumerate() {
            t.column_mut(label)
                .iter_mut()
                .zip(channel.iter())
                .for_each(|(o, v)| *o = f32::from(*v));
        }
        t
    }

    /// 抽取参与梯度计算的体素行号. 前景体素最多占一半.
    fn sample_rows(&mut self, target: &Array2<f32>) -> Vec<usize> {
        let n = target.nrows();
        let k = self.voxels_per_sample;
        if n <= k {
            return (0..n).collect();
        }
        let (fg, bg): (Vec<usize>, Vec<usize>) =
            (0..n).partition(|&r| target.row(r).iter().any(|v| *v > 0.0));
        let n_fg = fg.len().min(k / 2);
        let n_bg = (k - n_fg).min(bg.len());
        let mut rows: Vec<usize> = index::sample(&mut self.rng, fg.len(), n_fg)
            .into_iter()
            .map(|i| fg[i])
            .collect();
        rows.extend(
            index::sample(&mut self.rng, bg.len(), n_bg)
                .into_iter()
                .map(|i| bg[i]),
        );
        rows
    }

    /// 对一批抽样体素做一步 SGD, 返回步前的损失.
    fn sgd_step(&mut self, f: &Array2<f32>, y: &Array2<f32>, learning_rate: f32) -> f32 {
        let (hidden, p) = self.forward(f.view());
        let loss = Self::bce(&p, y);
        let n = f.nrows().max(1) as f32;

        let delta2 = (&p - y) / n;
        let grad_w2 = delta2.t().dot(&hidden);
        let grad_b2 = delta2.sum_axis(Axis(0));
        let mut delta1 = delta2.dot(&self.w2);
        delta1.zip_mut_with(&hidden, |d, &h| {
            if h <= 0.0 {
                *d = 0.0;
            }
        });
        let grad_w1 = delta1.t().dot(f);
        let grad_b1 = delta1.sum_axis(Axis(0));

        self.w2.scaled_add(-learning_rate, &grad_w2);
        self.b2.scaled_add(-learning_rate, &grad_b2);
        self.w1.scaled_add(-learning_rate, &grad_w1);
        self.b1.scaled_add(-learning_rate, &grad_b1);
        loss
    }

    #[cfg(feature = "rayon")]
    fn forward_chunks(&self, f: &Array2<f32>, chunks: &[(usize, usize)]) -> Vec<Array2<f32>> {
        chunks
            .par_iter()
            .map(|&(lo, hi)| self.forward(f.slice(s![lo..hi, ..])).1)
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    fn forward_chunks(&self, f: &Array2<f32>, chunks: &[(usize, usize)]) -> Vec<Array2<f32>> {
        chunks
            .iter()
            .map(|&(lo, hi)| self.forward(f.slice(s![lo..hi, ..])).1)
            .collect()
    }
}

impl SegmentationModel for VoxelNet {
    fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    fn n_labels(&self) -> usize {
        self.n_labels
    }

    fn train_on_batch(&mut self, batch: &Batch, learning_rate: f32) -> Result<f32, ModelError> {
        self.check_channels(batch.x.len_of(Axis(1)))?;
        self.check_labels(batch.y.len_of(Axis(1)))?;
        let mut feats = Vec::with_capacity(batch.len());
        let mut targets = Vec::with_capacity(batch.len());
        for (x, y) in batch.x.outer_iter().zip(batch.y.outer_iter()) {
            let f = voxel_features(x);
            let t = Self::target_matrix(y);
            let rows = self.sample_rows(&t);
            feats.push(f.select(Axis(0), &rows));
            targets.push(t.select(Axis(0), &rows));
        }
        let fv: Vec<_> = feats.iter().map(|a| a.view()).collect();
        let tv: Vec<_> = targets.iter().map(|a| a.view()).collect();
        let f = ndarray::concatenate(Axis(0), &fv)?;
        let t = ndarray::concatenate(Axis(0), &tv)?;
        Ok(self.sgd_step(&f, &t, learning_rate))
    }

    fn evaluate(&self, batch: &Batch) -> Result<f32, ModelError> {
        self.check_channels(batch.x.len_of(Axis(1)))?;
        self.check_labels(batch.y.len_of(Axis(1)))?;
        let mut total = 0.0;
        for (x, y) in batch.x.outer_iter().zip(batch.y.outer_iter()) {
            let (_, p) = self.forward(voxel_features(x).view());
            total += Self::bce(&p, &Self::target_matrix(y));
        }
        Ok(total / batch.len().max(1) as f32)
    }

    fn predict(&self, x: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        self.check_channels(x.len_of(Axis(0)))?;
        let (_, nx, ny, nz) = x.dim();
        let f = voxel_features(x);
        let n = f.nrows();
        let chunks: Vec<_> = (0..n)
            .step_by(INFERENCE_CHUNK)
            .map(|lo| (lo, (lo + INFERENCE_CHUNK).min(n)))
            .collect();
        let parts = self.forward_chunks(&f, &chunks);
        let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
        let p = if views.is_empty() {
            Array2::zeros((0, self.n_labels))
        } else {
            ndarray::concatenate(Axis(0), &views)?
        };
        let p = p.t().as_standard_layout().into_owned();
        Ok(p.into_shape((self.n_labels, nx, ny, nz))?)
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let io_err = |source| ModelError::Io {
            path: path.to_owned(),
            source,
        };
        let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
        bincode::serialize_into(&mut w, self).map_err(|source| ModelError::Bincode {
            path: path.to_owned(),
            source,
        })?;
        w.flush().map_err(io_err)
    }
}
