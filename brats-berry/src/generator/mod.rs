//! 训练/验证数据生成器.
//!
//! 生成器是无穷迭代器: 每遍历完一轮样本就重新构建样本列表 (训练时重新打乱,
//! 分块起点重新随机), 永不返回 `None`. 调用方通过 [`get_number_of_steps`] 控制每轮步数.

use crate::config::Config;
use crate::dataset::split::rng_from_seed;
use crate::dataset::{get_validation_split, DatasetError, PackedDataset, SplitError};
use crate::Shape3d;
use ndarray::{Array3, Array4, Array5, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

mod patch;

pub use patch::{
    compute_patch_indices, get_patch_from_3d_data, get_patch_from_4d_data, random_start_offset,
    reconstruct_from_patches, PatchIndex,
};

/// 生成器错误.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// 读取打包数据失败.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// 划分记录读写失败.
    #[error(transparent)]
    Split(#[from] SplitError),

    /// 数组拼接失败.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// 生成器没有任何样本.
    #[error("{0} generator has no samples")]
    NoSamples(&'static str),

    /// 数据集不含真值, 无法生成训练批次.
    #[error("dataset carries no ground truth")]
    NoTruth,
}

/// 生成器参数.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorOptions {
    /// 打包数据的空间形状.
    pub image_shape: Shape3d,

    /// 训练批大小.
    pub batch_size: usize,

    /// 验证批大小.
    pub validation_batch_size: usize,

    /// 训练集占比.
    pub validation_split: f64,

    /// 待分割的标签值. 第 `l` 个输出通道对应 `labels[l]`.
    pub labels: Vec<u8>,

    /// 分块形状. `None` 表示整图训练.
    pub patch_shape: Option<Shape3d>,

    /// 验证分块的重叠体素数.
    pub validation_patch_overlap: usize,

    /// 训练分块的随机起点范围.
    pub training_patch_start_offset: Option<Shape3d>,

    /// 跳过真值全为背景的样本.
    pub skip_blank: bool,

    /// 训练时随机翻转.
    pub flip: bool,

    /// 训练时随机置换轴. 不支持, 仅告警.
    pub permute: bool,

    /// 训练时随机形变. 不支持, 仅告警.
    pub distort: Option<f32>,
}

impl GeneratorOptions {
    /// 从配置中提取.
    pub fn from_config(config: &Config) -> Self {
        Self {
            image_shape: config.image_shape,
            batch_size: config.batch_size,
            validation_batch_size: config.validation_batch_size,
            validation_split: config.validation_split,
            labels: config.labels.clone(),
            patch_shape: config.patch_shape,
            validation_patch_overlap: config.validation_patch_overlap,
            training_patch_start_offset: config.training_patch_start_offset,
            skip_blank: config.skip_blank,
            flip: config.flip,
            permute: config.permute,
            distort: config.distort,
        }
    }
}

/// 每轮步数. `n` 不超过 `batch_size` 时每个样本单独成步.
pub fn get_number_of_steps(n_samples: usize, batch_size: usize) -> usize {
    if n_samples <= batch_size {
        n_samples
    } else if n_samples % batch_size == 0 {
        n_samples / batch_size
    } else {
        n_samples / batch_size + 1
    }
}

/// 一个批次.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// 输入, 形状为 `(批, 通道, X, Y, Z)`.
    pub x: Array5<f32>,

    /// 多热编码的真值, 形状为 `(批, 标签数, X, Y, Z)`.
    pub y: Array5<u8>,
}

impl Batch {
    /// 批内样本数.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 在空间轴上翻转 `通道 × X × Y × Z` 数据. `axes[a]` 为真时翻转第 `a` 个空间轴.
pub fn flip_spatial_axes<A>(data: &mut Array4<A>, axes: [bool; 3]) {
    for (a, &flip) in axes.iter().enumerate() {
        if flip {
            data.invert_axis(Axis(a + 1));
        }
    }
}

/// 将真值按 `labels` 展开为多热编码, 形状为 `标签数 × X × Y × Z`.
pub fn multi_class_labels(truth: &Array3<u8>, labels: &[u8]) -> Array4<u8> {
    let (x, y, z) = truth.dim();
    let mut out = Array4::zeros((labels.len(), x, y, z));
    for (mut channel, &label) in out.axis_iter_mut(Axis(0)).zip(labels) {
        Zip::from(&mut channel)
            .and(truth)
            .for_each(|o, &t| *o = u8::from(t == label));
    }
    out
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Sample {
    ordinal: usize,
    patch: Option<PatchIndex>,
}

#[derive(Copy, Clone, Debug)]
struct Patching {
    shape: Shape3d,
    overlap: usize,
    start_offset: Option<Shape3d>,
}

/// 批次生成器. 对每个 [`Iterator::next`] 调用总是返回 `Some`.
pub struct BatchGenerator<'a> {
    name: &'static str,
    dataset: &'a PackedDataset,
    ordinals: Vec<usize>,
    image_shape: Shape3d,
    labels: Vec<u8>,
    batch_size: usize,
    patching: Option<Patching>,
    skip_blank: bool,
    flip: bool,
    shuffle: bool,
    rng: StdRng,
    queue: Vec<Sample>,
    cursor: usize,
}

impl BatchGenerator<'_> {
    /// 该生成器使用的受试者序号.
    #[inline]
    pub fn ordinals(&self) -> &[usize] {
        &self.ordinals
    }

    /// 批大小.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 构建一轮的样本列表.
    fn sample_list(&mut self) -> Result<Vec<Sample>, GeneratorError> {
        let mut samples = Vec::new();
        for &ordinal in &self.ordinals {
            match self.patching {
                None => samples.push(Sample {
                    ordinal,
                    patch: None,
                }),
                Some(p) => {
                    let start = p
                        .start_offset
                        .map(|offset| random_start_offset(offset, &mut self.rng));
                    samples.extend(
                        compute_patch_indices(self.image_shape, p.shape, p.overlap, start)
                            .into_iter()
                            .map(|idx| Sample {
                                ordinal,
                                patch: Some(idx),
                            }),
                    );
                }
            }
        }
        if self.skip_blank {
            samples = self.drop_blank(samples)?;
        }
        if self.shuffle {
            samples.shuffle(&mut self.rng);
        }
        Ok(samples)
    }

    /// 去除真值全为背景的样本. `samples` 按受试者序号分组排列.
    fn drop_blank(&self, samples: Vec<Sample>) -> Result<Vec<Sample>, GeneratorError> {
        let mut cached: Option<(usize, Array3<u8>)> = None;
        let mut ans = Vec::with_capacity(samples.len());
        for s in samples {
            let truth = match cached.take() {
                Some((o, t)) if o == s.ordinal => t,
                _ => self.dataset.truth(s.ordinal)?,
            };
            let blank = match (s.patch, self.patching) {
                (Some(idx), Some(p)) => get_patch_from_3d_data(truth.view(), p.shape, idx)
                    .iter()
                    .all(|v| *v == 0),
                _ => truth.iter().all(|v| *v == 0),
            };
            if !blank {
                ans.push(s);
            }
            cached = Some((s.ordinal, truth));
        }
        Ok(ans)
    }

    /// 样本总数 (每轮). 训练生成器的分块起点是随机的, 因此该值为一次抽样的结果.
    pub fn count_samples(&mut self) -> Result<usize, GeneratorError> {
        Ok(self.sample_list()?.len())
    }

    /// 读取单个样本. `flip` 为各空间轴是否翻转.
    fn load(
        &self,
        s: Sample,
        flip: Option<[bool; 3]>,
    ) -> Result<(Array4<f32>, Array4<u8>), GeneratorError> {
        let data = self.dataset.data(s.ordinal)?;
        let truth = self.dataset.truth(s.ordinal)?;
        let (mut x, truth) = match (s.patch, self.patching) {
            (Some(idx), Some(p)) => (
                get_patch_from_4d_data(data.view(), p.shape, idx),
                get_patch_from_3d_data(truth.view(), p.shape, idx),
            ),
            _ => (data, truth),
        };
        let mut y = multi_class_labels(&truth, &self.labels);
        if let Some(axes) = flip {
            flip_spatial_axes(&mut x, axes);
            flip_spatial_axes(&mut y, axes);
        }
        Ok((x, y))
    }

    /// 并行读取一个批次. 每个样本各占用数据集的一个工作通道.
    #[cfg(feature = "rayon")]
    fn load_batch(
        &self,
        picked: Vec<(Sample, Option<[bool; 3]>)>,
    ) -> Result<Vec<(Array4<f32>, Array4<u8>)>, GeneratorError> {
        picked
            .into_par_iter()
            .map(|(s, flip)| self.load(s, flip))
            .collect()
    }

    /// 依次读取一个批次.
    #[cfg(not(feature = "rayon"))]
    fn load_batch(
        &self,
        picked: Vec<(Sample, Option<[bool; 3]>)>,
    ) -> Result<Vec<(Array4<f32>, Array4<u8>)>, GeneratorError> {
        picked
            .into_iter()
            .map(|(s, flip)| self.load(s, flip))
            .collect()
    }

    fn next_batch(&mut self) -> Result<Batch, GeneratorError> {
        if self.cursor >= self.queue.len() {
            self.queue = self.sample_list()?;
            self.cursor = 0;
            if self.queue.is_empty() {
                return Err(GeneratorError::NoSamples(self.name));
            }
        }
        let end = (self.cursor + self.batch_size).min(self.queue.len());
        let samples = self.queue[self.cursor..end].to_vec();
        self.cursor = end;

        // 翻转轴在主线程抽取, 保证同一种子下结果与读取顺序无关.
        let picked: Vec<_> = samples
            .into_iter()
            .map(|s| {
                let flip = self
                    .flip
                    .then(|| std::array::from_fn(|_| self.rng.gen_bool(0.5)));
                (s, flip)
            })
            .collect();
        let (xs, ys): (Vec<_>, Vec<_>) = self.load_batch(picked)?.into_iter().unzip();
        let xv: Vec<_> = xs.iter().map(|a| a.view()).collect();
        let yv: Vec<_> = ys.iter().map(|a| a.view()).collect();
        Ok(Batch {
            x: ndarray::stack(Axis(0), &xv)?,
            y: ndarray::stack(Axis(0), &yv)?,
        })
    }
}

impl Iterator for BatchGenerator<'_> {
    type Item = Result<Batch, GeneratorError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// 训练/验证生成器及其每轮步数.
pub struct Generators<'a> {
    /// 训练生成器.
    pub training: BatchGenerator<'a>,

    /// 验证生成器.
    pub validation: BatchGenerator<'a>,

    /// 每轮训练步数.
    pub n_training_steps: usize,

    /// 每轮验证步数.
    pub n_validation_steps: usize,
}

/// 创建训练/验证生成器.
///
/// 划分记录由 [`get_validation_split`] 获取或生成. 训练分块不重叠且起点随机,
/// 验证分块按 `validation_patch_overlap` 重叠且网格居中.
pub fn get_training_and_validation_generators<'a>(
    dataset: &'a PackedDataset,
    options: &GeneratorOptions,
    overwrite: bool,
    validation_file: &Path,
    training_file: &Path,
    seed: Option<u64>,
) -> Result<Generators<'a>, GeneratorError> {
    if !dataset.has_truth() {
        return Err(GeneratorError::NoTruth);
    }
    if options.permute {
        log::warn!("permutation augmentation is not supported and will be skipped");
    }
    if options.distort.is_some() {
        log::warn!("distortion augmentation is not supported and will be skipped");
    }

    let split = get_validation_split(
        dataset.len(),
        options.validation_split,
        training_file,
        validation_file,
        overwrite,
        seed,
    )?;
    let mut rng = rng_from_seed(seed);

    let mut training = BatchGenerator {
        name: "training",
        dataset,
        ordinals: split.training,
        image_shape: options.image_shape,
        labels: options.labels.clone(),
        batch_size: options.batch_size,
        patching: options.patch_shape.map(|shape| Patching {
            shape,
            overlap: 0,
            start_offset: options.training_patch_start_offset,
        }),
        skip_blank: options.skip_blank,
        flip: options.flip,
        shuffle: true,
        rng: StdRng::seed_from_u64(rng.gen()),
        queue: Vec::new(),
        cursor: 0,
    };
    let mut validation = BatchGenerator {
        name: "validation",
        dataset,
        ordinals: split.validation,
        image_shape: options.image_shape,
        labels: options.labels.clone(),
        batch_size: options.validation_batch_size,
        patching: options.patch_shape.map(|shape| Patching {
            shape,
            overlap: options.validation_patch_overlap,
            start_offset: None,
        }),
        skip_blank: options.skip_blank,
        flip: false,
        shuffle: false,
        rng: StdRng::seed_from_u64(rng.gen()),
        queue: Vec::new(),
        cursor: 0,
    };

    let n_training = training.count_samples()?;
    if n_training == 0 {
        return Err(GeneratorError::NoSamples("training"));
    }
    let n_validation = validation.count_samples()?;
    let n_training_steps = get_number_of_steps(n_training, options.batch_size);
    let n_validation_steps = get_number_of_steps(n_validation, options.validation_batch_size);
    log::info!("number of training steps: {n_training_steps}");
    log::info!("number of validation steps: {n_validation_steps}");
    Ok(Generators {
        training,
        validation,
        n_training_steps,
        n_validation_steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{write_data_to_file, FileGroup};
    use crate::{Affine, MriLabel, MriScan};

    #[test]
    fn test_number_of_steps() {
        assert_eq!(get_number_of_steps(3, 4), 3);
        assert_eq!(get_number_of_steps(4, 4), 4);
        assert_eq!(get_number_of_steps(8, 4), 2);
        assert_eq!(get_number_of_steps(9, 4), 3);
        assert_eq!(get_number_of_steps(0, 4), 0);
    }

    #[test]
    fn test_multi_class_labels() {
        let mut t = Array3::<u8>::zeros((2, 2, 2));
        t[(0, 0, 0)] = 1;
        t[(1, 1, 1)] = 4;
        let y = multi_class_labels(&t, &[1, 2, 4]);
        assert_eq!(y.dim(), (3, 2, 2, 2));
        assert_eq!(y[(0, 0, 0, 0)], 1);
        assert_eq!(y.index_axis(Axis(0), 1).sum(), 0);
        assert_eq!(y[(2, 1, 1, 1)], 1);
        assert_eq!(y.sum(), 2);
    }

    #[test]
    fn test_flip_spatial_axes() {
        let mut a = Array4::from_shape_fn((1, 2, 1, 1), |(_, i, _, _)| i as u8);
        flip_spatial_axes(&mut a, [true, false, false]);
        assert_eq!(a[(0, 0, 0, 0)], 1);
        assert_eq!(a[(0, 1, 0, 0)], 0);
    }

    fn packed_dataset(dir: &Path, n: usize, blank: &[usize]) -> PackedDataset {
        let affine = Affine::identity();
        let mut groups = Vec::new();
        let mut ids = Vec::new();
        for s in 0..n {
            let img = dir.join(format!("s{s}_img.nii"));
            let label = dir.join(format!("s{s}_label.nii"));
            let data = Array3::from_shape_fn((4, 4, 4), |(i, j, k)| (i + j + k + s) as f32);
            MriScan::from_affine(data, &affine).save(&img).unwrap();
            let mut t = Array3::<u8>::zeros((4, 4, 4));
            if !blank.contains(&s) {
                t[(0, 0, 0)] = 1;
            }
            MriLabel::from_affine(t, &affine).save(&label).unwrap();
            groups.push(FileGroup::new(vec![img, label]));
            ids.push(format!("s{s}"));
        }
        let refs: Vec<_> = groups.iter().collect();
        let id_refs: Vec<_> = ids.iter().map(String::as_str).collect();
        let out = dir.join("data.npz");
        write_data_to_file(&refs, &out, [4, 4, 4], &id_refs, true).unwrap();
        PackedDataset::open(out).unwrap()
    }

    fn options() -> GeneratorOptions {
        let mut c = Config::default();
        c.image_shape = [4, 4, 4];
        c.batch_size = 2;
        c.validation_batch_size = 2;
        c.validation_split = 0.75;
        c.training_patch_start_offset = None;
        GeneratorOptions::from_config(&c)
    }

    #[test]
    fn test_whole_image_generators() {
        let dir = tempfile::tempdir().unwrap();
        let ds = packed_dataset(dir.path(), 4, &[]);
        let mut g = get_training_and_validation_generators(
            &ds,
            &options(),
            false,
            &dir.path().join("v.bin"),
            &dir.path().join("t.bin"),
            Some(0),
        )
        .unwrap();
        assert_eq!(g.training.ordinals().len(), 3);
        assert_eq!(g.validation.ordinals().len(), 1);
        assert_eq!(g.n_training_steps, 2);
        assert_eq!(g.n_validation_steps, 1);

        let b = g.training.next().unwrap().unwrap();
        assert_eq!(b.x.shape(), &[2, 1, 4, 4, 4]);
        assert_eq!(b.y.shape(), &[2, 1, 4, 4, 4]);
        // 每轮末尾的不完整批次也会被产出.
        assert_eq!(g.training.next().unwrap().unwrap().len(), 1);
        // 生成器是无穷的.
        for _ in 0..5 {
            assert!(g.validation.next().unwrap().is_ok());
        }
    }

    #[test]
    fn test_patch_generators_and_skip_blank() {
        let dir = tempfile::tempdir().unwrap();
        let ds = packed_dataset(dir.path(), 4, &[1, 2, 3]);
        let mut opt = options();
        opt.patch_shape = Some([2, 2, 2]);
        opt.validation_split = 1.0;
        opt.skip_blank = true;
        opt.flip = false;
        let mut g = get_training_and_validation_generators(
            &ds,
            &opt,
            false,
            &dir.path().join("v.bin"),
            &dir.path().join("t.bin"),
            Some(0),
        )
        .unwrap();
        // 只有 s0 的 (0, 0, 0) 块非空.
        assert_eq!(g.n_training_steps, 1);
        assert_eq!(g.n_validation_steps, 0);
        let b = g.training.next().unwrap().unwrap();
        assert_eq!(b.x.shape(), &[1, 1, 2, 2, 2]);
        assert_eq!(b.y[(0, 0, 0, 0, 0)], 1);
    }

    #[test]
    fn test_no_training_samples() {
        let dir = tempfile::tempdir().unwrap();
        let ds = packed_dataset(dir.path(), 1, &[]);
        let r = get_training_and_validation_generators(
            &ds,
            &options(),
            false,
            &dir.path().join("v.bin"),
            &dir.path().join("t.bin"),
            None,
        );
        assert!(matches!(r, Err(GeneratorError::NoSamples("training"))));
    }

    #[test]
    fn test_batches_do_not_depend_on_reader_count() {
        let dir = tempfile::tempdir().unwrap();
        let single = packed_dataset(dir.path(), 4, &[]);
        let multi = PackedDataset::open_with_workers(
            std::num::NonZeroUsize::new(3).unwrap(),
            dir.path().join("data.npz"),
        )
        .unwrap();
        let batches = |ds: &PackedDataset| {
            let g = get_training_and_validation_generators(
                ds,
                &options(),
                false,
                &dir.path().join("v.bin"),
                &dir.path().join("t.bin"),
                Some(7),
            )
            .unwrap();
            g.training
                .take(4)
                .map(|b| b.unwrap())
                .collect::<Vec<_>>()
        };
        let a = batches(&single);
        let b = batches(&multi);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.x, y.x);
            assert_eq!(x.y, y.y);
        }
    }
}
