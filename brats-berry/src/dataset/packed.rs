//! 打包数据集.
//!
//! 所有受试者被重采样到统一形状并标准化后, 存入单个 `.npz` 归档:
//!
//! | 条目 | 类型 | 形状 |
//! |-----|-----|-----|
//! | `data_{n}` | `f32` | `通道 × X × Y × Z` |
//! | `affine_{n}` | `f32` | `4 × 4` |
//! | `truth_{n}` | `u8` | `X × Y × Z`, 仅当包含真值时 |
//! | `subject_ids` | `u8` | UTF-8, 以 `\n` 分隔 |
//! | `meta` | `u32` | `[受试者个数, 是否包含真值]` |

use super::FileGroup;
use crate::data::mean_std;
use crate::data::resample::{resize_label, resize_scan, Interpolation};
use crate::{Affine, MriLabel, MriScan, NiftiHeaderAttr, Shape3d, VolumeError};
use ndarray::{Array, Array1, Array3, Array4, Axis, Dimension, Ix1, Ix2, Ix3, Ix4, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, ReadableElement, WriteNpzError};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
    }
}

const SUBJECT_IDS: &str = "subject_ids";
const META: &str = "meta";

/// 打包数据集读写错误.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// 读取原始体数据失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 底层 I/O 错误.
    #[error("`{path}`: {source}")]
    Io {
        /// 出错的文件.
        path: PathBuf,

        /// 底层错误.
        source: std::io::Error,
    },

    /// 写出 npz 归档失败.
    #[error(transparent)]
    WriteNpz(#[from] WriteNpzError),

    /// 读取 npz 归档失败.
    #[error(transparent)]
    ReadNpz(#[from] ReadNpzError),

    /// 文件组与受试者 id 个数不一致.
    #[error("{file_groups} file groups but {subject_ids} subject ids")]
    LengthMismatch {
        /// 文件组个数.
        file_groups: usize,

        /// 受试者 id 个数.
        subject_ids: usize,
    },

    /// 没有任何受试者.
    #[error("no subjects to pack")]
    Empty,

    /// 要求打包真值, 但文件组中没有标签文件.
    #[error("subject `{0}` has no label file")]
    MissingTruth(String),

    /// 同一受试者各通道的形状不一致.
    #[error("subject `{subject}`: channel shape {found:?} differs from {expected:?}")]
    ChannelShape {
        /// 受试者 id.
        subject: String,

        /// 第 0 个通道的形状.
        expected: Shape3d,

        /// 不一致的形状.
        found: Shape3d,
    },

    /// 各受试者的通道数不一致.
    #[error("subject `{subject}` has {found} channels, expected {expected}")]
    ChannelCount {
        /// 受试者 id.
        subject: String,

        /// 期望的通道数.
        expected: usize,

        /// 实际通道数.
        found: usize,
    },

    /// 归档结构损坏或不完整.
    #[error("`{path}` is not a valid packed dataset: {reason}")]
    Corrupt {
        /// 归档路径.
        path: PathBuf,

        /// 原因.
        reason: String,
    },

    /// 受试者序号越界.
    #[error("subject ordinal {index} is out of range (dataset has {len})")]
    OutOfRange {
        /// 请求的序号.
        index: usize,

        /// 数据集大小.
        len: usize,
    },

    /// 数据集不包含真值.
    #[error("dataset carries no ground truth")]
    NoTruth,

    /// 工作通道过多. 最多支持 64.
    #[error("too many workers, at most {0} supported")]
    TooManyWorkers(usize),
}

/// 单个受试者重采样后的数据.
struct Sample {
    data: Array4<f32>,
    affine: Affine,
    truth: Option<Array3<u8>>,
}

/// 读取一个文件组并重采样到 `image_shape`. 图像使用三线性插值, 真值使用最近邻.
fn load_subject(
    group: &FileGroup,
    subject: &str,
    image_shape: Shape3d,
    save_truth: bool,
) -> Result<Sample, DatasetError> {
    let (images, truth) = group.split_truth(save_truth);
    if save_truth && truth.is_none() {
        return Err(DatasetError::MissingTruth(subject.to_string()));
    }

    let mut channels = Vec::with_capacity(images.len());
    let mut affine = Affine::identity();
    let mut expected = None;
    for path in images {
        let scan = MriScan::open(path)?;
        let shape = scan.shape();
        match expected {
            None => expected = Some(shape),
            Some(e) if e != shape => {
                return Err(DatasetError::ChannelShape {
                    subject: subject.to_string(),
                    expected: e,
                    found: shape,
                })
            }
            Some(_) => {}
        }
        let (data, new_affine) = resize_scan(&scan, image_shape, Interpolation::Linear)?;
        affine = new_affine;
        channels.push(data);
    }
    let views: Vec<_> = channels.iter().map(|c| c.view()).collect();
    let data = ndarray::stack(Axis(0), &views).map_err(VolumeError::from)?;

    let truth = match truth {
        Some(path) => Some(resize_label(&MriLabel::open(path)?, image_shape)?.0),
        None => None,
    };
    log::debug!("loaded subject `{subject}`, {} channels", images.len());
    Ok(Sample {
        data,
        affine,
        truth,
    })
}

/// 并行读取所有受试者.
#[cfg(feature = "rayon")]
fn load_all(
    file_groups: &[&FileGroup],
    subject_ids: &[&str],
    image_shape: Shape3d,
    save_truth: bool,
) -> Result<Vec<Sample>, DatasetError> {
    file_groups
        .par_iter()
        .zip(subject_ids.par_iter())
        .map(|(group, subject)| load_subject(group, subject, image_shape, save_truth))
        .collect()
}

/// 依次读取所有受试者.
#[cfg(not(feature = "rayon"))]
fn load_all(
    file_groups: &[&FileGroup],
    subject_ids: &[&str],
    image_shape: Shape3d,
    save_truth: bool,
) -> Result<Vec<Sample>, DatasetError> {
    file_groups
        .iter()
        .zip(subject_ids)
        .map(|(group, subject)| load_subject(group, subject, image_shape, save_truth))
        .collect()
}

/// 每个通道的 (均值, 标准差).
fn channel_stats(data: &Array4<f32>) -> Vec<(f64, f64)> {
    data.axis_iter(Axis(0)).map(mean_std).collect()
}

/// 用 "各受试者均值的均值" 与 "各受试者标准差的均值" 对每个通道做 z-score 标准化.
fn normalize(samples: &mut [Sample]) {
    let n_channels = samples.first().map_or(0, |s| s.data.len_of(Axis(0)));
    let mut mean = vec![0f64; n_channels];
    let mut std = vec![0f64; n_channels];
    for s in samples.iter() {
        for (c, (m, sd)) in channel_stats(&s.data).into_iter().enumerate() {
            mean[c] += m;
            std[c] += sd;
        }
    }
    let count = samples.len().max(1) as f64;
    for c in 0..n_channels {
        mean[c] /= count;
        std[c] /= count;
        log::debug!("channel {c}: mean = {:.4}, std = {:.4}", mean[c], std[c]);
    }

    for s in samples.iter_mut() {
        for (c, mut channel) in s.data.axis_iter_mut(Axis(0)).enumerate() {
            let (m, sd) = (mean[c] as f32, std[c] as f32);
            if sd > 0.0 {
                channel.mapv_inplace(|v| (v - m) / sd);
            } else {
                channel.mapv_inplace(|v| v - m);
            }
        }
    }
}

/// 同目录下的临时文件路径.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// 写入中的临时文件. 未经 [`TempFile::persist`] 就被丢弃时删除该文件.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn create(path: PathBuf) -> Result<(Self, File), DatasetError> {
        let file = File::create(&path).map_err(|source| DatasetError::Io {
            path: path.clone(),
            source,
        })?;
        Ok((Self { path, armed: true }, file))
    }

    /// 重命名为 `to`.
    fn persist(mut self, to: &Path) -> Result<(), DatasetError> {
        fs::rename(&self.path, to).map_err(|source| DatasetError::Io {
            path: to.to_owned(),
            source,
        })?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("failed to remove `{}`: {e}", self.path.display());
            }
        }
    }
}

/// 将全部样本写入 `file`.
fn write_npz(
    file: File,
    samples: &[Sample],
    subject_ids: &[&str],
    save_truth: bool,
) -> Result<(), DatasetError> {
    let mut npz = NpzWriter::new(file);
    for (n, s) in samples.iter().enumerate() {
        npz.add_array(format!("data_{n}"), &s.data)?;
        npz.add_array(format!("affine_{n}"), &s.affine.to_array())?;
        if let Some(truth) = &s.truth {
            npz.add_array(format!("truth_{n}"), truth)?;
        }
    }
    let ids = Array1::from(subject_ids.join("\n").into_bytes());
    npz.add_array(SUBJECT_IDS, &ids)?;
    let meta = Array1::from(vec![samples.len() as u32, u32::from(save_truth)]);
    npz.add_array(META, &meta)?;
    npz.finish()?;
    Ok(())
}

/// 将文件组打包为 `.npz` 归档.
///
/// 所有图像被缩放到 `image_shape` 并按通道标准化. `save_truth` 为真时,
/// 每个文件组的最后一个文件作为真值一并写入.
///
/// 先写入同目录下的临时文件, 成功后再重命名为 `path`, 因此中途失败不会留下半成品.
pub fn write_data_to_file<P: AsRef<Path>>(
    file_groups: &[&FileGroup],
    path: P,
    image_shape: Shape3d,
    subject_ids: &[&str],
    save_truth: bool,
) -> Result<(), DatasetError> {
    let path = path.as_ref();
    if file_groups.len() != subject_ids.len() {
        return Err(DatasetError::LengthMismatch {
            file_groups: file_groups.len(),
            subject_ids: subject_ids.len(),
        });
    }
    if file_groups.is_empty() {
        return Err(DatasetError::Empty);
    }
    log::info!(
        "packing {} subjects into `{}` at shape {image_shape:?}",
        subject_ids.len(),
        path.display()
    );

    let mut samples = load_all(file_groups, subject_ids, image_shape, save_truth)?;
    let n_channels = samples[0].data.len_of(Axis(0));
    for (s, subject) in samples.iter().zip(subject_ids) {
        let found = s.data.len_of(Axis(0));
        if found != n_channels {
            return Err(DatasetError::ChannelCount {
                subject: subject.to_string(),
                expected: n_channels,
                found,
            });
        }
    }
    normalize(&mut samples);

    let (tmp, file) = TempFile::create(temp_path(path))?;
    write_npz(file, &samples, subject_ids, save_truth)?;
    tmp.persist(path)?;
    log::info!("packed dataset written to `{}`", path.display());
    Ok(())
}

/// 幂等地确保打包数据集存在.
///
/// 仅当 `path` 不存在或 `overwrite` 为真时才真正打包. 返回是否进行了打包.
pub fn ensure_data_file<P: AsRef<Path>>(
    file_groups: &[&FileGroup],
    path: P,
    image_shape: Shape3d,
    subject_ids: &[&str],
    save_truth: bool,
    overwrite: bool,
) -> Result<bool, DatasetError> {
    let path = path.as_ref();
    if path.exists() && !overwrite {
        log::info!("reusing packed dataset `{}`", path.display());
        return Ok(false);
    }
    write_data_to_file(file_groups, path, image_shape, subject_ids, save_truth)?;
    Ok(true)
}

/// 去掉条目名末尾的 `.npy`.
fn entry_stem(name: &str) -> &str {
    let mut stem = name;
    while let Some(s) = stem.strip_suffix(".npy") {
        stem = s;
    }
    stem
}

/// 获取锁. 读取中途 panic 不会破坏 reader 的状态, 因此忽略中毒标记.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 已打开的打包数据集.
///
/// 该结构持有底层文件句柄, 在离开作用域时 (包括出错提前返回的路径) 自动释放.
/// 也可以调用 [`PackedDataset::close`] 显式释放.
///
/// 与 `NpzReader` 不同, 读取方法只需要 `&self`: 每个工作通道由一把锁保护,
/// 多个线程可以并发读取不同的受试者.
pub struct PackedDataset {
    path: PathBuf,
    entries: Vec<Mutex<NpzReader<File>>>,
    turn: AtomicUsize,
    names: HashMap<String, String>,
    subject_ids: Vec<String>,
    has_truth: bool,
}

impl PackedDataset {
    /// 以单个工作通道打开.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        Self::open_with_workers(NonZeroUsize::MIN, path)
    }

    /// 初始化.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点 (以期获得更高的并行度).
    pub fn open_with_workers<P: AsRef<Path>>(
        workers: NonZeroUsize,
        p: P,
    ) -> Result<Self, DatasetError> {
        let path = p.as_ref().to_owned();
        let workers = workers.get();
        if workers > 64 {
            return Err(DatasetError::TooManyWorkers(64));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new()
                .read(true)
                .open(&path)
                .map_err(|source| DatasetError::Io {
                    path: path.clone(),
                    source,
                })?;
            v.push(Mutex::new(NpzReader::new(file)?));
        }

        let names = lock(&v[0])
            .names()?
            .into_iter()
            .map(|n| (entry_stem(&n).to_string(), n))
            .collect();
        let mut ans = Self {
            path,
            entries: v,
            turn: AtomicUsize::new(0),
            names,
            subject_ids: Vec::new(),
            has_truth: false,
        };
        ans.load_meta()?;
        log::debug!(
            "opened packed dataset `{}` ({} subjects, {} workers)",
            ans.path.display(),
            ans.len(),
            ans.worker_len()
        );
        Ok(ans)
    }

    fn corrupt(&self, reason: impl Into<String>) -> DatasetError {
        DatasetError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn load_meta(&mut self) -> Result<(), DatasetError> {
        let meta = self.read::<u32, Ix1>(META)?.to_vec();
        let [count, has_truth] = meta[..] else {
            return Err(self.corrupt("meta must hold exactly two values"));
        };
        let ids = self.read::<u8, Ix1>(SUBJECT_IDS)?.to_vec();
        let ids = String::from_utf8(ids)
            .map_err(|_| self.corrupt("subject ids are not valid UTF-8"))?;
        let ids: Vec<String> = if ids.is_empty() {
            Vec::new()
        } else {
            ids.split('\n').map(str::to_string).collect()
        };
        if ids.len() != count as usize {
            return Err(self.corrupt(format!(
                "meta says {count} subjects but {} ids are stored",
                ids.len()
            )));
        }
        self.subject_ids = ids;
        self.has_truth = has_truth != 0;
        Ok(())
    }

    fn next_slot(&self) -> usize {
        self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len()
    }

    fn read<A, D>(&self, stem: &str) -> Result<Array<A, D>, DatasetError>
    where
        A: ReadableElement,
        D: Dimension,
    {
        let name = self
            .names
            .get(stem)
            .ok_or_else(|| self.corrupt(format!("missing entry `{stem}`")))?;
        let slot = self.next_slot();
        let mut file = lock(&self.entries[slot]);
        Ok(file.by_name::<OwnedRepr<A>, D>(name)?)
    }

    fn check_index(&self, index: usize) -> Result<(), DatasetError> {
        if index >= self.len() {
            return Err(DatasetError::OutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(())
    }

    /// 归档路径.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 受试者个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    /// 是否包含真值.
    #[inline]
    pub fn has_truth(&self) -> bool {
        self.has_truth
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    /// 按序号排列的受试者 id.
    #[inline]
    pub fn subject_ids(&self) -> &[String] {
        &self.subject_ids
    }

    /// 第 `index` 个受试者的 id.
    #[inline]
    pub fn subject_id(&self, index: usize) -> Option<&str> {
        self.subject_ids.get(index).map(String::as_str)
    }

    /// 第 `index` 个受试者的标准化图像, 形状为 `通道 × X × Y × Z`.
    pub fn data(&self, index: usize) -> Result<Array4<f32>, DatasetError> {
        self.check_index(index)?;
        self.read::<f32, Ix4>(&format!("data_{index}"))
    }

    /// 第 `index` 个受试者的真值.
    pub fn truth(&self, index: usize) -> Result<Array3<u8>, DatasetError> {
        self.check_index(index)?;
        if !self.has_truth {
            return Err(DatasetError::NoTruth);
        }
        self.read::<u8, Ix3>(&format!("truth_{index}"))
    }

    /// 第 `index` 个受试者 (重采样后) 的仿射变换.
    pub fn affine(&self, index: usize) -> Result<Affine, DatasetError> {
        self.check_index(index)?;
        let a = self.read::<f32, Ix2>(&format!("affine_{index}"))?;
        Affine::from_array(a.view())
            .ok_or_else(|| self.corrupt(format!("affine_{index} is not 4x4")))
    }

    /// 显式释放底层文件句柄.
    pub fn close(self) {}
}

impl Drop for PackedDataset {
    fn drop(&mut self) {
        log::debug!("closing packed dataset `{}`", self.path.display());
    }
}

impl std::fmt::Debug for PackedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedDataset")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("has_truth", &self.has_truth)
            .field("workers", &self.worker_len())
            .finish()
    }
}
