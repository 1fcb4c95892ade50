//! 受试者发现.
//!
//! 递归遍历目录树, 以文件名第一个 `.` 之前的部分作为受试者 id,
//! 并为每个受试者构造有序的文件组. 遍历按文件名排序, 结果是确定的.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 受试者发现错误.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// 根路径不是目录.
    #[error("`{0}` is not a directory")]
    NotADirectory(PathBuf),

    /// 遍历目录出错.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    /// 同一次遍历中出现重复的受试者 id.
    #[error("subject `{subject}` appears twice: `{first}` and `{second}`")]
    DuplicateSubject {
        /// 重复的 id.
        subject: String,

        /// 先出现的文件.
        first: PathBuf,

        /// 后出现的文件.
        second: PathBuf,
    },

    /// 图像缺少对应的标签文件.
    #[error("subject `{subject}` has no label file at `{expected}`")]
    MissingPair {
        /// 受试者 id.
        subject: String,

        /// 期望的标签路径.
        expected: PathBuf,
    },

    /// 文件名不是合法 UTF-8.
    #[error("file name of `{0}` is not valid UTF-8")]
    NonUtf8Name(PathBuf),
}

/// 一个受试者的有序文件组. 第 0 个永远是主图像.
///
/// 训练时为 `(图像, 标签)`, 预测时只有 `(图像,)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup(Vec<PathBuf>);

impl FileGroup {
    /// 由路径列表构建. `paths` 不能为空, 否则程序 panic.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        assert!(!paths.is_empty(), "文件组不能为空");
        Self(paths)
    }

    /// 主图像.
    #[inline]
    pub fn primary(&self) -> &Path {
        &self.0[0]
    }

    /// 全部路径.
    #[inline]
    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }

    /// 文件个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 恒为 `false`, 仅为满足惯例.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 拆分为 (图像通道, 真值). `has_truth` 为真时最后一个文件视为真值.
    pub fn split_truth(&self, has_truth: bool) -> (&[PathBuf], Option<&Path>) {
        match (has_truth, self.0.split_last()) {
            (true, Some((truth, images))) if !images.is_empty() => (images, Some(truth)),
            _ => (&self.0, None),
        }
    }
}

/// 受试者记录. 身份由 `subject_id` 决定.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    /// 受试者 id.
    pub subject_id: String,

    /// 文件组.
    pub file_group: FileGroup,
}

/// 一次发现得到的受试者序列, 按遍历顺序排列, 其中 id 两两不同.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectList {
    records: Vec<SubjectRecord>,
}

impl SubjectList {
    /// 受试者个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 受试者 id 序列.
    pub fn subject_ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.subject_id.as_str()).collect()
    }

    /// 与 id 序列平行的文件组序列.
    pub fn file_groups(&self) -> Vec<&FileGroup> {
        self.records.iter().map(|r| &r.file_group).collect()
    }

    /// 按遍历顺序迭代记录.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, SubjectRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a SubjectList {
    type Item = &'a SubjectRecord;
    type IntoIter = std::slice::Iter<'a, SubjectRecord>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// 由文件名推导受试者 id: 取第一个 `.` 之前的部分.
///
/// `"patient01.nii.gz"` -> `"patient01"`. 没有 `.` 时返回整个文件名.
#[inline]
pub fn subject_id_of(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}

/// 按文件名排序, 递归收集 `root` 下所有普通文件.
fn walk_files(root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.to_owned()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// 遍历 `root`, 对每个文件调用 `make_group` 构建文件组.
fn discover<F>(root: &Path, exclude: &[&str], mut make_group: F) -> Result<SubjectList, DiscoveryError>
where
    F: FnMut(&str, &Path) -> Result<FileGroup, DiscoveryError>,
{
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut records = Vec::new();

    for path in walk_files(root)? {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DiscoveryError::NonUtf8Name(path.clone()))?;
        let subject_id = subject_id_of(name);
        if subject_id.is_empty() {
            log::debug!("skipping hidden file `{}`", path.display());
            continue;
        }
        if exclude.contains(&subject_id) {
            log::debug!("skipping excluded subject `{subject_id}`");
            continue;
        }
        if let Some(first) = seen.get(subject_id) {
            return Err(DiscoveryError::DuplicateSubject {
                subject: subject_id.to_string(),
                first: first.clone(),
                second: path,
            });
        }

        let file_group = make_group(subject_id, &path)?;
        seen.insert(subject_id.to_string(), path.clone());
        records.push(SubjectRecord {
            subject_id: subject_id.to_string(),
            file_group,
        });
    }
    log::info!("discovered {} subjects under `{}`", records.len(), root.display());
    Ok(SubjectList { records })
}

/// 发现训练受试者. 每个文件组为 `(图像, 标签)`.
///
/// 标签路径为 `label_root` 拼接图像相对于 `img_root` 的路径;
/// 对顶层文件而言即同名文件. 标签不存在时立即返回 [`DiscoveryError::MissingPair`].
pub fn fetch_training_files<P: AsRef<Path>, Q: AsRef<Path>>(
    img_root: P,
    label_root: Q,
    exclude: &[&str],
) -> Result<SubjectList, DiscoveryError> {
    let img_root = img_root.as_ref();
    let label_root = label_root.as_ref();
    if !label_root.is_dir() {
        return Err(DiscoveryError::NotADirectory(label_root.to_owned()));
    }
    discover(img_root, exclude, |subject_id, image| {
        // `image` 由遍历 `img_root` 得到, 必然以其为前缀.
        let relative = image.strip_prefix(img_root).unwrap_or(image);
        let label = label_root.join(relative);
        if !label.is_file() {
            return Err(DiscoveryError::MissingPair {
                subject: subject_id.to_string(),
                expected: label,
            });
        }
        Ok(FileGroup::new(vec![img_root.join(relative), label]))
    })
}

/// 发现待预测受试者. 每个文件组只有 `(图像,)`, 即文件自身的路径.
pub fn fetch_inference_files<P: AsRef<Path>>(
    root: P,
    exclude: &[&str],
) -> Result<SubjectList, DiscoveryError> {
    discover(root.as_ref(), exclude, |_, image| {
        Ok(FileGroup::new(vec![image.to_owned()]))
    })
}
