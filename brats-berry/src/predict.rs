//! 预测.
//!
//! 对验证列表中的每个受试者独立地预测并写出结果. 单个受试者失败只会被记录,
//! 不会中断其余受试者.

use crate::consts::LABEL_THRESHOLD;
use crate::data::{write_volume, VolumeError};
use crate::dataset::{read_id_list, DatasetError, PackedDataset, SplitError};
use crate::generator::{
    compute_patch_indices, flip_spatial_axes, get_patch_from_4d_data, reconstruct_from_patches,
};
use crate::model::{load_old_model, ModelError, SegmentationModel};
use crate::Shape3d;
use itertools::iproduct;
use ndarray::{Array3, Array4, ArrayView4, Axis, Zip};
use std::path::PathBuf;

/// 文件名模板中唯一允许的占位符.
const SUBJECT_PLACEHOLDER: &str = "subject";

/// 预测错误.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    /// 输出文件名模板不合法.
    #[error("invalid output basename template `{template}`: {reason}")]
    Template {
        /// 模板.
        template: String,

        /// 原因.
        reason: &'static str,
    },

    /// 读取打包数据失败.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// 模型加载或预测失败.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// 读取验证列表失败.
    #[error(transparent)]
    Split(#[from] SplitError),

    /// 写出预测结果失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 创建输出目录失败.
    #[error("`{path}`: {source}")]
    Io {
        /// 出错的目录.
        path: PathBuf,

        /// 底层错误.
        source: std::io::Error,
    },

    /// 数据通道数与训练模态数不一致.
    #[error("dataset has {found} channels but {expected} training modalities are configured")]
    Modalities {
        /// 训练模态数.
        expected: usize,

        /// 数据通道数.
        found: usize,
    },
}

/// 预测参数.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    /// 待预测受试者序号列表文件.
    pub validation_keys_file: PathBuf,

    /// 已训练模型文件.
    pub model_file: PathBuf,

    /// 训练时使用的模态, 与数据通道一一对应.
    pub training_modalities: Vec<String>,

    /// 标签取值.
    pub labels: Vec<u8>,

    /// 打包数据文件.
    pub data_file: PathBuf,

    /// 为真时输出标签图, 否则输出逐标签概率.
    pub output_label_map: bool,

    /// 输出目录.
    pub output_dir: PathBuf,

    /// 为真时同时写出真值 (若数据集带有真值).
    pub test: bool,

    /// 输出文件名模板, 见 [`format_basename`].
    pub output_basename: String,

    /// 为真时对 8 种轴翻转组合的预测取平均.
    pub permute: bool,

    /// 分块预测时相邻块的重叠体素数.
    pub overlap: usize,
}

/// 成功预测的受试者.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictedSubject {
    /// 打包数据中的序号.
    pub ordinal: usize,

    /// 受试者 id.
    pub subject: String,

    /// 预测结果文件.
    pub path: PathBuf,
}

/// 预测失败的受试者.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSubject {
    /// 受试者 id.
    pub subject: String,

    /// 失败原因.
    pub reason: String,
}

/// 一次预测的汇总.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionReport {
    /// 成功的受试者.
    pub succeeded: Vec<PredictedSubject>,

    /// 失败的受试者.
    pub failed: Vec<FailedSubject>,
}

impl PredictionReport {
    /// 是否全部成功?
    #[inline]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 记录一个失败的受试者.
    pub fn fail(&mut self, subject: impl Into<String>, reason: impl ToString) {
        let subject = subject.into();
        let reason = reason.to_string();
        log::error!("subject `{subject}` failed: {reason}");
        self.failed.push(FailedSubject { subject, reason });
    }
}

/// 将模板中的 `{subject}` 替换为受试者 id. `{{` 与 `}}` 表示字面量花括号.
///
/// 模板必须恰好使用 `{subject}` 占位符, 且不含其他占位符.
pub fn format_basename(template: &str, subject: &str) -> Result<String, PredictError> {
    let error = |reason| PredictError::Template {
        template: template.to_owned(),
        reason,
    };
    let mut out = String::with_capacity(template.len() + subject.len());
    let mut found = false;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(error("unmatched `{`"));
                }
                if name != SUBJECT_PLACEHOLDER {
                    return Err(error("only the `{subject}` placeholder is supported"));
                }
                found = true;
                out.push_str(subject);
            }
            '}' => return Err(error("unmatched `}`")),
            c => out.push(c),
        }
    }
    if !found {
        return Err(error("missing the `{subject}` placeholder"));
    }
    Ok(out)
}

/// 预测单个体数据. 模型空间输入形状与数据不同时分块预测并拼回.
fn predict_patch_wise<M: SegmentationModel>(
    model: &M,
    data: ArrayView4<f32>,
    overlap: usize,
) -> Result<Array4<f32>, PredictError> {
    let (_, x, y, z) = data.dim();
    let [_, px, py, pz] = model.input_shape();
    let data_shape: Shape3d = [x, y, z];
    let patch_shape: Shape3d = [px, py, pz];
    if patch_shape == data_shape {
        return Ok(model.predict(data)?);
    }

    let indices = compute_patch_indices(data_shape, patch_shape, overlap, None);
    let mut patches = Vec::with_capacity(indices.len());
    for &index in &indices {
        let patch = get_patch_from_4d_data(data, patch_shape, index);
        patches.push(model.predict(patch.view())?);
    }
    Ok(reconstruct_from_patches(
        &patches,
        &indices,
        [model.n_labels(), x, y, z],
    ))
}

/// 对 8 种轴翻转组合分别预测, 翻转回原方向后取平均.
fn predict_with_flips<M: SegmentationModel>(
    model: &M,
    data: ArrayView4<f32>,
    overlap: usize,
) -> Result<Array4<f32>, PredictError> {
    let (_, x, y, z) = data.dim();
    let mut sum = Array4::<f32>::zeros((model.n_labels(), x, y, z));
    let mut n = 0.0f32;
    for (fx, fy, fz) in iproduct!([false, true], [false, true], [false, true]) {
        let axes = [fx, fy, fz];
        let mut flipped = data.to_owned();
        flip_spatial_axes(&mut flipped, axes);
        let mut p = predict_patch_wise(model, flipped.view(), overlap)?;
        flip_spatial_axes(&mut p, axes);
        sum += &p;
        n += 1.0;
    }
    sum /= n;
    Ok(sum)
}

/// 将逐标签概率转换为标签图: 每个体素取概率最大的标签, 最大概率不超过阈值时为背景.
pub fn prediction_to_label_map(prediction: &Array4<f32>, labels: &[u8]) -> Array3<u8> {
    let (_, x, y, z) = prediction.dim();
    let mut best = Array3::<f32>::from_elem((x, y, z), LABEL_THRESHOLD);
    let mut out = Array3::<u8>::zeros((x, y, z));
    for (channel, &label) in prediction.axis_iter(Axis(0)).zip(labels) {
        Zip::from(&mut out)
            .and(&mut best)
            .and(channel)
            .for_each(|o, b, &p| {
                if p > *b {
                    *b = p;
                    *o = label;
                }
            });
    }
    out
}

/// 预测单个受试者并写出结果, 返回结果文件路径.
fn run_validation_case<M: SegmentationModel>(
    model: &M,
    dataset: &PackedDataset,
    ordinal: usize,
    subject: &str,
    options: &PredictOptions,
) -> Result<PathBuf, PredictError> {
    let data = dataset.data(ordinal)?;
    let channels = data.len_of(Axis(0));
    if channels != options.training_modalities.len() {
        return Err(PredictError::Modalities {
            expected: options.training_modalities.len(),
            found: channels,
        });
    }
    let affine = dataset.affine(ordinal)?;

    let prediction = if options.permute {
        predict_with_flips(model, data.view(), options.overlap)?
    } else {
        predict_patch_wise(model, data.view(), options.overlap)?
    };

    let path = options
        .output_dir
        .join(format_basename(&options.output_basename, subject)?);
    if options.output_label_map {
        let label_map = prediction_to_label_map(&prediction, &options.labels);
        write_volume(&path, &label_map, &affine)?;
    } else if prediction.len_of(Axis(0)) == 1 {
        write_volume(&path, &prediction.index_axis(Axis(0), 0).to_owned(), &affine)?;
    } else {
        let channels_last = prediction
            .permuted_axes([1, 2, 3, 0])
            .as_standard_layout()
            .into_owned();
        write_volume(&path, &channels_last, &affine)?;
    }

    if options.test && dataset.has_truth() {
        let truth = dataset.truth(ordinal)?;
        let truth_path = options.output_dir.join(format!("truth_{subject}.nii.gz"));
        write_volume(truth_path, &truth, &affine)?;
    }
    log::debug!("wrote prediction for `{subject}` to `{}`", path.display());
    Ok(path)
}

/// 对验证列表中的全部受试者运行预测.
///
/// 模型, 数据集或验证列表无法打开时整体失败; 之后每个受试者的失败都只会被记录在报告中.
pub fn run_validation_cases(options: &PredictOptions) -> Result<PredictionReport, PredictError> {
    // 先校验模板, 避免每个受试者重复报告同一个错误.
    format_basename(&options.output_basename, SUBJECT_PLACEHOLDER)?;
    let ordinals = read_id_list(&options.validation_keys_file)?;
    let model = load_old_model(&options.model_file)?;
    if model.n_labels() != options.labels.len() {
        return Err(ModelError::Labels {
            expected: model.n_labels(),
            found: options.labels.len(),
        }
        .into());
    }
    let dataset = PackedDataset::open(&options.data_file)?;
    std::fs::create_dir_all(&options.output_dir).map_err(|source| PredictError::Io {
        path: options.output_dir.clone(),
        source,
    })?;

    log::info!(
        "predicting {} subjects into `{}`",
        ordinals.len(),
        options.output_dir.display()
    );
    let mut report = PredictionReport::default();
    for ordinal in ordinals {
        let subject = match dataset.subject_id(ordinal) {
            Some(s) => s.to_owned(),
            None => {
                report.fail(
                    format!("#{ordinal}"),
                    DatasetError::OutOfRange {
                        index: ordinal,
                        len: dataset.len(),
                    },
                );
                continue;
            }
        };
        match run_validation_case(&model, &dataset, ordinal, &subject, options) {
            Ok(path) => report.succeeded.push(PredictedSubject {
                ordinal,
                subject,
                path,
            }),
            Err(e) => report.fail(subject, e),
        }
    }
    log::info!(
        "prediction finished: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{write_data_to_file, write_id_list, FileGroup};
    use crate::generator::Batch;
    use crate::model::build_model;
    use crate::{read_volume_with_affine, Affine, MriLabel, MriScan};
    use std::path::Path;

    #[test]
    fn test_format_basename() {
        assert_eq!(
            format_basename("{subject}.nii.gz", "patient01").unwrap(),
            "patient01.nii.gz"
        );
        assert_eq!(
            format_basename("pred_{subject}_{{x}}.nii", "a").unwrap(),
            "pred_a_{x}.nii"
        );
        for bad in ["out.nii.gz", "{case}.nii", "{subject", "{subject}}", "x}{subject}"] {
            assert!(
                matches!(format_basename(bad, "a"), Err(PredictError::Template { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_label_map_threshold_and_argmax() {
        let mut p = Array4::<f32>::zeros((2, 3, 1, 1));
        // 体素 0: 两个标签都不超过阈值.
        p[(0, 0, 0, 0)] = 0.4;
        p[(1, 0, 0, 0)] = 0.5;
        // 体素 1: 标签 4 胜出.
        p[(0, 1, 0, 0)] = 0.6;
        p[(1, 1, 0, 0)] = 0.9;
        // 体素 2: 标签 2 胜出.
        p[(0, 2, 0, 0)] = 0.7;
        let m = prediction_to_label_map(&p, &[2, 4]);
        assert_eq!(m.iter().copied().collect::<Vec<_>>(), vec![0, 4, 2]);
    }

    /// 预测恒定输出 `value` 的模型, 用于检验翻转与分块逻辑.
    struct Constant {
        shape: [usize; 4],
        value: f32,
    }

    impl SegmentationModel for Constant {
        fn input_shape(&self) -> [usize; 4] {
            self.shape
        }

        fn n_labels(&self) -> usize {
            1
        }

        fn train_on_batch(&mut self, _: &Batch, _: f32) -> Result<f32, ModelError> {
            Ok(0.0)
        }

        fn evaluate(&self, _: &Batch) -> Result<f32, ModelError> {
            Ok(0.0)
        }

        fn predict(&self, x: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
            let (_, a, b, c) = x.dim();
            // 输出与输入第一通道相同, 可以检查空间位置是否对齐.
            let mut out = Array4::from_elem((1, a, b, c), self.value);
            out.index_axis_mut(Axis(0), 0)
                .zip_mut_with(&x.index_axis(Axis(0), 0), |o, v| *o += *v);
            Ok(out)
        }

        fn save(&self, _: &Path) -> Result<(), ModelError> {
            Ok(())
        }
    }

    #[test]
    fn test_patch_wise_and_flips_keep_alignment() {
        let data =
            Array4::from_shape_fn((1, 4, 4, 4), |(_, i, j, k)| (i * 16 + j * 4 + k) as f32);
        let whole = Constant {
            shape: [1, 4, 4, 4],
            value: 1.0,
        };
        let patched = Constant {
            shape: [1, 2, 2, 2],
            value: 1.0,
        };
        let expected = data.mapv(|v| v + 1.0);
        assert_eq!(predict_patch_wise(&whole, data.view(), 0).unwrap(), expected);
        assert_eq!(predict_patch_wise(&patched, data.view(), 1).unwrap(), expected);
        assert_eq!(predict_with_flips(&patched, data.view(), 0).unwrap(), expected);
    }

    fn packed(dir: &Path, with_truth: bool) -> PathBuf {
        let affine = Affine::from_zooms([2.0, 2.0, 2.0]);
        let mut groups = Vec::new();
        let mut ids = Vec::new();
        for s in ["p01", "p02"] {
            let img = dir.join(format!("{s}.nii.gz"));
            let data = Array3::from_shape_fn((4, 4, 4), |(i, j, k)| (i + j + k) as f32);
            MriScan::from_affine(data, &affine).save(&img).unwrap();
            let mut files = vec![img];
            if with_truth {
                let label = dir.join(format!("{s}_seg.nii.gz"));
                let mut t = Array3::<u8>::zeros((4, 4, 4));
                t[(3, 3, 3)] = 1;
                MriLabel::from_affine(t, &affine).save(&label).unwrap();
                files.push(label);
            }
            groups.push(FileGroup::new(files));
            ids.push(s);
        }
        let refs: Vec<_> = groups.iter().collect();
        let out = dir.join("test_data.npz");
        write_data_to_file(&refs, &out, [4, 4, 4], &ids, with_truth).unwrap();
        out
    }

    fn options(dir: &Path, data_file: PathBuf) -> PredictOptions {
        let model_file = dir.join("model.bin");
        build_model([1, 4, 4, 4], 1, 0.01, 4, Some(1))
            .unwrap()
            .save(&model_file)
            .unwrap();
        let validation_keys_file = dir.join("validation_ids.bin");
        write_id_list(&validation_keys_file, &[0, 1]).unwrap();
        PredictOptions {
            validation_keys_file,
            model_file,
            training_modalities: vec!["t1".to_owned()],
            labels: vec![1],
            data_file,
            output_label_map: true,
            output_dir: dir.join("predictions"),
            test: false,
            output_basename: "{subject}.nii.gz".to_owned(),
            permute: false,
            overlap: 0,
        }
    }

    #[test]
    fn test_run_validation_cases_writes_label_maps() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = packed(dir.path(), false);
        let opts = options(dir.path(), data_file);
        let report = run_validation_cases(&opts).unwrap();
        assert!(report.is_success());
        let subjects: Vec<_> = report.succeeded.iter().map(|s| s.subject.as_str()).collect();
        assert_eq!(subjects, vec!["p01", "p02"]);

        let path = opts.output_dir.join("p01.nii.gz");
        assert_eq!(report.succeeded[0].path, path);
        let (label_map, affine) = read_volume_with_affine::<u8, _>(&path).unwrap();
        assert_eq!(label_map.shape(), &[4, 4, 4]);
        assert!(label_map.iter().all(|v| *v == 0 || *v == 1));
        assert_eq!(affine, Affine::from_zooms([2.0, 2.0, 2.0]));
    }

    #[test]
    fn test_probabilities_and_truth_in_test_mode() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = packed(dir.path(), true);
        let mut opts = options(dir.path(), data_file);
        opts.output_label_map = false;
        opts.test = true;
        opts.permute = true;
        let report = run_validation_cases(&opts).unwrap();
        assert_eq!(report.succeeded.len(), 2);

        let (probs, _) =
            read_volume_with_affine::<f32, _>(opts.output_dir.join("p02.nii.gz")).unwrap();
        assert_eq!(probs.shape(), &[4, 4, 4]);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        let truth = MriLabel::open(opts.output_dir.join("truth_p02.nii.gz")).unwrap();
        assert_eq!(truth.count(1), 1);
    }

    #[test]
    fn test_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = packed(dir.path(), false);
        let opts = options(dir.path(), data_file);
        write_id_list(&opts.validation_keys_file, &[0, 7, 1]).unwrap();
        let report = run_validation_cases(&opts).unwrap();
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].subject, "#7");
        assert!(!report.is_success());
    }

    #[test]
    fn test_run_level_failures() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = packed(dir.path(), false);
        let mut opts = options(dir.path(), data_file);
        opts.output_basename = "fixed.nii.gz".to_owned();
        assert!(matches!(
            run_validation_cases(&opts),
            Err(PredictError::Template { .. })
        ));

        opts.output_basename = "{subject}.nii.gz".to_owned();
        opts.labels = vec![1, 2];
        assert!(matches!(
            run_validation_cases(&opts),
            Err(PredictError::Model(ModelError::Labels { .. }))
        ));
    }
}
