//! 训练与预测两条流水线.
//!
//! 训练: 发现受试者 → 打包 → 划分 → 模型与生成器 → 训练.
//! 预测: 发现受试者 → 打包 → 预测 → 逐受试者重采样回原始网格.

use crate::config::Config;
use crate::data::resample::{resample_to_img, Interpolation};
use crate::data::{read_volume_with_affine, write_volume, MriScan, NiftiHeaderAttr, Voxel};
use crate::dataset::{
    ensure_data_file, fetch_inference_files, fetch_training_files, write_id_list, PackedDataset,
};
use crate::error::{Error, Result};
use crate::generator::{get_training_and_validation_generators, GeneratorOptions};
use crate::model::provide_model;
use crate::predict::{run_validation_cases, PredictOptions, PredictionReport};
use crate::train::{train_model, TrainOptions, TrainingHistory};
use crate::VolumeError;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// 一次训练的汇总.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// 发现的受试者数.
    pub n_subjects: usize,

    /// 本次是否重新打包了数据集.
    pub dataset_built: bool,

    /// 每轮训练步数.
    pub n_training_steps: usize,

    /// 每轮验证步数.
    pub n_validation_steps: usize,

    /// 训练记录.
    pub history: TrainingHistory,
}

/// 数据集读取通道数: 批次中每个样本一个, 最多 64.
fn reader_workers(config: &Config) -> NonZeroUsize {
    let n = config.batch_size.max(config.validation_batch_size).min(64);
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// 训练流水线.
///
/// 打包数据集的句柄在所有退出路径上 (包括训练出错) 都会被释放.
pub fn run_training(config: &Config) -> Result<TrainingSummary> {
    config.validate()?;
    let subjects = fetch_training_files(&config.img_path, &config.label_path, &[])?;
    let dataset_built = ensure_data_file(
        &subjects.file_groups(),
        &config.data_file,
        config.image_shape,
        &subjects.subject_ids(),
        true,
        config.overwrite,
    )?;

    let dataset = PackedDataset::open_with_workers(reader_workers(config), &config.data_file)?;
    let result = train_on_dataset(config, &dataset);
    dataset.close();
    let (n_training_steps, n_validation_steps, history) = result?;
    Ok(TrainingSummary {
        n_subjects: subjects.len(),
        dataset_built,
        n_training_steps,
        n_validation_steps,
        history,
    })
}

fn train_on_dataset(
    config: &Config,
    dataset: &PackedDataset,
) -> Result<(usize, usize, TrainingHistory)> {
    let mut model = provide_model(config, config.overwrite)?;
    let generators = get_training_and_validation_generators(
        dataset,
        &GeneratorOptions::from_config(config),
        config.overwrite,
        &config.validation_file,
        &config.training_file,
        config.seed,
    )?;
    let (steps, validation_steps) = (generators.n_training_steps, generators.n_validation_steps);
    let history = train_model(
        &mut model,
        &config.model_file,
        generators.training,
        generators.validation,
        steps,
        validation_steps,
        &TrainOptions::from_config(config),
    )?;
    Ok((steps, validation_steps, history))
}

/// 预测流水线中不属于 [`Config`] 的参数.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictArgs {
    /// 待预测图像根目录.
    pub validate_path: PathBuf,

    /// 预测输出目录.
    pub prediction_dir: PathBuf,

    /// 输出文件名模板.
    pub output_basename: String,

    /// 为真时输出标签图, 否则输出概率.
    pub output_label_map: bool,
}

/// 将 `path` 处的预测结果以最近邻插值重采样到 `reference` 的体素网格上, 原地覆盖.
fn resample_file<T: Voxel>(
    reference: &MriScan,
    path: &Path,
) -> std::result::Result<(), VolumeError> {
    let (data, affine) = read_volume_with_affine::<T, _>(path)?;
    let resampled = resample_to_img(data.view(), &affine, reference)?;
    debug_assert_eq!(resampled.interpolation, Interpolation::Nearest);
    write_volume(path, &resampled.data, &reference.affine())
}

/// 重采样单个受试者的预测结果.
pub fn resample_prediction(
    reference: &Path,
    prediction: &Path,
    label_map: bool,
) -> std::result::Result<(), VolumeError> {
    log::info!("resampling `{}`", prediction.display());
    let reference = MriScan::open(reference)?;
    if label_map {
        resample_file::<u8>(&reference, prediction)
    } else {
        resample_file::<f32>(&reference, prediction)
    }
}

/// 预测流水线.
///
/// 数据集和验证列表只在不存在时构建. 输入目录变化但旧数据集仍在时,
/// 会继续使用旧数据集 (并给出警告). 单个受试者的预测或重采样失败只记录在报告中.
pub fn run_prediction(config: &Config, args: &PredictArgs) -> Result<PredictionReport> {
    config.validate()?;
    let subjects = fetch_inference_files(&args.validate_path, &[])?;
    let built = ensure_data_file(
        &subjects.file_groups(),
        &config.data_file,
        config.image_shape,
        &subjects.subject_ids(),
        false,
        config.overwrite,
    )?;

    let dataset = PackedDataset::open(&config.data_file)?;
    let n = dataset.len();
    if !built && dataset.subject_ids().iter().map(String::as_str).ne(subjects.subject_ids()) {
        log::warn!(
            "packed dataset `{}` does not match the subjects under `{}`, delete it to rebuild",
            config.data_file.display(),
            args.validate_path.display()
        );
    }
    dataset.close();
    if built || !config.validation_file.exists() {
        let ordinals: Vec<usize> = (0..n).collect();
        write_id_list(&config.validation_file, &ordinals)?;
    }

    let options = PredictOptions {
        validation_keys_file: config.validation_file.clone(),
        model_file: config.model_file.clone(),
        training_modalities: config.training_modalities.clone(),
        labels: config.labels.clone(),
        data_file: config.data_file.clone(),
        output_label_map: args.output_label_map,
        output_dir: args.prediction_dir.clone(),
        test: false,
        output_basename: args.output_basename.clone(),
        permute: config.permute,
        overlap: config.validation_patch_overlap,
    };
    let predicted = run_validation_cases(&options)?;

    let references: HashMap<&str, &Path> = subjects
        .iter()
        .map(|r| (r.subject_id.as_str(), r.file_group.primary()))
        .collect();
    let mut report = PredictionReport {
        succeeded: Vec::with_capacity(predicted.succeeded.len()),
        failed: predicted.failed,
    };
    for subject in predicted.succeeded {
        let Some(reference) = references.get(subject.subject.as_str()) else {
            report.fail(
                subject.subject,
                "no input scan was discovered for this subject",
            );
            continue;
        };
        match resample_prediction(reference, &subject.path, args.output_label_map) {
            Ok(()) => report.succeeded.push(subject),
            Err(source) => {
                let error = Error::Resample {
                    subject: subject.subject.clone(),
                    source,
                };
                report.fail(subject.subject, error);
            }
        }
    }
    Ok(report)
}
