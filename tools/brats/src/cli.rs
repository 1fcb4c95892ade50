//! 命令行参数.

use brats_berry::consts::paths;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// BraTS 风格脑部 MRI 分割: 数据打包, 训练与预测.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "brats", version)]
pub struct Cli {
    /// 子命令.
    #[command(subcommand)]
    pub command: Command,

    /// 输出更详细的日志 (`-v` 为 debug, `-vv` 为 trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// 只输出警告与错误.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// 子命令.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// 打包训练数据并训练模型.
    Train(TrainArgs),

    /// 对新受试者进行预测, 并将结果重采样回原始扫描网格.
    Predict(PredictArgs),
}

/// `train` 子命令参数.
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// JSON 配置文件. 未给出的键取默认值.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// 重新打包数据, 重新划分并重新构建模型.
    #[arg(long)]
    pub overwrite: bool,

    /// 随机种子.
    #[arg(long)]
    pub seed: Option<u64>,

    /// 训练图像根目录. 缺省时依次尝试 `$BRATS_IMG_DIR` 与配置.
    #[arg(long, value_name = "DIR")]
    pub img_path: Option<PathBuf>,

    /// 训练标签根目录. 缺省时依次尝试 `$BRATS_LABEL_DIR` 与配置.
    #[arg(long, value_name = "DIR")]
    pub label_path: Option<PathBuf>,

    /// 将最终生效的配置写入该文件.
    #[arg(long, value_name = "FILE")]
    pub save_config: Option<PathBuf>,
}

/// `predict` 子命令参数. 长参数名沿用下划线风格.
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct PredictArgs {
    /// 已训练模型文件.
    #[arg(long = "model_file", value_name = "FILE")]
    pub model_file: Option<PathBuf>,

    /// 预测数据打包文件.
    #[arg(long = "data_file", value_name = "FILE", default_value = paths::TEST_DATA_FILE)]
    pub data_file: PathBuf,

    /// 标签取值.
    #[arg(long, num_args = 0..)]
    pub labels: Option<Vec<u8>>,

    /// 训练模态.
    #[arg(long, num_args = 0..)]
    pub modalities: Option<Vec<String>>,

    /// 待预测受试者序号列表文件.
    #[arg(
        long = "validation_file",
        value_name = "FILE",
        default_value = paths::VALIDATION_FILE
    )]
    pub validation_file: PathBuf,

    /// 输出逐标签概率, 而不是标签图.
    #[arg(long = "no_label_map")]
    pub no_label_map: bool,

    /// 预测输出目录.
    #[arg(long = "prediction_dir", value_name = "DIR", default_value = paths::PREDICTION_DIR)]
    pub prediction_dir: PathBuf,

    /// 输出文件名模板, 必须包含 `{subject}`.
    #[arg(long = "output_basename", default_value = paths::OUTPUT_BASENAME)]
    pub output_basename: String,

    /// 待预测图像根目录. 缺省时依次尝试 `$BRATS_VALIDATE_DIR` 与默认路径.
    #[arg(long = "validate_path", value_name = "DIR")]
    pub validate_path: Option<PathBuf>,

    /// JSON 配置文件. 未给出的键取默认值.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// 显式给出的假值 (如空列表) 也覆盖配置.
    #[arg(long = "explicit-overrides")]
    pub explicit_overrides: bool,
}

fn path_value(p: &Path) -> Value {
    Value::from(p.to_string_lossy().into_owned())
}

impl PredictArgs {
    /// 需要合并进配置的覆盖项. 未提供的项为 `null`.
    pub fn overrides(&self) -> Vec<(&'static str, Value)> {
        vec![
            (
                "model_file",
                self.model_file.as_deref().map_or(Value::Null, path_value),
            ),
            ("data_file", path_value(&self.data_file)),
            (
                "labels",
                self.labels.as_ref().map_or(Value::Null, |l| Value::from(l.clone())),
            ),
            (
                "modalities",
                self.modalities
                    .as_ref()
                    .map_or(Value::Null, |m| Value::from(m.clone())),
            ),
            ("validation_file", path_value(&self.validation_file)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<const N: usize>(args: [&str; N]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_predict_defaults() {
        let cli = parse(["brats", "predict"]);
        let Command::Predict(args) = cli.command else {
            panic!("expected predict");
        };
        assert_eq!(args.data_file, PathBuf::from("test_data.npz"));
        assert_eq!(args.validation_file, PathBuf::from("validation_ids.bin"));
        assert_eq!(args.prediction_dir, PathBuf::from("../test_data"));
        assert_eq!(args.output_basename, "{subject}.nii.gz");
        assert!(!args.no_label_map);
        assert_eq!(args.labels, None);

        let overrides = args.overrides();
        assert_eq!(overrides[0], ("model_file", Value::Null));
        assert_eq!(overrides[1], ("data_file", Value::from("test_data.npz")));
    }

    #[test]
    fn test_predict_lists_and_flags() {
        let cli = parse([
            "brats",
            "-vv",
            "predict",
            "--labels",
            "1",
            "2",
            "4",
            "--modalities",
            "--no_label_map",
            "--model_file",
            "m.bin",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Predict(args) = cli.command else {
            panic!("expected predict");
        };
        assert_eq!(args.labels, Some(vec![1, 2, 4]));
        assert_eq!(args.modalities, Some(vec![]));
        assert!(args.no_label_map);
        assert_eq!(args.model_file, Some(PathBuf::from("m.bin")));
    }

    #[test]
    fn test_train_args() {
        let cli = parse(["brats", "train", "--overwrite", "--seed", "7", "--img-path", "x"]);
        let Command::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert!(args.overwrite);
        assert_eq!(args.seed, Some(7));
        assert_eq!(args.img_path, Some(PathBuf::from("x")));
        assert_eq!(args.label_path, None);
    }
}
