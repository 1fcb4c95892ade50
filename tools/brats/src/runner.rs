//! 程序运行函数.

use crate::cli::{PredictArgs, TrainArgs};
use anyhow::Context;
use brats_berry::config::{merge_overrides, Config, MergePolicy};
use brats_berry::consts::paths;
use brats_berry::pipeline::{self, TrainingSummary};
use brats_berry::predict::PredictionReport;
use std::env;
use std::path::{Path, PathBuf};
use utils::loader;

/// 默认配置, 或以配置文件覆盖后的默认配置.
fn base_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::from_json_file(p)
            .with_context(|| format!("loading configuration `{}`", p.display())),
        None => Ok(Config::default()),
    }
}

fn current_dir() -> anyhow::Result<PathBuf> {
    env::current_dir().context("resolving the working directory")
}

/// 运行训练流水线.
pub fn train(args: &TrainArgs) -> anyhow::Result<TrainingSummary> {
    let mut config = base_config(args.config.as_deref())?;
    config.overwrite |= args.overwrite;
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.img_path = loader::img_dir(args.img_path.clone(), &config.img_path);
    config.label_path = loader::label_dir(args.label_path.clone(), &config.label_path);
    let config = config.absolutized(&current_dir()?);
    if let Some(p) = &args.save_config {
        config.to_json_file(p)?;
    }

    log::info!(
        "training on `{}` with labels from `{}`",
        config.img_path.display(),
        config.label_path.display()
    );
    Ok(pipeline::run_training(&config)?)
}

/// 运行预测流水线.
pub fn predict(args: &PredictArgs) -> anyhow::Result<PredictionReport> {
    let policy = if args.explicit_overrides {
        MergePolicy::Explicit
    } else {
        MergePolicy::SkipFalsy
    };
    let cwd = current_dir()?;
    let config = merge_overrides(base_config(args.config.as_deref())?, args.overrides(), policy)?
        .absolutized(&cwd);
    let predict_args = pipeline::PredictArgs {
        validate_path: loader::validate_dir(
            args.validate_path.clone(),
            Path::new(paths::VALIDATE_PATH),
        ),
        prediction_dir: cwd.join(&args.prediction_dir),
        output_basename: args.output_basename.clone(),
        output_label_map: !args.no_label_map,
    };

    log::info!(
        "predicting `{}` into `{}`",
        predict_args.validate_path.display(),
        predict_args.prediction_dir.display()
    );
    Ok(pipeline::run_prediction(&config, &predict_args)?)
}
