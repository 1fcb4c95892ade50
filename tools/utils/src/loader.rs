//! 数据集根目录的定位. 优先使用环境变量, 其次是调用方给出的路径,
//! 最后退回到 `$HOME/dataset/MRI_brain_seg` 下的同名目录.

use brats_berry::dataset::home_dataset_dir_with;
use std::env;
use std::path::{Path, PathBuf};

/// 训练图像根目录的环境变量.
pub const IMG_DIR_VAR: &str = "BRATS_IMG_DIR";

/// 训练标签根目录的环境变量.
pub const LABEL_DIR_VAR: &str = "BRATS_LABEL_DIR";

/// 预测输入根目录的环境变量.
pub const VALIDATE_DIR_VAR: &str = "BRATS_VALIDATE_DIR";

/// 读取非空的环境变量作为路径.
pub fn dir_from_env(var: &str) -> Option<PathBuf> {
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// 获取 `$HOME/dataset/MRI_brain_seg/{sub}`.
pub fn home_brats_dir(sub: &str) -> Option<PathBuf> {
    home_dataset_dir_with(["MRI_brain_seg", sub])
}

/// 按以下顺序确定目录:
///
/// 1. 显式给出的 `explicit`;
/// 2. 若环境变量 `var` 非空, 则返回其值;
/// 3. 若 `fallback` 是目录, 则返回 `fallback`;
/// 4. 若 `$HOME/dataset/MRI_brain_seg/{sub}` 是目录, 则返回它;
/// 5. 否则原样返回 `fallback`, 由调用方报告错误.
pub fn resolve_dir(explicit: Option<PathBuf>, var: &str, fallback: &Path, sub: &str) -> PathBuf {
    if let Some(d) = explicit.or_else(|| dir_from_env(var)) {
        return d;
    }
    if fallback.is_dir() {
        return fallback.to_owned();
    }
    match home_brats_dir(sub) {
        Some(d) if d.is_dir() => {
            log::info!("using dataset directory `{}`", d.display());
            d
        }
        _ => fallback.to_owned(),
    }
}

/// 训练图像根目录.
#[inline]
pub fn img_dir(explicit: Option<PathBuf>, fallback: &Path) -> PathBuf {
    resolve_dir(explicit, IMG_DIR_VAR, fallback, "data")
}

/// 训练标签根目录.
#[inline]
pub fn label_dir(explicit: Option<PathBuf>, fallback: &Path) -> PathBuf {
    resolve_dir(explicit, LABEL_DIR_VAR, fallback, "label")
}

/// 预测输入根目录.
#[inline]
pub fn validate_dir(explicit: Option<PathBuf>, fallback: &Path) -> PathBuf {
    resolve_dir(explicit, VALIDATE_DIR_VAR, fallback, "test")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_wins() {
        let d = resolve_dir(
            Some(PathBuf::from("/x")),
            "BRATS_TEST_UNUSED_VAR",
            Path::new("/y"),
            "data",
        );
        assert_eq!(d, PathBuf::from("/x"));
    }

    #[test]
    fn test_existing_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let d = resolve_dir(None, "BRATS_TEST_UNSET_VAR", dir.path(), "data");
        assert_eq!(d, dir.path());
    }
}
