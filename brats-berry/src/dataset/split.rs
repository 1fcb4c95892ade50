//! 训练/验证划分记录.
//!
//! 划分以两个 `bincode` 文件持久化. 两个文件都存在时原样复用, 保证多次运行使用同一划分.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 划分记录读写错误.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// 底层 I/O 错误.
    #[error("`{path}`: {source}")]
    Io {
        /// 出错的文件.
        path: PathBuf,

        /// 底层错误.
        source: std::io::Error,
    },

    /// 序列化或反序列化失败.
    #[error("`{path}`: {source}")]
    Bincode {
        /// 出错的文件.
        path: PathBuf,

        /// 底层错误.
        source: bincode::Error,
    },

    /// 划分内容与数据集不一致: 序号越界, 重复, 或两个列表相交.
    #[error("inconsistent split: {0}")]
    Inconsistent(String),

    /// 划分比例不在 `[0, 1]` 内.
    #[error("split ratio {0} is outside [0, 1]")]
    Ratio(f64),
}

/// 一次训练/验证划分. 两个列表互不相交, 均为打包数据集中的受试者序号.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRecord {
    /// 训练集序号.
    pub training: Vec<usize>,

    /// 验证集序号.
    pub validation: Vec<usize>,
}

impl SplitRecord {
    /// 检查所有序号都小于 `n`, 且两个列表不相交, 各自无重复.
    pub fn check(&self, n: usize) -> Result<(), SplitError> {
        let mut seen = vec![false; n];
        for &i in self.training.iter().chain(&self.validation) {
            match seen.get_mut(i) {
                None => {
                    return Err(SplitError::Inconsistent(format!(
                        "ordinal {i} is out of range for {n} subjects"
                    )))
                }
                Some(true) => {
                    return Err(SplitError::Inconsistent(format!(
                        "ordinal {i} appears more than once"
                    )))
                }
                Some(s) => *s = true,
            }
        }
        Ok(())
    }
}

/// 写出单个序号列表.
pub fn write_id_list<P: AsRef<Path>>(path: P, ids: &[usize]) -> Result<(), SplitError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| SplitError::Io {
        path: path.to_owned(),
        source,
    })?;
    let ids: Vec<u64> = ids.iter().map(|&i| i as u64).collect();
    let mut w = BufWriter::new(file);
    bincode::serialize_into(&mut w, &ids).map_err(|source| SplitError::Bincode {
        path: path.to_owned(),
        source,
    })?;
    w.flush().map_err(|source| SplitError::Io {
        path: path.to_owned(),
        source,
    })
}

/// 读取单个序号列表.
pub fn read_id_list<P: AsRef<Path>>(path: P) -> Result<Vec<usize>, SplitError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| SplitError::Io {
        path: path.to_owned(),
        source,
    })?;
    let ids: Vec<u64> =
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| SplitError::Bincode {
            path: path.to_owned(),
            source,
        })?;
    Ok(ids.into_iter().map(|i| i as usize).collect())
}

/// 有种子时得到可复现的随机数生成器, 否则从系统熵初始化.
pub(crate) fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// 打乱 `0..n`, 前 `floor(n * data_split)` 个作为训练集, 其余作为验证集.
pub fn split_ordinals(
    n: usize,
    data_split: f64,
    seed: Option<u64>,
) -> Result<SplitRecord, SplitError> {
    if !(0.0..=1.0).contains(&data_split) {
        return Err(SplitError::Ratio(data_split));
    }
    let mut ids: Vec<usize> = (0..n).collect();
    ids.shuffle(&mut rng_from_seed(seed));
    let n_training = (n as f64 * data_split).floor() as usize;
    let validation = ids.split_off(n_training);
    Ok(SplitRecord {
        training: ids,
        validation,
    })
}

/// 获取 (必要时生成) 训练/验证划分.
///
/// `overwrite` 为真, 或两个文件之一不存在时, 重新生成划分并写出两个文件;
/// 否则读取已有文件, 文件内容不会被改动.
pub fn get_validation_split<P: AsRef<Path>, Q: AsRef<Path>>(
    n: usize,
    data_split: f64,
    training_file: P,
    validation_file: Q,
    overwrite: bool,
    seed: Option<u64>,
) -> Result<SplitRecord, SplitError> {
    let training_file = training_file.as_ref();
    let validation_file = validation_file.as_ref();
    if overwrite || !training_file.exists() || !validation_file.exists() {
        log::info!("creating validation split for {n} subjects");
        let record = split_ordinals(n, data_split, seed)?;
        write_id_list(training_file, &record.training)?;
        write_id_list(validation_file, &record.validation)?;
        return Ok(record);
    }

    log::info!(
        "loading previous validation split from `{}`",
        validation_file.display()
    );
    let record = SplitRecord {
        training: read_id_list(training_file)?,
        validation: read_id_list(validation_file)?,
    };
    record.check(n)?;
    Ok(record)
}
