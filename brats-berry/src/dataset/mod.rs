//! 数据集操作.

use std::path::{Path, PathBuf};

mod discovery;
mod packed;
pub(crate) mod split;

pub use discovery::{
    fetch_inference_files, fetch_training_files, subject_id_of, DiscoveryError, FileGroup,
    SubjectList, SubjectRecord,
};
pub use packed::{ensure_data_file, write_data_to_file, DatasetError, PackedDataset};
pub use split::{
    get_validation_split, read_id_list, split_ordinals, write_id_list, SplitError, SplitRecord,
};

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}
