//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Shape3d};

pub use crate::data::resample::{resample_to_img, Interpolation, LABEL_INTERPOLATION};
pub use crate::data::{Affine, MriLabel, MriScan, NiftiHeaderAttr};

pub use crate::consts::label::{BACKGROUND, TUMOR};
pub use crate::consts::{IMAGE_SHAPE, LABEL_THRESHOLD};

pub use crate::config::{merge_overrides, Config, MergePolicy};

pub use crate::dataset::home_dataset_dir_with;
pub use crate::dataset::{
    self, fetch_inference_files, fetch_training_files, FileGroup, PackedDataset, SubjectList,
};

pub use crate::model::{SegmentationModel, VoxelNet};
pub use crate::pipeline::{run_prediction, run_training, PredictArgs, TrainingSummary};
pub use crate::predict::PredictionReport;

pub use crate::{Error, Result};
