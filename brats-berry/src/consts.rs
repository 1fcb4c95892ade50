//! 通用常量.

/// 单通道标签值.
pub mod label {
    /// 背景体素值.
    pub const BACKGROUND: u8 = 0;

    /// 默认的前景 (肿瘤) 体素值.
    pub const TUMOR: u8 = 1;
}

/// 默认路径与文件名.
pub mod paths {
    /// 训练图像根目录.
    pub const IMG_PATH: &str = "../../../dataset/MRI_brain_seg/data";

    /// 训练标签根目录.
    pub const LABEL_PATH: &str = "../../../dataset/MRI_brain_seg/label";

    /// 预测输入根目录.
    pub const VALIDATE_PATH: &str = "../../../dataset/MRI_brain_seg/test";

    /// 训练数据打包文件.
    pub const DATA_FILE: &str = "brats_data.npz";

    /// 预测数据打包文件.
    pub const TEST_DATA_FILE: &str = "test_data.npz";

    /// 模型检查点文件.
    pub const MODEL_FILE: &str = "unet_model.bin";

    /// 训练集序号列表.
    pub const TRAINING_FILE: &str = "training_ids.bin";

    /// 验证集序号列表.
    pub const VALIDATION_FILE: &str = "validation_ids.bin";

    /// 预测输出目录.
    pub const PREDICTION_DIR: &str = "../test_data";

    /// 预测输出文件名模板. `{subject}` 会被替换为受试者 id.
    pub const OUTPUT_BASENAME: &str = "{subject}.nii.gz";

    /// 每轮训练日志文件名. 与模型文件放在同一目录下.
    pub const TRAINING_LOG: &str = "training.log";
}

/// 数据被裁剪/重采样到的默认形状.
pub const IMAGE_SHAPE: crate::Shape3d = [144, 144, 144];

/// 训练分块的默认随机起始偏移上限.
pub const TRAINING_PATCH_START_OFFSET: crate::Shape3d = [16, 16, 16];

/// 将概率转换为标签时的阈值.
pub const LABEL_THRESHOLD: f32 = 0.5;
