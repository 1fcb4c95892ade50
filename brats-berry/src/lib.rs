#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供 BraTS 风格脑部 MRI 分割流程的全部胶水逻辑与一个可运行的参考后端.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 该 crate 假定训练集按照 "图像目录 + 标签目录" 两棵同构目录树组织,
//!   图像与其标签文件名 (相对路径) 完全一致.
//! 2. 3D U-Net 本体不在本 crate 范围内. [`model::VoxelNet`] 仅是一个满足
//!   [`model::SegmentationModel`] 契约的逐体素参考实现, 使流水线可以端到端运行.
//!
//! # 流水线
//!
//! ### 配置 ✅
//!
//! 默认值 + 覆盖项一次性构建, 此后只读. 派生量 (通道数, 输入形状等) 按需计算,
//! 不会与源字段失去一致.
//!
//! 实现位于 `brats-berry/src/config`.
//!
//! ### 受试者发现 ✅
//!
//! 递归遍历目录, 以文件名第一个 `.` 之前的部分作为受试者 id.
//! 训练模式下会校验每个图像都存在同名标签.
//!
//! 实现位于 `brats-berry/src/dataset/discovery.rs`.
//!
//! ### 数据打包 & 划分记录 ✅
//!
//! 将 nifti 体数据重采样到统一形状, 按通道标准化后写入 `.npz` 归档.
//! 训练/验证划分以 `bincode` 持久化, 一旦存在即被复用.
//!
//! 实现位于 `brats-berry/src/dataset/{packed, split}.rs`.
//!
//! ### 数据生成器 ✅
//!
//! 整图或分块 (patch) 批次的无穷迭代器, 以及每轮步数计算.
//!
//! 实现位于 `brats-berry/src/generator`.
//!
//! ### 模型, 训练与预测 ✅
//!
//! 1. 学习率平台期衰减, 早停, 仅保存最优模型. ✅
//! 2. 预测逐受试者隔离失败, 并汇总成功/失败列表. ✅
//! 3. 预测结果以最近邻插值重采样回原始扫描的体素网格. ✅
//!
//! 实现位于 `brats-berry/src/{model, train.rs, predict.rs, pipeline.rs}`.

/// 三维索引, 按 nifti 体素索引 (i, j, k) 顺序组织.
pub type Idx3d = (usize, usize, usize);

/// 三维形状, 按 nifti 体素索引 (i, j, k) 顺序组织.
pub type Shape3d = [usize; 3];

/// 3D MRI nii 文件基础数据结构与几何操作.
mod data;

pub use data::{
    read_volume_with_affine, resample, write_volume, Affine, MriLabel, MriScan, NiftiHeaderAttr,
    VolumeError, Voxel,
};

pub mod config;
pub mod consts;
pub mod dataset;
mod error;
pub mod generator;
pub mod model;
pub mod pipeline;
pub mod predict;
pub mod prelude;
pub mod train;

pub use error::{Error, Result};
