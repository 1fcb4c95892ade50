//! 体数据重采样.
//!
//! 目标网格的每个体素先经目标仿射变换映射到世界坐标, 再经源仿射变换的逆映射回源体素坐标,
//! 最后在源体数据上取样. 视野之外的体素取 0.

use super::{Affine, MriLabel, MriScan, NiftiHeaderAttr, Voxel, VolumeError};
use crate::Shape3d;
use ndarray::{Array3, Array4, ArrayD, ArrayView3, ArrayViewD, Axis, IxDyn, Zip};

/// 插值方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interpolation {
    /// 最近邻. 唯一适用于类别数据 (标签) 的方式.
    Nearest,

    /// 三线性插值. 仅用于连续强度数据.
    Linear,
}

/// 标签 (类别) 数据重采样所用的插值方式. 该路径上永远是最近邻.
pub const LABEL_INTERPOLATION: Interpolation = Interpolation::Nearest;

/// 计算 "目标体素 -> 源体素" 的复合变换.
fn voxel_mapping(source_affine: &Affine, target_affine: &Affine) -> Result<Affine, VolumeError> {
    let inv = source_affine
        .inverse()
        .ok_or(VolumeError::SingularAffine)?;
    Ok(inv.compose(target_affine))
}

#[inline]
fn nearest_index(p: f64, len: usize) -> Option<usize> {
    let r = p.round();
    (r >= 0.0 && r < len as f64).then_some(r as usize)
}

#[inline]
fn sample_nearest<T: Voxel>(src: &ArrayView3<T>, p: [f64; 3]) -> T {
    let (x, y, z) = src.dim();
    match (
        nearest_index(p[0], x),
        nearest_index(p[1], y),
        nearest_index(p[2], z),
    ) {
        (Some(i), Some(j), Some(k)) => src[(i, j, k)],
        _ => T::zero(),
    }
}

/// 三线性取样. 超出视野半个体素以上的位置取 0, 边缘半个体素以内夹紧到边缘.
fn sample_linear(src: &ArrayView3<f32>, p: [f64; 3]) -> f32 {
    let (x, y, z) = src.dim();
    let dims = [x, y, z];
    let mut base = [0usize; 3];
    let mut frac = [0f64; 3];
    for a in 0..3 {
        let len = dims[a];
        if len == 0 || p[a] < -0.5 || p[a] > len as f64 - 0.5 {
            return 0.0;
        }
        let c = p[a].clamp(0.0, (len - 1) as f64);
        let f = c.floor();
        base[a] = f as usize;
        frac[a] = c - f;
    }

    let mut acc = 0.0f64;
    for corner in 0..8usize {
        let mut w = 1.0;
        let mut idx = [0usize; 3];
        for a in 0..3 {
            let up = (corner >> a) & 1 == 1;
            idx[a] = if up {
                (base[a] + 1).min(dims[a] - 1)
            } else {
                base[a]
            };
            w *= if up { frac[a] } else { 1.0 - frac[a] };
        }
        if w > 0.0 {
            acc += w * f64::from(src[(idx[0], idx[1], idx[2])]);
        }
    }
    acc as f32
}

/// 按 `shape` 逐体素填充, 体素值由 `f(源体素坐标)` 给出.
fn fill<T, F>(shape: Shape3d, mapping: &Affine, f: F) -> Array3<T>
where
    T: Voxel,
    F: Fn([f64; 3]) -> T + Sync + Send,
{
    let mut out = Array3::<T>::zeros((shape[0], shape[1], shape[2]));
    let op = |(i, j, k): (usize, usize, usize), v: &mut T| {
        *v = f(mapping.transform([i as f64, j as f64, k as f64]));
    };
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            Zip::indexed(&mut out).par_for_each(op);
        } else {
            Zip::indexed(&mut out).for_each(op);
        }
    }
    out
}

/// 以最近邻方式将 `source` 重采样到目标网格.
pub fn resample_nearest<T: Voxel>(
    source: ArrayView3<T>,
    source_affine: &Affine,
    target_shape: Shape3d,
    target_affine: &Affine,
) -> Result<Array3<T>, VolumeError> {
    let mapping = voxel_mapping(source_affine, target_affine)?;
    Ok(fill(target_shape, &mapping, |p| sample_nearest(&source, p)))
}

/// 以三线性插值方式将 `source` 重采样到目标网格.
pub fn resample_linear(
    source: ArrayView3<f32>,
    source_affine: &Affine,
    target_shape: Shape3d,
    target_affine: &Affine,
) -> Result<Array3<f32>, VolumeError> {
    let mapping = voxel_mapping(source_affine, target_affine)?;
    Ok(fill(target_shape, &mapping, |p| sample_linear(&source, p)))
}

/// 以 `interpolation` 方式将强度数据 `source` 重采样到目标网格.
pub fn resample(
    source: ArrayView3<f32>,
    source_affine: &Affine,
    target_shape: Shape3d,
    target_affine: &Affine,
    interpolation: Interpolation,
) -> Result<Array3<f32>, VolumeError> {
    match interpolation {
        Interpolation::Nearest => {
            resample_nearest(source, source_affine, target_shape, target_affine)
        }
        Interpolation::Linear => {
            resample_linear(source, source_affine, target_shape, target_affine)
        }
    }
}

/// 将扫描缩放到 `new_shape`, 保持视野不变. 返回新数据及其仿射变换.
pub fn resize_scan(
    scan: &MriScan,
    new_shape: Shape3d,
    interpolation: Interpolation,
) -> Result<(Array3<f32>, Affine), VolumeError> {
    let affine = scan.affine();
    let new_affine = affine.rescaled(scan.shape(), new_shape);
    let data = resample(scan.data(), &affine, new_shape, &new_affine, interpolation)?;
    Ok((data, new_affine))
}

/// 将标签缩放到 `new_shape`, 保持视野不变. 总是使用最近邻.
pub fn resize_label(
    label: &MriLabel,
    new_shape: Shape3d,
) -> Result<(Array3<u8>, Affine), VolumeError> {
    let affine = label.affine();
    let new_affine = affine.rescaled(label.shape(), new_shape);
    let data = resample_nearest(label.data(), &affine, new_shape, &new_affine)?;
    Ok((data, new_affine))
}

/// 重采样结果, 附带实际使用的插值方式.
#[derive(Debug, Clone)]
pub struct Resampled<T> {
    /// 重采样后的数据. 前三维与参考图像一致, 其余维度 (通道) 不变.
    pub data: ArrayD<T>,

    /// 实际使用的插值方式.
    pub interpolation: Interpolation,
}

/// 将预测结果 `prediction` (仿射变换为 `prediction_affine`) 重采样到 `reference`
/// 的体素网格上.
///
/// 预测结果是类别数据 (或逐类别的概率图), 因此该路径固定使用 [`LABEL_INTERPOLATION`].
/// 3 维以上的数据会对每个通道分别重采样.
pub fn resample_to_img<T, R>(
    prediction: ArrayViewD<T>,
    prediction_affine: &Affine,
    reference: &R,
) -> Result<Resampled<T>, VolumeError>
where
    T: Voxel,
    R: NiftiHeaderAttr,
{
    let shape = prediction.shape().to_vec();
    if shape.len() < 3 {
        return Err(VolumeError::TooFewDimensions(shape));
    }
    let channels: usize = shape[3..].iter().product();
    let flat: Vec<T> = prediction.iter().copied().collect();
    let stacked = Array4::from_shape_vec((shape[0], shape[1], shape[2], channels), flat)?;

    let target_shape = reference.shape();
    let target_affine = reference.affine();
    let [x, y, z] = target_shape;
    let mut out = Array4::<T>::zeros((x, y, z, channels));
    for (src, mut dst) in stacked
        .axis_iter(Axis(3))
        .zip(out.axis_iter_mut(Axis(3)))
    {
        let r = resample_nearest(src, prediction_affine, target_shape, &target_affine)?;
        dst.assign(&r);
    }

    let mut out_shape = target_shape.to_vec();
    out_shape.extend_from_slice(&shape[3..]);
    let data = out.into_shape(IxDyn(&out_shape))?;
    Ok(Resampled {
        data,
        interpolation: LABEL_INTERPOLATION,
    })
}
