use std::ops::Index;
use std::path::{Path, PathBuf};

use ndarray::{Array, Array3, ArrayD, ArrayView, Axis, Dimension, Ix3, RemoveAxis};
use nifti::writer::WriterOptions;
use nifti::{InMemNiftiVolume, IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::{Idx3d, Shape3d};

mod affine;
pub mod resample;

pub use affine::Affine;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 体数据读写错误.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// 底层 nifti 读写错误.
    #[error("`{path}`: {source}")]
    Nifti {
        /// 出错的文件.
        path: PathBuf,

        /// 底层错误.
        source: nifti::NiftiError,
    },

    /// 体数据不是 3 维的 (末尾长度为 1 的维度会被自动去除).
    #[error("`{path}` has shape {shape:?}, expected a 3-D volume")]
    NotThreeDimensional {
        /// 出错的文件.
        path: PathBuf,

        /// 实际形状.
        shape: Vec<usize>,
    },

    /// 数据维度不足 3 维.
    #[error("data has shape {0:?}, expected at least 3 dimensions")]
    TooFewDimensions(Vec<usize>),

    /// 仿射变换不可逆.
    #[error("affine transform is singular")]
    SingularAffine,

    /// 数组形状操作错误.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// 从 header 读取形状 `[i, j, k]`.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Shape3d {
    let [_, i, j, k, ..] = h.dim;
    [i as usize, j as usize, k as usize]
}

/// 可以从 nii 文件读出, 并写回 nii 文件的体素类型.
pub trait Voxel: Copy + num::Zero + PartialEq + Send + Sync + 'static {
    /// 将 nifti 体转换为该类型的 ndarray. 必要时进行数值转换.
    fn read_ndarray(volume: InMemNiftiVolume) -> nifti::Result<ArrayD<Self>>;

    /// 以给定写出选项写出 ndarray.
    fn write_ndarray<D>(options: WriterOptions<'_>, data: &Array<Self, D>) -> nifti::Result<()>
    where
        D: Dimension + RemoveAxis;
}

macro_rules! impl_voxel {
    ($($t: ty),+) => {
        $(
            impl Voxel for $t {
                #[inline]
                fn read_ndarray(volume: InMemNiftiVolume) -> nifti::Result<ArrayD<Self>> {
                    volume.into_ndarray::<$t>()
                }

                #[inline]
                fn write_ndarray<D>(
                    options: WriterOptions<'_>,
                    data: &Array<Self, D>,
                ) -> nifti::Result<()>
                where
                    D: Dimension + RemoveAxis,
                {
                    options.write_nifti(data)
                }
            }
        )+
    };
}

impl_voxel!(u8, f32);

/// 读取 nii 文件, 返回 header 和至少 3 维的体数据.
fn read_volume<T: Voxel>(path: &Path) -> Result<(BoxedHeader, ArrayD<T>), VolumeError> {
    let wrap = |source| VolumeError::Nifti {
        path: path.to_owned(),
        source,
    };
    let obj = ReaderOptions::new().read_file(path).map_err(wrap)?;
    let header = Box::new(obj.header().clone());
    let data = T::read_ndarray(obj.into_volume()).map_err(wrap)?;
    Ok((header, data))
}

/// 去除末尾长度为 1 的维度, 得到 3 维体数据.
fn squeeze_to_3d<T>(mut data: ArrayD<T>, path: &Path) -> Result<Array3<T>, VolumeError> {
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    if data.ndim() != 3 {
        return Err(VolumeError::NotThreeDimensional {
            path: path.to_owned(),
            shape: data.shape().to_vec(),
        });
    }
    Ok(data.into_dimensionality::<Ix3>()?)
}

/// 以 `header` 为参考写出 nii 文件. 写出的数据不带缩放 (`scl_slope = 1`).
fn write_with_header<A, D>(
    path: &Path,
    header: &NiftiHeader,
    data: &Array<A, D>,
) -> Result<(), VolumeError>
where
    A: Voxel,
    D: Dimension + RemoveAxis,
{
    let mut header = header.clone();
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    let options = WriterOptions::new(path).reference_header(&header);
    A::write_ndarray(options, data).map_err(|source| VolumeError::Nifti {
        path: path.to_owned(),
        source,
    })
}

/// 以仿射变换 `affine` 写出任意 (至少 3 维) 体数据. 前三维为空间维度,
/// 其余维度视为通道. 路径以 `.gz` 结尾时自动压缩.
pub fn write_volume<A, D, P>(
    path: P,
    data: &Array<A, D>,
    affine: &Affine,
) -> Result<(), VolumeError>
where
    A: Voxel,
    D: Dimension + RemoveAxis,
    P: AsRef<Path>,
{
    let mut header = NiftiHeader::default();
    affine.write_into(&mut header);
    write_with_header(path.as_ref(), &header, data)
}

/// 读取至少 3 维的体数据及其仿射变换. 前三维为空间维度, 其余维度原样保留.
pub fn read_volume_with_affine<T, P>(path: P) -> Result<(ArrayD<T>, Affine), VolumeError>
where
    T: Voxel,
    P: AsRef<Path>,
{
    let (header, data) = read_volume::<T>(path.as_ref())?;
    if data.ndim() < 3 {
        return Err(VolumeError::TooFewDimensions(data.shape().to_vec()));
    }
    Ok((data, Affine::from_header(&header)))
}

/// 强度平均值与 (总体) 标准差. 空数据返回 `(0, 0)`.
pub(crate) fn mean_std<D: Dimension>(data: ArrayView<'_, f32, D>) -> (f64, f64) {
    let n = data.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = data.iter().map(|v| f64::from(*v)).sum::<f64>() / n as f64;
    let var = data
        .iter()
        .map(|v| (f64::from(*v) - mean).powi(2))
        .sum::<f64>()
        / n as f64;
    (mean, var.sqrt())
}

/// 3D nii 文件 header 的共用属性和部分通用操作.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小, 按 `[i, j, k]` 排列.
    #[inline]
    fn shape(&self) -> Shape3d {
        get_shape_from_header(self.header())
    }

    /// 获取体素索引到世界坐标的仿射变换.
    #[inline]
    fn affine(&self) -> Affine {
        Affine::from_header(self.header())
    }
}

/// nii 格式 3D MRI 扫描 (单模态), 包括 header 和体素强度. 强度以 `f32` 保存.
#[derive(Debug, Clone)]
pub struct MriScan {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl NiftiHeaderAttr for MriScan {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for MriScan {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl MriScan {
    /// 打开 nii 文件格式的 3D MRI 扫描. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let (header, data) = read_volume::<f32>(path.as_ref())?;
        let data = squeeze_to_3d(data, path.as_ref())?;
        Ok(Self { header, data })
    }

    /// 根据体数据和仿射变换直接创建扫描.
    pub fn from_affine(data: Array3<f32>, affine: &Affine) -> Self {
        let mut header = Box::<NiftiHeader>::default();
        affine.write_into(&mut header);
        let [i, j, k] = [0, 1, 2].map(|a| data.len_of(Axis(a)) as u16);
        header.dim = [3, i, j, k, 1, 1, 1, 1];
        Self { header, data }
    }

    /// 将扫描保存到 `path`. 路径以 `.gz` 结尾时自动压缩.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        write_with_header(path.as_ref(), &self.header, &self.data)
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }


}

/// nii 格式 3D 分割标签, 包括 header 和标签值. 标签值以 `u8` 保存.
#[derive(Debug, Clone)]
pub struct MriLabel {
    header: BoxedHeader,
    data: Array3<u8>,
}

impl NiftiHeaderAttr for MriLabel {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for MriLabel {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl MriLabel {
    /// 打开 nii 文件格式的 3D 标签. `path` 为 nii 文件的本地路径. 如果打开成功,
    /// 则返回 `Ok(Self)`, 否则返回 `Err`.
    ///
    /// 以浮点存储的标签会被截断为整数.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let (header, data) = read_volume::<u8>(path.as_ref())?;
        let data = squeeze_to_3d(data, path.as_ref())?;
        Ok(Self { header, data })
    }

    /// 根据标签数据和仿射变换直接创建标签.
    pub fn from_affine(data: Array3<u8>, affine: &Affine) -> Self {
        let mut header = Box::<NiftiHeader>::default();
        affine.write_into(&mut header);
        let [i, j, k] = [0, 1, 2].map(|a| data.len_of(Axis(a)) as u16);
        header.dim = [3, i, j, k, 1, 1, 1, 1];
        Self { header, data }
    }

    /// 将标签保存到 `path`. 路径以 `.gz` 结尾时自动压缩.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        write_with_header(path.as_ref(), &self.header, &self.data)
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u8, Ix3> {
        self.data.view()
    }



    /// 获取标签中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 标签中出现过的所有取值, 升序排列.
    pub fn unique(&self) -> Vec<u8> {
        let mut seen = [false; 256];
        self.data.iter().for_each(|p| seen[*p as usize] = true);
        (0..=u8::MAX).filter(|v| seen[*v as usize]).collect()
    }
}
