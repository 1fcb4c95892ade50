//! 体素坐标到世界坐标 (毫米) 的仿射变换.

use crate::Shape3d;
use ndarray::{Array2, ArrayView2};
use nifti::NiftiHeader;
use serde::{Deserialize, Serialize};

/// 4x4 齐次仿射矩阵, 将体素索引 `(i, j, k)` 映射到世界坐标 `(x, y, z)`.
///
/// 该结构是只读的. 任何变换都会生成新的实例.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Affine([[f64; 4]; 4]);

impl Default for Affine {
    #[inline]
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    /// 单位变换.
    pub const fn identity() -> Self {
        Self([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// 仅包含轴向缩放的变换, `zooms` 为三个方向的体素尺寸 (毫米).
    pub const fn from_zooms(zooms: [f64; 3]) -> Self {
        let [x, y, z] = zooms;
        Self([
            [x, 0.0, 0.0, 0.0],
            [0.0, y, 0.0, 0.0],
            [0.0, 0.0, z, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// 直接由前三行构建. 第四行固定为 `[0, 0, 0, 1]`.
    pub const fn from_rows(rows: [[f64; 4]; 3]) -> Self {
        let [r0, r1, r2] = rows;
        Self([r0, r1, r2, [0.0, 0.0, 0.0, 1.0]])
    }

    /// 从 nifti header 读取仿射变换.
    ///
    /// 优先级: `sform_code > 0` 时使用 `srow_*`; 否则 `qform_code > 0`
    /// 时使用四元数; 否则退化为 `pixdim` 缩放.
    pub fn from_header(h: &NiftiHeader) -> Self {
        if h.sform_code > 0 {
            let row = |r: &[f32; 4]| r.map(f64::from);
            return Self::from_rows([row(&h.srow_x), row(&h.srow_y), row(&h.srow_z)]);
        }

        let [qfac, dx, dy, dz, ..] = h.pixdim.map(f64::from);
        if h.qform_code <= 0 {
            return Self::from_zooms([dx, dy, dz]);
        }

        let (b, c, d) = (
            f64::from(h.quatern_b),
            f64::from(h.quatern_c),
            f64::from(h.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let rot = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        let qfac = if qfac < 0.0 { -1.0 } else { 1.0 };
        let scale = [dx, dy, dz * qfac];
        let offset = [
            f64::from(h.quatern_x),
            f64::from(h.quatern_y),
            f64::from(h.quatern_z),
        ];

        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for col in 0..3 {
                row[col] = rot[r][col] * scale[col];
            }
            row[3] = offset[r];
        }
        Self::from_rows(rows)
    }

    /// 将该变换写入 `header` 的 sform 部分, 同时同步 `pixdim`, 并关闭 qform.
    pub fn write_into(&self, header: &mut NiftiHeader) {
        let row = |r: &[f64; 4]| r.map(|v| v as f32);
        header.srow_x = row(&self.0[0]);
        header.srow_y = row(&self.0[1]);
        header.srow_z = row(&self.0[2]);
        header.sform_code = 1;
        header.qform_code = 0;
        let [zx, zy, zz] = self.zooms();
        header.pixdim[0] = 1.0;
        header.pixdim[1] = zx as f32;
        header.pixdim[2] = zy as f32;
        header.pixdim[3] = zz as f32;
    }

    /// 获取底层矩阵.
    #[inline]
    pub fn matrix(&self) -> &[[f64; 4]; 4] {
        &self.0
    }

    /// 三个体素轴方向上的体素尺寸 (即线性部分的列范数).
    pub fn zooms(&self) -> [f64; 3] {
        let m = &self.0;
        [0, 1, 2].map(|c| (m[0][c] * m[0][c] + m[1][c] * m[1][c] + m[2][c] * m[2][c]).sqrt())
    }

    /// 变换一个点.
    #[inline]
    pub fn transform(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [0, 1, 2].map(|r| m[r][0] * p[0] + m[r][1] * p[1] + m[r][2] * p[2] + m[r][3])
    }

    /// 矩阵乘法 `self * rhs`, 即先应用 `rhs` 再应用 `self`.
    pub fn compose(&self, rhs: &Affine) -> Affine {
        let mut out = [[0.0; 4]; 4];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = (0..4).map(|k| self.0[r][k] * rhs.0[k][c]).sum();
            }
        }
        Self(out)
    }

    /// 逆变换. 线性部分奇异时返回 `None`.
    pub fn inverse(&self) -> Option<Affine> {
        let m = &self.0;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;

        let mut r = [[0.0; 4]; 3];
        r[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        r[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        r[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        r[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        r[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        r[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        r[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        r[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        r[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;

        // t' = -R^-1 * t
        for row in 0..3 {
            r[row][3] = -(0..3).map(|k| r[row][k] * m[k][3]).sum::<f64>();
        }
        Some(Self::from_rows(r))
    }

    /// 将形状为 `old` 的体数据重采样为形状 `new` 时对应的新仿射变换.
    ///
    /// 新旧体数据覆盖同一视野: 新体素尺寸为旧尺寸乘以 `old / new`,
    /// 新体素 `0` 的中心位于旧体素坐标 `(s - 1) / 2` 处, 其中 `s = old / new`.
    pub fn rescaled(&self, old: Shape3d, new: Shape3d) -> Affine {
        let s = [0, 1, 2].map(|a| old[a] as f64 / new[a].max(1) as f64);
        let local = Self::from_rows([
            [s[0], 0.0, 0.0, (s[0] - 1.0) / 2.0],
            [0.0, s[1], 0.0, (s[1] - 1.0) / 2.0],
            [0.0, 0.0, s[2], (s[2] - 1.0) / 2.0],
        ]);
        self.compose(&local)
    }

    /// 转换为 `f32` 的 4x4 数组, 以便存入 npz 归档.
    pub fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((4, 4), |(r, c)| self.0[r][c] as f32)
    }

    /// 从 4x4 数组恢复. 形状不为 4x4 时返回 `None`.
    pub fn from_array(a: ArrayView2<f32>) -> Option<Affine> {
        if a.shape() != [4, 4] {
            return None;
        }
        let mut m = [[0.0; 4]; 4];
        for ((r, c), v) in a.indexed_iter() {
            m[r][c] = f64::from(*v);
        }
        Some(Self(m))
    }
}

#[cfg(test)]
mod tests {
    use super::Affine;
    use nifti::NiftiHeader;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn point_eq(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| f64_eq(*x, *y))
    }

    #[test]
    fn test_inverse_roundtrip_point() {
        let a = Affine::from_rows([
            [0.0, -2.0, 0.0, 10.0],
            [1.5, 0.0, 0.0, -3.0],
            [0.0, 0.0, 3.0, 7.0],
        ]);
        let inv = a.inverse().unwrap();
        let p = [4.0, -1.0, 2.5];
        assert!(point_eq(inv.transform(a.transform(p)), p));
        assert!(point_eq(a.compose(&inv).transform(p), p));
    }

    #[test]
    fn test_singular_has_no_inverse() {
        assert!(Affine::from_zooms([1.0, 0.0, 1.0]).inverse().is_none());
    }

    #[test]
    fn test_rescaled_keeps_field_of_view() {
        let a = Affine::from_zooms([1.0, 1.0, 1.0]);
        let r = a.rescaled([4, 4, 4], [2, 2, 2]);
        assert!(point_eq(r.zooms(), [2.0, 2.0, 2.0]));
        // 新体素 0 的中心是旧体素 0 和 1 的中点.
        assert!(point_eq(r.transform([0.0, 0.0, 0.0]), [0.5, 0.5, 0.5]));
        // 新体素 1 的中心是旧体素 2 和 3 的中点.
        assert!(point_eq(r.transform([1.0, 1.0, 1.0]), [2.5, 2.5, 2.5]));
    }

    #[test]
    fn test_header_priority() {
        let mut h = NiftiHeader::default();
        h.pixdim = [1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0];
        h.sform_code = 0;
        h.qform_code = 0;
        assert_eq!(Affine::from_header(&h), Affine::from_zooms([2.0, 3.0, 4.0]));

        // 单位四元数 + 偏移.
        h.qform_code = 1;
        h.quatern_b = 0.0;
        h.quatern_c = 0.0;
        h.quatern_d = 0.0;
        h.quatern_x = 5.0;
        h.quatern_y = 6.0;
        h.quatern_z = 7.0;
        let q = Affine::from_header(&h);
        assert!(point_eq(q.transform([1.0, 1.0, 1.0]), [7.0, 9.0, 11.0]));

        let s = Affine::from_rows([
            [-1.0, 0.0, 0.0, 90.0],
            [0.0, 1.0, 0.0, -126.0],
            [0.0, 0.0, 1.0, -72.0],
        ]);
        s.write_into(&mut h);
        assert_eq!(Affine::from_header(&h), s);
        assert_eq!(h.pixdim[1], 1.0);
    }

    #[test]
    fn test_array_roundtrip() {
        let a = Affine::from_rows([
            [0.5, 0.0, 0.0, 1.0],
            [0.0, 0.25, 0.0, 2.0],
            [0.0, 0.0, 2.0, 3.0],
        ]);
        assert_eq!(Affine::from_array(a.to_array().view()), Some(a));
    }
}
