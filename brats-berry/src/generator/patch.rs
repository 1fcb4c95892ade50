//! 分块 (patch) 索引与取块.
//!
//! 块索引是块的起点 (可以为负, 也可以越过体数据末端), 越界部分以 0 填充.

use crate::Shape3d;
use itertools::iproduct;
use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::Rng;
use std::ops::Range;

/// 块起点, 按 (i, j, k) 组织.
pub type PatchIndex = [isize; 3];

/// 计算覆盖 `image_shape` 的所有块起点.
///
/// 步长为 `patch_shape - overlap`. `start` 为 `None` 时网格居中,
/// 两端溢出部分均分; 否则从 `start` 开始铺块.
pub fn compute_patch_indices(
    image_shape: Shape3d,
    patch_shape: Shape3d,
    overlap: usize,
    start: Option<PatchIndex>,
) -> Vec<PatchIndex> {
    let step: [isize; 3] =
        std::array::from_fn(|a| (patch_shape[a] as isize - overlap as isize).max(1));
    let start = start.unwrap_or_else(|| {
        std::array::from_fn(|a| {
            let img = image_shape[a] as f64;
            let st = step[a] as f64;
            let n = (img / st).ceil();
            let overflow = st * n - img + overlap as f64;
            -((overflow / 2.0).ceil() as isize)
        })
    });
    let axis = |a: usize| {
        let stop = image_shape[a] as isize + start[a];
        (start[a]..stop).step_by(step[a] as usize)
    };
    iproduct!(axis(0), axis(1), axis(2))
        .map(|(i, j, k)| [i, j, k])
        .collect()
}

/// 训练时使用的随机起点: 每个轴取 `[0, offset)` 内的随机数再取负.
pub fn random_start_offset<R: Rng>(offset: Shape3d, rng: &mut R) -> PatchIndex {
    std::array::from_fn(|a| match offset[a] {
        0 => 0,
        o => -(rng.gen_range(0..o) as isize),
    })
}

/// 块与体数据在每个轴上的重叠区间: (源区间, 块内区间). 不重叠时返回 `None`.
fn overlap_ranges(
    shape: Shape3d,
    patch_shape: Shape3d,
    index: PatchIndex,
) -> Option<[(Range<usize>, Range<usize>); 3]> {
    let mut ans: [(Range<usize>, Range<usize>); 3] = Default::default();
    for a in 0..3 {
        let lo = index[a].max(0);
        let hi = (index[a] + patch_shape[a] as isize).min(shape[a] as isize);
        if lo >= hi {
            return None;
        }
        ans[a] = (
            lo as usize..hi as usize,
            (lo - index[a]) as usize..(hi - index[a]) as usize,
        );
    }
    Some(ans)
}

/// 从 3D 数据中取出起点为 `index` 的块, 越界部分为 0.
pub fn get_patch_from_3d_data<T>(
    data: ArrayView3<T>,
    patch_shape: Shape3d,
    index: PatchIndex,
) -> Array3<T>
where
    T: Copy + num::Zero,
{
    let (x, y, z) = data.dim();
    let mut out = Array3::zeros(patch_shape);
    if let Some([(si, di), (sj, dj), (sk, dk)]) = overlap_ranges([x, y, z], patch_shape, index) {
        out.slice_mut(s![di, dj, dk])
            .assign(&data.slice(s![si, sj, sk]));
    }
    out
}

/// 对 `通道 × X × Y × Z` 数据的每个通道取块.
pub fn get_patch_from_4d_data<T>(
    data: ArrayView4<T>,
    patch_shape: Shape3d,
    index: PatchIndex,
) -> Array4<T>
where
    T: Copy + num::Zero,
{
    let [px, py, pz] = patch_shape;
    let mut out = Array4::zeros((data.len_of(Axis(0)), px, py, pz));
    for (src, mut dst) in data.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        dst.assign(&get_patch_from_3d_data(src, patch_shape, index));
    }
    out
}

/// 将 `通道 × 块` 的预测结果拼回 `通道 × X × Y × Z`. 重叠区域取平均.
pub fn reconstruct_from_patches(
    patches: &[Array4<f32>],
    indices: &[PatchIndex],
    data_shape: [usize; 4],
) -> Array4<f32> {
    let [c, x, y, z] = data_shape;
    let mut sum = Array4::<f32>::zeros((c, x, y, z));
    let mut count = Array3::<f32>::zeros((x, y, z));
    for (patch, &index) in patches.iter().zip(indices) {
        let (_, px, py, pz) = patch.dim();
        let Some([(si, di), (sj, dj), (sk, dk)]) = overlap_ranges([x, y, z], [px, py, pz], index)
        else {
            continue;
        };
        let src = patch.slice(s![.., di, dj, dk]);
        let mut dst = sum.slice_mut(s![.., si.clone(), sj.clone(), sk.clone()]);
        dst += &src;
        count.slice_mut(s![si, sj, sk]).mapv_inplace(|v| v + 1.0);
    }
    for mut channel in sum.axis_iter_mut(Axis(0)) {
        ndarray::Zip::from(&mut channel)
            .and(&count)
            .for_each(|v, &n| {
                if n > 0.0 {
                    *v /= n;
                }
            });
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_centered_grid() {
        let idx = compute_patch_indices([144, 144, 144], [64, 64, 64], 0, None);
        assert_eq!(idx.len(), 27);
        assert_eq!(idx[0], [-24, -24, -24]);
        assert_eq!(idx[26], [104, 104, 104]);

        // 恰好整除时没有溢出.
        let idx = compute_patch_indices([4, 4, 4], [2, 2, 2], 0, None);
        assert_eq!(idx.len(), 8);
        assert_eq!(idx[0], [0, 0, 0]);
    }

    #[test]
    fn test_grid_with_overlap_and_start() {
        let idx = compute_patch_indices([6, 1, 1], [4, 1, 1], 2, Some([0, 0, 0]));
        let firsts: Vec<_> = idx.iter().map(|p| p[0]).collect();
        assert_eq!(firsts, vec![0, 2, 4]);
        let idx = compute_patch_indices([4, 4, 4], [2, 2, 2], 0, Some([-1, 0, 0]));
        assert_eq!(idx[0], [-1, 0, 0]);
        assert_eq!(idx.len(), 2 * 2 * 2);
    }

    #[test]
    fn test_random_start_offset_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let o = random_start_offset([3, 1, 0], &mut rng);
            assert!((-2..=0).contains(&o[0]));
            assert_eq!(o[1], 0);
            assert_eq!(o[2], 0);
        }
    }

    #[test]
    fn test_patch_zero_padding() {
        let data = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| (i * 9 + j * 3 + k + 1) as u8);
        let p = get_patch_from_3d_data(data.view(), [2, 2, 2], [-1, -1, -1]);
        assert_eq!(p[(0, 0, 0)], 0);
        assert_eq!(p[(1, 1, 1)], data[(0, 0, 0)]);

        let p = get_patch_from_3d_data(data.view(), [2, 2, 2], [2, 2, 2]);
        assert_eq!(p[(0, 0, 0)], data[(2, 2, 2)]);
        assert_eq!(p.iter().filter(|v| **v == 0).count(), 7);

        let p = get_patch_from_3d_data(data.view(), [2, 2, 2], [5, 0, 0]);
        assert!(p.iter().all(|v| *v == 0));
    }

    #[test]
    fn test_reconstruct_round_trip() {
        let data = Array4::from_shape_fn((2, 4, 4, 4), |(c, i, j, k)| (c + i + j + k) as f32);
        let indices = compute_patch_indices([4, 4, 4], [3, 3, 3], 1, None);
        let patches: Vec<_> = indices
            .iter()
            .map(|&idx| get_patch_from_4d_data(data.view(), [3, 3, 3], idx))
            .collect();
        let back = reconstruct_from_patches(&patches, &indices, [2, 4, 4, 4]);
        assert_eq!(back, data);
    }
}
