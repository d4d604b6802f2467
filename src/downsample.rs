//! Downsampling kernels: averaging and striding for continuous layers, the
//! COUNTLESS 2x2 mode vote for label layers.

use crate::types::{Label, LayerType, Voxel};
use ndarray::{Array4, ArrayView4};
use num_traits::One;

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Box-filter downsampling. Ragged edge windows average over however many
/// samples they cover. Accumulates in f64 and truncates back to the element
/// type.
pub fn downsample_with_averaging<T: Voxel>(
    src: ArrayView4<'_, T>,
    factor: [usize; 3],
) -> Array4<T> {
    let (sx, sy, sz, sc) = src.dim();
    let out_shape = (
        ceil_div(sx, factor[0]),
        ceil_div(sy, factor[1]),
        ceil_div(sz, factor[2]),
        sc,
    );
    let mut sums = Array4::<f64>::zeros(out_shape);
    let mut counts = ndarray::Array3::<f64>::zeros((out_shape.0, out_shape.1, out_shape.2));

    for x in 0..sx {
        for y in 0..sy {
            for z in 0..sz {
                let o = [x / factor[0], y / factor[1], z / factor[2]];
                counts[[o[0], o[1], o[2]]] += 1.0;
                for c in 0..sc {
                    sums[[o[0], o[1], o[2], c]] += src[[x, y, z, c]].to_accum();
                }
            }
        }
    }

    Array4::from_shape_fn(out_shape, |(x, y, z, c)| {
        T::from_accum(sums[[x, y, z, c]] / counts[[x, y, z]])
    })
}

/// Downsampling by keeping every `factor`-th sample.
pub fn downsample_with_striding<T: Voxel>(
    src: ArrayView4<'_, T>,
    factor: [usize; 3],
) -> Array4<T> {
    let (sx, sy, sz, sc) = src.dim();
    let out_shape = (
        ceil_div(sx, factor[0]),
        ceil_div(sy, factor[1]),
        ceil_div(sz, factor[2]),
        sc,
    );
    Array4::from_shape_fn(out_shape, |(x, y, z, c)| {
        src[[x * factor[0], y * factor[1], z * factor[2], c]]
    })
}

/// Mode of one 2x2 block. The vote runs in the next wider unsigned type with
/// every value biased by +1 so a genuine zero label cannot be confused with
/// the no-match result.
fn countless_vote<T: Label>(a: T, b: T, c: T, d: T) -> T {
    let one = <T::Wide as One>::one();
    let aw = a.widen() + one;
    let bw = b.widen() + one;
    let cw = c.widen() + one;
    let dw = d.widen() + one;

    let winner = if aw == bw || aw == cw {
        aw
    } else if bw == cw {
        bw
    } else {
        dw
    };
    T::narrow(winner - one)
}

/// COUNTLESS 2x2 halving of the two axes other than `preserved`. Those axes
/// must be even.
fn countless_halve<T: Label>(src: &Array4<T>, preserved: usize) -> Array4<T> {
    let (sx, sy, sz, sc) = src.dim();
    let shape = [sx, sy, sz];
    let (a0, a1) = match preserved {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    debug_assert!(shape[a0] % 2 == 0 && shape[a1] % 2 == 0);

    let mut out_shape = shape;
    out_shape[a0] /= 2;
    out_shape[a1] /= 2;

    Array4::from_shape_fn(
        (out_shape[0], out_shape[1], out_shape[2], sc),
        |(x, y, z, c)| {
            let o = [x, y, z];
            let at = |di: usize, dj: usize| {
                let mut s = o;
                s[a0] = 2 * o[a0] + di;
                s[a1] = 2 * o[a1] + dj;
                src[[s[0], s[1], s[2], c]]
            };
            countless_vote(at(0, 0), at(0, 1), at(1, 0), at(1, 1))
        },
    )
}

/// Pads odd-sized axes (among those flagged) to even by duplicating the
/// leading slice, so a 2x2 vote can consume the whole extent.
pub fn odd_to_even<T: Voxel>(src: ArrayView4<'_, T>, axes: [bool; 3]) -> Array4<T> {
    let (sx, sy, sz, sc) = src.dim();
    let shape = [sx, sy, sz];
    let mut padded = [false; 3];
    let mut out_shape = shape;
    for d in 0..3 {
        if axes[d] && shape[d] % 2 == 1 {
            padded[d] = true;
            out_shape[d] += 1;
        }
    }
    if padded == [false; 3] {
        return src.to_owned();
    }

    Array4::from_shape_fn(
        (out_shape[0], out_shape[1], out_shape[2], sc),
        |(x, y, z, c)| {
            let pick = |i: usize, d: usize| if padded[d] { i.saturating_sub(1) } else { i };
            src[[pick(x, 0), pick(y, 1), pick(z, 2), c]]
        },
    )
}

fn is_pot(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}

/// Label-preserving downsampling. When the factor leaves one axis untouched
/// and the total reduction is a power of two, repeatedly halves the other two
/// axes with the COUNTLESS mode vote, padding odd extents first. Any other
/// factor falls back to striding.
pub fn downsample_segmentation<T: Label>(
    src: ArrayView4<'_, T>,
    factor: [usize; 3],
) -> Array4<T> {
    if factor == [1, 1, 1] {
        return src.to_owned();
    }

    let product = factor[0] * factor[1] * factor[2];
    let twod_pot = factor.contains(&1) && is_pot(product);
    if !twod_pot {
        return downsample_with_striding(src, factor);
    }

    let preserved = factor
        .iter()
        .position(|&f| f == 1)
        .unwrap_or(2);

    let mut pad_axes = [false; 3];
    for d in 0..3 {
        pad_axes[d] = d != preserved;
    }
    let data = odd_to_even(src, pad_axes);
    let halved = countless_halve(&data, preserved);

    let mut next = factor;
    for d in 0..3 {
        if d != preserved {
            next[d] /= 2;
        }
    }
    next[preserved] = 1;
    downsample_segmentation(halved.view(), next)
}

/// Kernel dispatch by layer type. Discrete layers get the label-preserving
/// path, everything else is averaged.
pub fn downsample_for_layer<T: Label>(
    layer_type: LayerType,
    src: ArrayView4<'_, T>,
    factor: [usize; 3],
) -> Array4<T> {
    if layer_type.is_discrete() {
        downsample_segmentation(src, factor)
    } else {
        downsample_with_averaging(src, factor)
    }
}
