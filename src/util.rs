/**
 * File: /src/util.rs
 * Created Date: Tuesday, June 18th 2024
 * Author: Zihan
 * -----
 * HISTORY:
 * Date      		By   	Comments
 * ----------		------	---------------------------------------------------------
**/
extern crate nalgebra as na;
use na::DMatrix;
use ndarray::{Array2, ArrayView2};

/// Split `data` into the consecutive segments delimited by a compressed pointer
/// array (`ptr[i]..ptr[i + 1]`). The segments are a disjoint cover of
/// `data[ptr[0]..ptr[last]]`, so each can be handed to a different task.
pub fn split_segments_mut<'a, T>(mut data: &'a mut [T], ptr: &[usize]) -> Vec<&'a mut [T]> {
    let mut segments = Vec::with_capacity(ptr.len().saturating_sub(1));
    if let Some(&first) = ptr.first() {
        let (_, rest) = std::mem::take(&mut data).split_at_mut(first);
        data = rest;
    }
    for bounds in ptr.windows(2) {
        let (head, tail) = std::mem::take(&mut data).split_at_mut(bounds[1] - bounds[0]);
        segments.push(head);
        data = tail;
    }
    segments
}

/// Split a row-major `n x k` buffer into row ranges given by `bounds`
/// (`bounds[b]..bounds[b + 1]` rows per part).
pub fn split_rows_mut<'a, T>(data: &'a mut [T], bounds: &[usize], k: usize) -> Vec<&'a mut [T]> {
    let scaled: Vec<usize> = bounds.iter().map(|&b| b * k).collect();
    split_segments_mut(data, &scaled)
}

#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn clone_to_dmatrix<T>(array_view: ArrayView2<T>) -> DMatrix<T>
where
    T: Clone,
    T: na::Scalar,
{
    DMatrix::from_fn(array_view.nrows(), array_view.ncols(), |i, j| {
        array_view[(i, j)].clone()
    })
}

pub fn dmatrix_to_array<T>(matrix: &DMatrix<T>) -> Array2<T>
where
    T: Clone,
    T: na::Scalar,
{
    Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| {
        matrix[(i, j)].clone()
    })
}
