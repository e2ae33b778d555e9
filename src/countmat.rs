use ndarray::{Array2, ArrayView2};

// Compressed sparse row unit-by-feature count matrix. Rows are units in the
// order they were added, column indices within a row are sorted.
#[derive(Clone, Debug, PartialEq)]
pub struct CountMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<u32>,
    data: Vec<f64>,
}

impl CountMatrix {
    pub fn new(ncols: usize) -> CountMatrix {
        CountMatrix {
            nrows: 0,
            ncols,
            indptr: vec![0],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Append a row given as (column, count) pairs in any order. Repeated
    /// columns are summed.
    pub fn push_row(&mut self, mut entries: Vec<(u32, f64)>) {
        entries.sort_unstable_by_key(|&(j, _)| j);
        for (j, x) in entries {
            debug_assert!((j as usize) < self.ncols);
            let row_start = self.indptr[self.nrows];
            if self.indices.len() > row_start && self.indices.last() == Some(&j) {
                if let Some(last) = self.data.last_mut() {
                    *last += x;
                }
            } else {
                self.indices.push(j);
                self.data.push(x);
            }
        }
        self.indptr.push(self.indices.len());
        self.nrows += 1;
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn row(&self, i: usize) -> (&[u32], &[f64]) {
        let (from, to) = (self.indptr[i], self.indptr[i + 1]);
        (&self.indices[from..to], &self.data[from..to])
    }

    pub fn row_sums(&self) -> Vec<f64> {
        (0..self.nrows).map(|i| self.row(i).1.iter().sum()).collect()
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    // Rows [from, to) as a new matrix.
    pub fn slice_rows(&self, from: usize, to: usize) -> CountMatrix {
        let (a, b) = (self.indptr[from], self.indptr[to]);
        CountMatrix {
            nrows: to - from,
            ncols: self.ncols,
            indptr: self.indptr[from..=to].iter().map(|p| p - a).collect(),
            indices: self.indices[a..b].to_vec(),
            data: self.data[a..b].to_vec(),
        }
    }

    /// `weightsᵀ · self` for a dense [nrows, k] weight matrix, giving [k, ncols].
    pub fn weighted_column_sums(&self, weights: ArrayView2<f64>) -> Array2<f64> {
        assert_eq!(weights.nrows(), self.nrows);
        let k = weights.ncols();
        let mut out = Array2::zeros((k, self.ncols));
        for i in 0..self.nrows {
            let (js, xs) = self.row(i);
            let w = weights.row(i);
            for (&j, &x) in js.iter().zip(xs) {
                let mut col = out.column_mut(j as usize);
                col.scaled_add(x, &w);
            }
        }
        out
    }

}

#[cfg(test)]
impl CountMatrix {
    pub fn from_rows(rows: Vec<Vec<(u32, f64)>>, ncols: usize) -> CountMatrix {
        let mut mat = CountMatrix::new(ncols);
        for row in rows {
            mat.push_row(row);
        }
        mat
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.nrows, self.ncols));
        for i in 0..self.nrows {
            let (js, xs) = self.row(i);
            for (&j, &x) in js.iter().zip(xs) {
                out[[i, j as usize]] = x;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_push_row_merges_and_sorts() {
        let mut mat = CountMatrix::new(4);
        mat.push_row(vec![(3, 1.0), (0, 2.0), (3, 4.0)]);
        mat.push_row(vec![]);
        mat.push_row(vec![(1, 1.0)]);
        assert_eq!((mat.nrows(), mat.ncols()), (3, 4));
        assert_eq!(mat.row(0), (&[0_u32, 3][..], &[2.0, 5.0][..]));
        assert_eq!(mat.row(1).0.len(), 0);
        assert_eq!(mat.row_sums(), vec![7.0, 0.0, 1.0]);
    }

    #[test]
    fn test_slice_rows() {
        let mat = CountMatrix::from_rows(vec![vec![(0, 1.0)], vec![(1, 2.0), (2, 3.0)], vec![(2, 4.0)]], 3);
        let sub = mat.slice_rows(1, 3);
        assert_eq!(sub.to_dense(), array![[0.0, 2.0, 3.0], [0.0, 0.0, 4.0]]);
    }

    #[test]
    fn test_weighted_column_sums_matches_dense() {
        let mat = CountMatrix::from_rows(vec![vec![(0, 1.0), (2, 2.0)], vec![(1, 3.0)]], 3);
        let w = array![[0.25, 0.75], [1.0, 0.0]];
        let expected = w.t().dot(&mat.to_dense());
        assert_eq!(mat.weighted_column_sums(w.view()), expected);
    }
}
