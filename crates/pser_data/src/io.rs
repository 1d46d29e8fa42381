//! Reading pattern series from NumPy archives.

use std::path::Path;

use ndarray::{Array1, Array2, Array3};

use crate::dataset::{ImputationDataset, LabeledDataset};
use crate::error::{DataError, Result};
use pser_core::Seed;

/// Read a pattern-series archive.
///
/// Expects `x` with shape `(N, L, F)` and optionally `y` with shape
/// `(N, n_outputs)`. `f64` arrays are converted to `f32`.
pub fn read_npz<P: AsRef<Path>>(path: P) -> Result<(Array3<f32>, Option<Array2<f32>>)> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut npz = ndarray_npy::NpzReader::new(file)
        .map_err(|e| DataError::FormatError(format!("Failed to read npz file: {e}")))?;

    let x_f32: std::result::Result<Array3<f32>, _> = npz.by_name("x");
    let x = match x_f32 {
        Ok(x) => x,
        Err(_) => {
            let x_f64: Array3<f64> = npz
                .by_name("x")
                .map_err(|e| DataError::FormatError(format!("Failed to read 'x' from npz: {e}")))?;
            x_f64.mapv(|v| v as f32)
        }
    };

    let y_f32: std::result::Result<Array2<f32>, _> = npz.by_name("y");
    let y = match y_f32 {
        Ok(y) => Some(y),
        Err(_) => {
            let y_f64: Option<Array2<f64>> = npz.by_name("y").ok();
            y_f64.map(|y| y.mapv(|v| v as f32))
        }
    };

    Ok((x, y))
}

/// Optional per-sample valid lengths stored under `lengths`.
fn read_lengths<P: AsRef<Path>>(path: P) -> Result<Option<Vec<usize>>> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut npz = ndarray_npy::NpzReader::new(file)
        .map_err(|e| DataError::FormatError(format!("Failed to read npz file: {e}")))?;
    let lengths: Option<Array1<i64>> = npz.by_name("lengths").ok();
    Ok(lengths.map(|l| l.iter().map(|&v| v.max(0) as usize).collect()))
}

/// Load a labelled dataset from an archive with `x`, `y` and optional `lengths`.
pub fn load_labeled<P: AsRef<Path>>(path: P) -> Result<LabeledDataset> {
    let (x, y) = read_npz(path.as_ref())?;
    let y = y.ok_or_else(|| {
        DataError::FormatError(format!("'{}' has no 'y' array", path.as_ref().display()))
    })?;
    let dataset = LabeledDataset::from_arrays(x, y)?;
    match read_lengths(path)? {
        Some(lengths) => dataset.with_lengths(lengths),
        None => Ok(dataset),
    }
}

/// Load a masked-reconstruction dataset from an archive with `x` and optional `lengths`.
pub fn load_imputation<P: AsRef<Path>>(
    path: P,
    masking_ratio: f64,
    seed: Seed,
) -> Result<ImputationDataset> {
    let (x, _) = read_npz(path.as_ref())?;
    let dataset = ImputationDataset::new(x, masking_ratio, seed)?;
    match read_lengths(path)? {
        Some(lengths) => dataset.with_lengths(lengths),
        None => Ok(dataset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SeriesDataset;
    use ndarray_npy::NpzWriter;

    #[test]
    fn test_load_labeled_with_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.npz");

        let mut npz = NpzWriter::new(std::fs::File::create(&path).unwrap());
        npz.add_array("x", &Array3::<f32>::ones((3, 5, 2))).unwrap();
        npz.add_array("y", &Array2::<f32>::zeros((3, 1))).unwrap();
        npz.add_array("lengths", &Array1::from_vec(vec![5i64, 2, 4])).unwrap();
        npz.finish().unwrap();

        let ds = load_labeled(&path).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.feat_dim(), 2);
        assert_eq!(ds.get(1).unwrap().x.nrows(), 2);
    }

    #[test]
    fn test_missing_labels_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unlabeled.npz");

        let mut npz = NpzWriter::new(std::fs::File::create(&path).unwrap());
        npz.add_array("x", &Array3::<f64>::zeros((2, 3, 1))).unwrap();
        npz.finish().unwrap();

        assert!(matches!(load_labeled(&path), Err(DataError::FormatError(_))));
        let ds = load_imputation(&path, 0.2, Seed::new(1)).unwrap();
        assert_eq!(ds.len(), 2);
    }
}
