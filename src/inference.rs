use std::fs::File;
use std::path::Path;

use burn::{
    data::dataset::Dataset,
    tensor::{backend::Backend, Data, Shape, Tensor},
};
use ndarray::Array3;
use ndarray_npy::NpzReader;
use serde::Deserialize;

use crate::data::{flatten_normalize, DataError, MnistSource, FLAT_DIM};

/// Row count assumed for `.npz` prediction archives (the test split size).
const NPZ_ROWS: usize = 10_000;

/// A prediction input: `rows` flattened feature vectors of width `cols`.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionInput {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
}

impl PredictionInput {
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let data = Data::new(self.values.clone(), Shape::new([self.rows, self.cols]));
        Tensor::from_data(data.convert(), device)
    }
}

/// Tabular records in the split orientation: column names, row index, and
/// row-major data.
#[derive(Debug, Deserialize)]
struct SplitRecords {
    #[allow(dead_code)]
    columns: Vec<String>,
    #[allow(dead_code)]
    index: Option<Vec<i64>>,
    data: Vec<Vec<f32>>,
}

/// Loads prediction input, selecting a parser by file suffix. Without a
/// path the bundled test split is used. Unknown suffixes fail with an error
/// naming the path.
pub fn load_prediction_data(path: Option<&Path>) -> Result<PredictionInput, DataError> {
    let path = match path {
        None => return test_split_input(),
        Some(path) => path,
    };

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => read_json(path),
        Some("csv") => read_csv(path),
        Some("npz") => read_npz(path),
        Some("png") => read_png(path),
        _ => Err(DataError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn test_split_input() -> Result<PredictionInput, DataError> {
    let dataset = MnistSource::test(None)?;
    let rows = dataset.len();
    let mut values = Vec::with_capacity(rows * FLAT_DIM);
    for index in 0..rows {
        let item = dataset.get(index).expect("index is within the dataset");
        values.extend(flatten_normalize(&item.image));
    }
    Ok(PredictionInput {
        rows,
        cols: FLAT_DIM,
        values,
    })
}

fn read_json(path: &Path) -> Result<PredictionInput, DataError> {
    let records: SplitRecords = serde_json::from_reader(File::open(path)?)?;
    let rows = records.data.len();
    let cols = records.data.first().map_or(0, Vec::len);
    // Every row must match the first row's width.
    for row in &records.data {
        if row.len() != cols {
            return Err(DataError::UnexpectedSize {
                expected: cols,
                got: row.len(),
            });
        }
    }
    let values = records.data.into_iter().flatten().collect();
    Ok(PredictionInput { rows, cols, values })
}

fn read_csv(path: &Path) -> Result<PredictionInput, DataError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut values = Vec::new();
    let mut rows = 0;
    let mut cols = 0;
    for record in reader.records() {
        let record = record?;
        cols = record.len();
        for field in record.iter() {
            values.push(field.trim().parse::<f32>()?);
        }
        rows += 1;
    }
    Ok(PredictionInput { rows, cols, values })
}

fn read_npz(path: &Path) -> Result<PredictionInput, DataError> {
    let mut archive = NpzReader::new(File::open(path)?)?;
    let images: Array3<u8> = archive.by_name("x_test.npy")?;

    // The archive is assumed to hold the full test split.
    let scaled = images.mapv(|pixel| f32::from(pixel) / 255.0);
    let flat = scaled.into_shape_with_order((NPZ_ROWS, FLAT_DIM))?;
    let values = flat.iter().copied().collect();

    Ok(PredictionInput {
        rows: NPZ_ROWS,
        cols: FLAT_DIM,
        values,
    })
}

fn read_png(path: &Path) -> Result<PredictionInput, DataError> {
    let image = image::open(path)?.into_luma8();
    let pixels = image.into_raw();
    if pixels.len() != FLAT_DIM {
        return Err(DataError::UnexpectedSize {
            expected: FLAT_DIM,
            got: pixels.len(),
        });
    }

    // Raw pixel values are passed through unscaled, like the tabular readers.
    Ok(PredictionInput {
        rows: 1,
        cols: FLAT_DIM,
        values: pixels.into_iter().map(f32::from).collect(),
    })
}

/// Formats the first `limit` prediction rows for console output.
pub fn preview(input_rows: usize, cols: usize, values: &[f32], limit: usize) -> String {
    let mut lines = vec![format!("predictions: shape [{input_rows}, {cols}]")];
    for row in values.chunks(cols).take(limit) {
        let fields: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
        lines.push(format!("  [{}]", fields.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::IMAGE_DIM;
    use ndarray::Array1;
    use ndarray_npy::NpzWriter;
    use std::io::Write;

    #[test]
    fn unsupported_extension_error_names_the_path() {
        let err = load_prediction_data(Some(Path::new("x.tsv"))).unwrap_err();
        assert!(matches!(err, DataError::UnsupportedFormat(_)));
        assert!(err.to_string().contains("x.tsv"));
    }

    #[test]
    fn csv_rows_are_parsed_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "a,b,c").unwrap();
        writeln!(file, "0.0,0.5,1.0").unwrap();
        writeln!(file, "1.0,0.25,0.0").unwrap();

        let input = load_prediction_data(Some(&path)).unwrap();
        assert_eq!((input.rows, input.cols), (2, 3));
        assert_eq!(input.values, vec![0.0, 0.5, 1.0, 1.0, 0.25, 0.0]);
    }

    #[test]
    fn json_split_records_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        std::fs::write(
            &path,
            r#"{"columns":["p0","p1"],"index":[0,1],"data":[[0.1,0.2],[0.3,0.4]]}"#,
        )
        .unwrap();

        let input = load_prediction_data(Some(&path)).unwrap();
        assert_eq!((input.rows, input.cols), (2, 2));
        assert_eq!(input.values, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn ragged_json_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        std::fs::write(
            &path,
            r#"{"columns":["p0","p1"],"index":[0,1],"data":[[0.1,0.2],[0.3]]}"#,
        )
        .unwrap();

        let err = load_prediction_data(Some(&path)).unwrap_err();
        assert!(matches!(
            err,
            DataError::UnexpectedSize {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn png_becomes_one_unscaled_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        let image = image::GrayImage::from_fn(IMAGE_DIM as u32, IMAGE_DIM as u32, |x, y| {
            image::Luma([((x + y) % 256) as u8])
        });
        image.save(&path).unwrap();

        let input = load_prediction_data(Some(&path)).unwrap();
        assert_eq!((input.rows, input.cols), (1, FLAT_DIM));
        assert_eq!(input.values[0], 0.0);
        assert_eq!(input.values[1], 1.0);
    }

    #[test]
    fn npz_test_array_is_reshaped_and_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.npz");
        let images = Array3::<u8>::from_elem((NPZ_ROWS, IMAGE_DIM, IMAGE_DIM), 255);
        let labels = Array1::<u8>::zeros(NPZ_ROWS);
        let mut writer = NpzWriter::new(File::create(&path).unwrap());
        writer.add_array("x_test", &images).unwrap();
        writer.add_array("y_test", &labels).unwrap();
        writer.finish().unwrap();

        let input = load_prediction_data(Some(&path)).unwrap();
        assert_eq!((input.rows, input.cols), (NPZ_ROWS, FLAT_DIM));
        assert!(input.values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn preview_limits_rows_and_reports_shape() {
        let values = vec![0.25; 30];
        let text = preview(3, 10, &values, 2);

        assert!(text.starts_with("predictions: shape [3, 10]"));
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("0.250000"));
    }
}
