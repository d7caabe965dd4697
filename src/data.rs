use std::fs::File;
use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{
            vision::{MnistDataset, MnistItem},
            Dataset, InMemDataset,
        },
    },
    tensor::{backend::Backend, Data, Shape, Tensor},
};
use ndarray::{Array1, Array3, Axis};
use ndarray_npy::NpzReader;
use thiserror::Error;

/// Source images are 28x28 grayscale.
pub const IMAGE_DIM: usize = 28;
/// Width of a flattened image row, fixed by the model architecture.
pub const FLAT_DIM: usize = IMAGE_DIM * IMAGE_DIM;
/// Number of digit classes.
pub const NUM_CLASSES: usize = 10;

/// Errors raised while loading training or prediction data.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown file extension '{}'", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse csv input: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to parse json input: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to read npz archive: {0}")]
    Npz(#[from] ndarray_npy::ReadNpzError),
    #[error("invalid numeric value in tabular input: {0}")]
    Number(#[from] std::num::ParseFloatError),
    #[error("incompatible array shape: {0}")]
    ArrayShape(#[from] ndarray::ShapeError),
    #[error("input holds {got} values, expected {expected}")]
    UnexpectedSize { expected: usize, got: usize },
    #[error("dataset archive split holds {images} images but {labels} labels")]
    SplitMismatch { images: usize, labels: usize },
}

/// Flattens a 28x28 pixel grid into a 784-wide row scaled to [0, 1].
pub fn flatten_normalize(image: &[[f32; IMAGE_DIM]; IMAGE_DIM]) -> Vec<f32> {
    let mut row = Vec::with_capacity(FLAT_DIM);
    for line in image.iter() {
        for pixel in line.iter() {
            row.push(pixel / 255.0);
        }
    }
    row
}

/// One-hot encodes a digit label into a row of `NUM_CLASSES` floats.
pub fn one_hot(label: u8) -> Vec<f32> {
    debug_assert!((label as usize) < NUM_CLASSES, "label out of range: {label}");
    let mut row = vec![0.0; NUM_CLASSES];
    row[label as usize] = 1.0;
    row
}

#[derive(Clone)]
pub struct MnistBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> MnistBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// A batch of flattened images with one-hot targets.
#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    pub images: Tensor<B, 2>,
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> Batcher<MnistItem, MnistBatch<B>> for MnistBatcher<B> {
    fn batch(&self, items: Vec<MnistItem>) -> MnistBatch<B> {
        let images = items
            .iter()
            .map(|item| Data::new(flatten_normalize(&item.image), Shape::new([1, FLAT_DIM])))
            .map(|data| Tensor::<B, 2>::from_data(data.convert(), &self.device))
            .collect();

        let targets = items
            .iter()
            .map(|item| Data::new(one_hot(item.label), Shape::new([1, NUM_CLASSES])))
            .map(|data| Tensor::<B, 2>::from_data(data.convert(), &self.device))
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        MnistBatch { images, targets }
    }
}

/// Where a dataset split comes from: the bundled downloader or a local
/// `.npz` dataset archive holding `x_train`/`y_train`/`x_test`/`y_test`.
pub enum MnistSource {
    Bundled(MnistDataset),
    Archive(InMemDataset<MnistItem>),
}

impl MnistSource {
    pub fn train(data_path: Option<&Path>) -> Result<Self, DataError> {
        match data_path {
            None => Ok(Self::Bundled(MnistDataset::train())),
            Some(path) => Ok(Self::Archive(load_archive_split(
                path, "x_train", "y_train",
            )?)),
        }
    }

    pub fn test(data_path: Option<&Path>) -> Result<Self, DataError> {
        match data_path {
            None => Ok(Self::Bundled(MnistDataset::test())),
            Some(path) => Ok(Self::Archive(load_archive_split(path, "x_test", "y_test")?)),
        }
    }
}

impl Dataset<MnistItem> for MnistSource {
    fn get(&self, index: usize) -> Option<MnistItem> {
        match self {
            Self::Bundled(dataset) => dataset.get(index),
            Self::Archive(dataset) => dataset.get(index),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Bundled(dataset) => dataset.len(),
            Self::Archive(dataset) => dataset.len(),
        }
    }
}

/// Reads one split out of an `.npz` dataset archive. Images are stored as a
/// rank-3 u8 array, labels as a rank-1 u8 array.
fn load_archive_split(
    path: &Path,
    images_name: &str,
    labels_name: &str,
) -> Result<InMemDataset<MnistItem>, DataError> {
    let mut archive = NpzReader::new(File::open(path)?)?;
    let images: Array3<u8> = archive.by_name(&format!("{images_name}.npy"))?;
    let labels: Array1<u8> = archive.by_name(&format!("{labels_name}.npy"))?;

    if images.len_of(Axis(0)) != labels.len() {
        return Err(DataError::SplitMismatch {
            images: images.len_of(Axis(0)),
            labels: labels.len(),
        });
    }

    let items = images
        .axis_iter(Axis(0))
        .zip(labels.iter())
        .map(|(view, &label)| {
            let mut image = [[0f32; IMAGE_DIM]; IMAGE_DIM];
            for ((y, x), &pixel) in view.indexed_iter() {
                image[y][x] = pixel as f32;
            }
            MnistItem { image, label }
        })
        .collect();

    Ok(InMemDataset::new(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    fn item(label: u8, pixel: f32) -> MnistItem {
        MnistItem {
            image: [[pixel; IMAGE_DIM]; IMAGE_DIM],
            label,
        }
    }

    #[test]
    fn one_hot_covers_every_label() {
        for label in 0..NUM_CLASSES as u8 {
            let row = one_hot(label);
            assert_eq!(row.len(), NUM_CLASSES);
            assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
            assert_eq!(row.iter().filter(|&&v| v == 0.0).count(), NUM_CLASSES - 1);
            assert_eq!(row[label as usize], 1.0);
        }
    }

    #[test]
    fn flatten_normalize_scales_into_unit_range() {
        let mut image = [[0f32; IMAGE_DIM]; IMAGE_DIM];
        image[0][0] = 255.0;
        image[13][7] = 128.0;

        let row = flatten_normalize(&image);

        assert_eq!(row.len(), FLAT_DIM);
        assert!(row.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(row[0], 1.0);
    }

    #[test]
    fn flatten_normalize_width_holds_across_counts() {
        let image = [[37.0f32; IMAGE_DIM]; IMAGE_DIM];
        for count in [1usize, 64, 10_000] {
            let rows: Vec<Vec<f32>> = (0..count).map(|_| flatten_normalize(&image)).collect();
            assert_eq!(rows.len(), count);
            assert!(rows.iter().all(|row| row.len() == FLAT_DIM));
            assert!(rows[count / 2].iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn batcher_produces_expected_shapes() {
        let batcher = MnistBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(vec![item(3, 255.0), item(7, 0.0)]);

        assert_eq!(batch.images.dims(), [2, FLAT_DIM]);
        assert_eq!(batch.targets.dims(), [2, NUM_CLASSES]);

        let images: Vec<f32> = batch.images.into_data().value;
        assert!(images.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let targets: Vec<f32> = batch.targets.into_data().value;
        assert_eq!(targets[3], 1.0);
        assert_eq!(targets[NUM_CLASSES + 7], 1.0);
    }
}
