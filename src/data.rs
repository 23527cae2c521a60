use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::TensorData,
};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

// ////////////////////////////////////////////////////////////////////////////
// Dataset

/// Colour images found under a directory, decoded on access.
#[derive(Debug, Clone)]
pub struct ColorizationDataset {
    paths: Vec<PathBuf>,
    image_size: u32,
}

impl ColorizationDataset {
    pub fn new<P: AsRef<Path>>(root: P, image_size: u32) -> Result<Self> {
        let root = root.as_ref();

        let mut paths = Vec::new();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if let Some(ext) = path.extension() {
                let ext = ext.to_string_lossy().to_lowercase();
                if !matches!(ext.as_str(), "jpg" | "jpeg" | "png") {
                    continue;
                }
                // a failed `get` ends the loader's iteration, so drop broken files up front
                match image::image_dimensions(path) {
                    Ok(_) => paths.push(path.to_path_buf()),
                    Err(err) => tracing::warn!("skipping {}: {err}", path.display()),
                }
            }
        }
        if paths.is_empty() {
            return Err(Error::EmptyDataset(root.to_path_buf()));
        }
        paths.sort();

        tracing::info!("found {} images under {}", paths.len(), root.display());
        Ok(Self { paths, image_size })
    }
}

/// One RGB image, channel-first, values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub size: usize,
}

impl ImageItem {
    pub fn load<P: AsRef<Path>>(path: P, image_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let image = image
            .resize_exact(image_size, image_size, FilterType::Triangle)
            .to_rgb8();

        Ok(Self::from_rgb(&image))
    }

    pub fn from_rgb(image: &image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        assert_eq!(width, height, "images must be square");
        let size = width as usize;
        let plane = size * size;

        let mut pixels = vec![0.0; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * size + x as usize;
            for channel in 0..3 {
                pixels[channel * plane + offset] = f32::from(pixel[channel]) / 255.0;
            }
        }

        Self { pixels, size }
    }
}

impl Dataset<ImageItem> for ColorizationDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let path = self.paths.get(index)?;
        match ImageItem::load(path, self.image_size) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::warn!("skipping unreadable image: {err}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.paths.len()
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Batcher

/// A batch of display-range RGB images, `[batch, 3, height, width]`.
#[derive(Debug, Clone)]
pub struct ColorBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub size: usize,
}

impl<B: Backend> ColorBatch<B> {
    pub fn new(images: Tensor<B, 4>) -> Self {
        let size = images.dims()[0];
        Self { images, size }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColorizationBatcher {}

impl ColorizationBatcher {
    pub fn new() -> Self {
        Self {}
    }
}

impl<B: Backend> Batcher<B, ImageItem, ColorBatch<B>> for ColorizationBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ColorBatch<B> {
        let images = items
            .into_iter()
            .map(|item| {
                let data = TensorData::new(item.pixels, [3, item.size, item.size]);
                Tensor::<B, 3>::from_data(data, device).unsqueeze_dim(0)
            })
            .collect::<Vec<_>>();

        ColorBatch::new(Tensor::cat(images, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use image::{Rgb, RgbImage};

    #[test]
    fn item_is_channel_first_unit_range() {
        let image = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));

        let item = ImageItem::from_rgb(&image);

        assert_eq!(item.size, 2);
        assert_eq!(&item.pixels[0..4], &[1.0; 4]);
        assert_eq!(&item.pixels[4..8], &[0.0; 4]);
        assert!((item.pixels[8] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn dataset_finds_images_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]))
            .save(dir.path().join("a.png"))
            .unwrap();
        RgbImage::from_pixel(12, 6, Rgb([200, 100, 0]))
            .save(dir.path().join("nested/b.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let dataset = ColorizationDataset::new(dir.path(), 4).unwrap();

        assert_eq!(dataset.len(), 2);
        let item = dataset.get(1).unwrap();
        assert_eq!(item.size, 4);
        assert_eq!(item.pixels.len(), 3 * 4 * 4);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = ColorizationDataset::new(dir.path(), 256);

        assert!(matches!(result, Err(Error::EmptyDataset(_))));
    }

    #[test]
    fn batcher_stacks_items() {
        let device = Default::default();
        let items = vec![
            ImageItem::from_rgb(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))),
            ImageItem::from_rgb(&RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]))),
        ];

        let batch: ColorBatch<TestBackend> = ColorizationBatcher::new().batch(items, &device);

        assert_eq!(batch.size, 2);
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
    }
}
