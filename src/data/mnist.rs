//! MNIST / FashionMNIST in IDX format.
//!
//! ```text
//! images  [magic 0x00000803: u32 BE] [count: u32] [rows: u32] [cols: u32] [count×rows×cols u8]
//! labels  [magic 0x00000801: u32 BE] [count: u32] [count u8]
//! ```

use std::fs;
use std::path::Path;

use super::Dataset;
use crate::core::{TPError, TPResult};

pub const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
pub const IDX_LABELS_MAGIC: u32 = 0x0000_0801;
pub const MNIST_NUM_CLASSES: usize = 10;

fn read_u32(data: &[u8], offset: usize) -> TPResult<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| TPError::Dataset("truncated IDX header".into()))
}

/// Decode an IDX image file into pixels scaled to \[0, 1\] and the image size.
pub fn decode_idx_images(data: &[u8]) -> TPResult<(Vec<f32>, usize)> {
    let magic = read_u32(data, 0)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(TPError::Dataset(format!("bad IDX image magic {magic:#010x}")));
    }
    let count = read_u32(data, 4)? as usize;
    let image_dim = read_u32(data, 8)? as usize * read_u32(data, 12)? as usize;
    let body = &data[16..];
    if body.len() != count * image_dim {
        return Err(TPError::Dataset(format!(
            "IDX image payload {} bytes, header says {count}×{image_dim}",
            body.len()
        )));
    }
    Ok((body.iter().map(|&b| f32::from(b) / 255.0).collect(), image_dim))
}

pub fn decode_idx_labels(data: &[u8]) -> TPResult<Vec<usize>> {
    let magic = read_u32(data, 0)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(TPError::Dataset(format!("bad IDX label magic {magic:#010x}")));
    }
    let count = read_u32(data, 4)? as usize;
    let body = &data[8..];
    if body.len() != count {
        return Err(TPError::Dataset(format!(
            "IDX label payload {} bytes, header says {count}",
            body.len()
        )));
    }
    Ok(body.iter().map(|&b| usize::from(b)).collect())
}

/// Load one split: `prefix` is `train` or `t10k`.
pub fn load_idx_split(data_dir: &Path, prefix: &str) -> TPResult<Dataset> {
    let read = |name: String| {
        let path = data_dir.join(name);
        fs::read(&path).map_err(|e| TPError::Dataset(format!("{}: {e}", path.display())))
    };
    let (pixels, image_dim) = decode_idx_images(&read(format!("{prefix}-images-idx3-ubyte"))?)?;
    let labels = decode_idx_labels(&read(format!("{prefix}-labels-idx1-ubyte"))?)?;
    if let Some(bad) = labels.iter().find(|&&l| l >= MNIST_NUM_CLASSES) {
        return Err(TPError::Dataset(format!("label {bad} out of range")));
    }
    Dataset::from_flat(pixels, labels, image_dim, MNIST_NUM_CLASSES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, fill: u8) -> Vec<u8> {
        let mut data = Vec::new();
        for v in [IDX_IMAGES_MAGIC, count, rows, cols] {
            data.extend(v.to_be_bytes());
        }
        data.extend(std::iter::repeat(fill).take((count * rows * cols) as usize));
        data
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(IDX_LABELS_MAGIC.to_be_bytes());
        data.extend((labels.len() as u32).to_be_bytes());
        data.extend(labels);
        data
    }

    #[test]
    fn test_decode_images() {
        let (pixels, dim) = decode_idx_images(&idx_images(2, 2, 3, 255)).unwrap();
        assert_eq!(dim, 6);
        assert_eq!(pixels.len(), 12);
        assert!(pixels.iter().all(|&p| p == 1.0));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut data = idx_images(1, 2, 2, 0);
        assert!(decode_idx_labels(&data).is_err());
        data.pop();
        assert!(decode_idx_images(&data).is_err());
        assert!(decode_idx_images(&[0, 0]).is_err());
    }

    #[test]
    fn test_load_split_from_disk() {
        let dir = std::env::temp_dir().join("targetprop_test_idx");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("t10k-images-idx3-ubyte"), idx_images(3, 2, 2, 0)).unwrap();
        fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[7, 0, 9])).unwrap();

        let ds = load_idx_split(&dir, "t10k").unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.images.shape(), &[3, 4]);
        assert_eq!(ds.labels, vec![7, 0, 9]);

        fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[7, 0])).unwrap();
        assert!(load_idx_split(&dir, "t10k").is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
