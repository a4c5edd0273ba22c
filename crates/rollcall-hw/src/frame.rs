//! Frame type and pixel conversion: YUYV/GREY to RGB, dark-frame detection.

use image::{Rgb, RgbImage};

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// True when more than `threshold_pct` of pixels have luma below 32.
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        is_dark_image(&self.image, threshold_pct)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr to RGB.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> Rgb<u8> {
    let c = y as i32 - 16;
    let d = cb as i32 - 128;
    let e = cr as i32 - 128;
    let clamp = |v: i32| (v >> 8).clamp(0, 255) as u8;
    Rgb([
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ])
}

/// Convert packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to RGB.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    check_len(yuyv, (width * height * 2) as usize)?;
    let mut img = RgbImage::new(width, height);
    for (pair, out) in yuyv.chunks_exact(4).zip(img.chunks_exact_mut(6)) {
        let (y0, u, y1, v) = (pair[0], pair[1], pair[2], pair[3]);
        out[..3].copy_from_slice(&ycbcr_to_rgb(y0, u, v).0);
        out[3..].copy_from_slice(&ycbcr_to_rgb(y1, u, v).0);
    }
    Ok(img)
}

/// Replicate an 8-bit grayscale buffer into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(grey, pixels)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = grey[(y * width + x) as usize];
        Rgb([v, v, v])
    }))
}

/// Decode one MJPEG buffer.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)?.into_rgb8())
}

/// Dark-frame check on integer luma.
pub fn is_dark_image(img: &RgbImage, threshold_pct: f32) -> bool {
    let total = img.width() as usize * img.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = img
        .pixels()
        .filter(|p| {
            let [r, g, b] = p.0;
            (r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8 < 32
        })
        .count();
    (dark as f32 / total as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_white_and_black() {
        // Pair 1: Y=235 (white), pair 2: Y=16 (black), neutral chroma
        let yuyv = vec![235, 128, 235, 128, 16, 128, 16, 128];
        let img = yuyv_to_rgb(&yuyv, 4, 1).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(*img.get_pixel(1, 0), Rgb([255, 255, 255]));
        assert_eq!(*img.get_pixel(2, 0), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(3, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_yuyv_red_dominant() {
        // High Cr pushes red up and green down
        let img = yuyv_to_rgb(&[128, 128, 128, 240], 2, 1).unwrap();
        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!(r > 200 && g < r && b < r, "got ({r}, {g}, {b})");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_to_rgb() {
        let img = grey_to_rgb(&[10, 20, 30, 40], 2, 2).unwrap();
        assert_eq!(*img.get_pixel(1, 1), Rgb([40, 40, 40]));
        assert!(grey_to_rgb(&[1, 2], 2, 2).is_err());
    }

    #[test]
    fn test_mjpeg_roundtrip_dimensions() {
        let src = RgbImage::from_pixel(16, 8, Rgb([200, 100, 50]));
        let mut jpeg = Vec::new();
        src.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let decoded = mjpeg_to_rgb(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_mjpeg_garbage() {
        assert!(matches!(mjpeg_to_rgb(b"not a jpeg"), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frame() {
        assert!(is_dark_image(&RgbImage::new(10, 10), 0.95));
        assert!(!is_dark_image(&RgbImage::from_pixel(10, 10, Rgb([128, 128, 128])), 0.95));
        assert!(is_dark_image(&RgbImage::new(0, 0), 0.95));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 94% dark, 6% bright: not dark
        let mut img = RgbImage::new(100, 1);
        for x in 94..100 {
            img.put_pixel(x, 0, Rgb([200, 200, 200]));
        }
        assert!(!is_dark_image(&img, 0.95));
    }
}
