//! Image contract and file helpers.
//!
//! An [`Image`] is a `(height, width, 3)` array of `u8`: row-major, height
//! then width, with interleaved RGB channels. There is no alpha channel and
//! no other element type. Construction is the validation step; anything
//! that does not fit the contract is rejected, never coerced.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, RgbImage};

/// Number of color channels every image carries.
pub const CHANNELS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid image rank: expected 3 dimensions, got {0}")]
    InvalidRank(usize),

    #[error("invalid image channel count: expected 3, got {0}")]
    InvalidChannels(usize),

    #[error("invalid image element type: expected 8-bit RGB, got {0}")]
    InvalidElementType(String),

    #[error("image has zero extent ({height}x{width})")]
    Empty { height: usize, width: usize },

    #[error("buffer of {got} bytes does not match shape ({height}, {width}, 3)")]
    LengthMismatch {
        height: usize,
        width: usize,
        got: usize,
    },

    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// A validated RGB8 image.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    height: usize,
    width: usize,
    data: Vec<u8>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("height", &self.height)
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Build an image from a raw buffer and its array shape.
    ///
    /// `shape` must be `[height, width, 3]` and `data.len()` must equal
    /// `height * width * 3`.
    pub fn from_shape(shape: &[usize], data: Vec<u8>) -> Result<Self, ImageError> {
        let [height, width, channels] = match shape {
            [h, w, c] => [*h, *w, *c],
            other => return Err(ImageError::InvalidRank(other.len())),
        };

        if channels != CHANNELS {
            return Err(ImageError::InvalidChannels(channels));
        }

        if height == 0 || width == 0 {
            return Err(ImageError::Empty { height, width });
        }

        let expected = height
            .checked_mul(width)
            .and_then(|n| n.checked_mul(CHANNELS));
        if expected != Some(data.len()) {
            return Err(ImageError::LengthMismatch {
                height,
                width,
                got: data.len(),
            });
        }

        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// Build an image from a decoded [`DynamicImage`].
    ///
    /// Only 8-bit RGB layouts are accepted.
    pub fn from_dynamic(img: DynamicImage) -> Result<Self, ImageError> {
        match img {
            DynamicImage::ImageRgb8(buf) => Self::from_rgb(buf),
            other => {
                let color = other.color();
                let channels = color.channel_count() as usize;
                if channels != CHANNELS {
                    Err(ImageError::InvalidChannels(channels))
                } else {
                    Err(ImageError::InvalidElementType(format!("{color:?}")))
                }
            }
        }
    }

    pub fn from_rgb(buf: RgbImage) -> Result<Self, ImageError> {
        let (width, height) = buf.dimensions();
        Self::from_shape(
            &[height as usize, width as usize, CHANNELS],
            buf.into_raw(),
        )
    }

    /// Decode an encoded image (PNG, JPEG, ...) that must already be RGB8.
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        Self::from_dynamic(image::load_from_memory(bytes)?)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Array shape as `[height, width, channels]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, CHANNELS]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width as u32, self.height as u32, self.data.clone())
            .expect("buffer length is checked at construction")
    }

    /// Encode as PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, ImageError> {
        let mut buf = Vec::new();
        self.to_rgb_image()
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }
}

/// Load an image file from disk.
///
/// The file is decoded and flattened to RGB8 like a regular image reader
/// would; alpha is dropped and grayscale is expanded.
pub fn load_image(path: &Path) -> Result<Image, ImageError> {
    let img = image::open(path)?;
    Image::from_rgb(img.into_rgb8())
}

/// Whether `path` has an extension of a format the decoder understands.
pub fn is_image_file(path: &Path) -> bool {
    path.is_file() && ImageFormat::from_path(path).is_ok()
}
