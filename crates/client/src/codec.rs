//! Conversion between stored bytes and decoded values.
//!
//! The coordinator treats decoding as opaque: bytes fetched from the network
//! or read from disk go through [`Codec::decode`], and decoded values are
//! written back to disk through [`Codec::encode`]. [`Codec::size_of`] is the
//! memory tier's size measure.

use bytes::Bytes;
use pixcache_core::Error;

pub trait Codec: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, Error>;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, Error>;

    /// Memory accounted to `value`. Must not change while it is cached.
    fn size_of(&self, value: &Self::Value) -> usize;
}

/// Stores payloads exactly as fetched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Value = Bytes;

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn encode(&self, value: &Bytes) -> Result<Vec<u8>, Error> {
        Ok(value.to_vec())
    }

    fn size_of(&self, value: &Bytes) -> usize {
        value.len()
    }
}

#[cfg(feature = "image")]
pub use self::image_codec::ImageCodec;

#[cfg(feature = "image")]
mod image_codec {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat};
    use pixcache_core::Error;

    use super::Codec;

    /// Decodes any supported format to pixels; stores JPEG on disk.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ImageCodec;

    impl Codec for ImageCodec {
        type Value = DynamicImage;

        fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, Error> {
            image::load_from_memory(bytes).map_err(|e| Error::DecodeFailed(format!("image decode error: {e}")))
        }

        fn encode(&self, value: &DynamicImage) -> Result<Vec<u8>, Error> {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(value.to_rgb8());
            let mut buffer = Cursor::new(Vec::new());
            rgb.write_to(&mut buffer, ImageFormat::Jpeg)
                .map_err(|e| Error::DecodeFailed(format!("image encode error: {e}")))?;
            Ok(buffer.into_inner())
        }

        fn size_of(&self, value: &DynamicImage) -> usize {
            value.as_bytes().len()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use image::{Rgb, RgbImage};

        fn gradient_png() -> Vec<u8> {
            let img = RgbImage::from_fn(16, 8, |x, y| Rgb([(x * 16) as u8, (y * 32) as u8, 128]));
            let mut buffer = Cursor::new(Vec::new());
            img.write_to(&mut buffer, ImageFormat::Png).unwrap();
            buffer.into_inner()
        }

        #[test]
        fn test_decode_and_reencode_as_jpeg() {
            let codec = ImageCodec;
            let img = codec.decode(&gradient_png()).unwrap();
            assert_eq!((img.width(), img.height()), (16, 8));
            assert_eq!(codec.size_of(&img), 16 * 8 * 3);

            let jpeg = codec.encode(&img).unwrap();
            assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
            assert_eq!(codec.decode(&jpeg).unwrap().width(), 16);
        }

        #[test]
        fn test_decode_garbage_fails() {
            assert!(matches!(ImageCodec.decode(b"not an image"), Err(Error::DecodeFailed(_))));
        }
    }
}
