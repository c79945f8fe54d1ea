use std::io::Cursor;

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::{AnimationDecoder, DynamicImage, ImageResult};

use super::{CleanMode, CleanOptions, CleanedImage, MetadataCategory, preview};
use crate::error::{MetadataWarning, StripError};
use crate::format::FormatKind;

const JPEG_QUALITY: u8 = 95;

/// Re-encode every frame of an animated GIF, looping forever.
fn reencode_animation(data: &[u8], out: &mut Cursor<Vec<u8>>) -> ImageResult<()> {
    let frames = GifDecoder::new(Cursor::new(data))?.into_frames().collect_frames()?;
    let mut encoder = GifEncoder::new(out);
    encoder.set_repeat(Repeat::Infinite)?;
    encoder.encode_frames(frames)
}

/// Decode the pixels and write them out again in the same format.
///
/// Encoders write no metadata at all, so every category that was present is
/// gone afterwards, including ones the caller asked to keep; those are
/// reported as warnings. Animated GIFs keep every frame and their timing;
/// other animations have no encoder here and are refused.
pub(super) fn reencode(data: &[u8], format: FormatKind, options: CleanOptions) -> Result<CleanedImage, StripError> {
    let Some(image_format) = format.image_format() else {
        return Err(StripError::decode(
            format,
            "container cannot be edited in place and no codec is available to re-encode it",
        ));
    };
    let before = preview(data, format)?;
    let mut out = Cursor::new(Vec::new());

    if before.frames > 1 {
        if format != FormatKind::Gif {
            return Err(StripError::decode(
                format,
                format!("{} frames would be flattened by re-encoding", before.frames),
            ));
        }
        reencode_animation(data, &mut out)
            .map_err(|e| StripError::decode(format, format!("re-encoding failed: {e}")))?;
        return Ok(finish(out.into_inner(), before.present(), options));
    }

    let mut reader = image::ImageReader::new(Cursor::new(data));
    reader.set_format(image_format);
    let img = reader
        .decode()
        .map_err(|e| StripError::decode(format, e.to_string()))?;

    let encoded = match format {
        FormatKind::Jpeg => JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&img.to_rgb8()),
        // GIF and the lossless WebP encoder only take 8-bit RGBA.
        FormatKind::Gif | FormatKind::WebP => DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut out, image_format),
        _ => img.write_to(&mut out, image_format),
    };
    encoded.map_err(|e| StripError::decode(format, format!("re-encoding failed: {e}")))?;

    Ok(finish(out.into_inner(), before.present(), options))
}

fn finish(bytes: Vec<u8>, removed: Vec<MetadataCategory>, options: CleanOptions) -> CleanedImage {
    let targets = options.targets();
    let warnings = removed
        .iter()
        .filter(|c| !targets.contains(*c))
        .map(|&c| MetadataWarning::new(c, format!("{} was not preserved by re-encoding", c.label())))
        .collect();

    CleanedImage {
        bytes,
        mode: CleanMode::LossyFallback,
        removed,
        warnings,
    }
}
