//! Face crops cut straight from the bounding box, without alignment.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Side length of the audit crop stored alongside each enrolment.
pub const CANONICAL_CROP_SIZE: u32 = 200;

/// Cut the (clipped) bounding box out of `image`.
///
/// Returns `None` if the box covers less than one pixel.
pub fn crop_region(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let b = bbox.clipped(image.width(), image.height());
    let x = b.x.floor() as u32;
    let y = b.y.floor() as u32;
    let w = ((b.x + b.width).ceil() as u32).min(image.width()).saturating_sub(x);
    let h = ((b.y + b.height).ceil() as u32).min(image.height()).saturating_sub(y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Crop the face and resize it to a `size × size` square for human inspection.
pub fn normalized_crop(image: &RgbImage, bbox: &BoundingBox, size: u32) -> Option<RgbImage> {
    let region = crop_region(image, bbox)?;
    Some(imageops::resize(&region, size, size, FilterType::Triangle))
}
