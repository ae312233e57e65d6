//! Face box annotation: draws recognition results onto a copy of the image.

use image::{Rgb, RgbImage};
use rollcall_core::BoundingBox;
use std::path::Path;

/// Outline colour for a recognised face.
pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
/// Outline colour for an unknown face.
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);

const DEFAULT_THICKNESS: u32 = 2;

/// One box to draw.
#[derive(Debug, Clone, Copy)]
pub struct FaceMark {
    pub bounding_box: BoundingBox,
    pub matched: bool,
}

/// Draw a rectangle outline for each mark, clipped to the image.
pub fn draw_boxes(img: &mut RgbImage, marks: &[FaceMark], thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    for mark in marks {
        let b = mark.bounding_box.clamp_to(w, h);
        let color = if mark.matched { MATCHED_COLOR } else { UNKNOWN_COLOR };

        for t in 0..thickness {
            // Horizontal edges, growing inward.
            for y in [b.top.saturating_add(t), b.bottom.saturating_sub(t)] {
                if y < h {
                    for x in b.left..=b.right {
                        img.put_pixel(x, y, color);
                    }
                }
            }
            // Vertical edges.
            for x in [b.left.saturating_add(t), b.right.saturating_sub(t)] {
                if x < w {
                    for y in b.top..=b.bottom {
                        img.put_pixel(x, y, color);
                    }
                }
            }
        }
    }
}

/// Load `src`, draw `marks`, and write the result to `dst` (format from its extension).
pub fn annotate_file(
    src: &Path,
    dst: &Path,
    marks: &[FaceMark],
) -> Result<(), image::ImageError> {
    let mut img = image::open(src)?.to_rgb8();
    draw_boxes(&mut img, marks, DEFAULT_THICKNESS);
    img.save(dst)?;
    tracing::debug!(
        src = %src.display(),
        dst = %dst.display(),
        boxes = marks.len(),
        "annotated image written"
    );
    Ok(())
}
