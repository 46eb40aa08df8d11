use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// Gap between the background and object panels never exceeds this; the
/// diffusion model integrates better when the panels are visually adjacent.
const MAX_PANEL_GAP: u32 = 2;

/// Area fraction of the background a general object is scaled toward.
const OBJECT_AREA_FRACTION: f64 = 0.25;

/// Target object height relative to the background for human-likely objects.
const HUMAN_HEIGHT_FRACTION: f64 = 0.70;

const HUMAN_SCALE_RANGE: (f64, f64) = (0.4, 1.5);
const OBJECT_SCALE_RANGE: (f64, f64) = (0.2, 2.5);

/// Each side of a non-human object must cover at least this fraction of the
/// smaller canvas side.
const OBJECT_MIN_SIDE_FRACTION: f64 = 0.2;

/// The single merged image fed to the diffusion runner, plus the layout
/// facts the orchestrator logs.
#[derive(Debug, Clone)]
pub struct ComposedInput {
    pub image: RgbImage,
    pub background_width: u32,
    pub object_width: u32,
    pub gap: u32,
    pub object_human_likely: bool,
}

/// Resize the background to the generation dims. RGBA is flattened onto
/// white first; resizing to the image's own size is a no-op.
pub fn resize_background(background: &DynamicImage, dims: (u32, u32)) -> RgbImage {
    let rgb = flatten_onto_white(background);
    if rgb.dimensions() == dims {
        return rgb;
    }
    imageops::resize(&rgb, dims.0, dims.1, FilterType::Lanczos3)
}

/// Build the side-by-side layout `[ background | gap | object ]` on a white
/// canvas. The composed width exceeds `dims`; the remote payload still
/// requests `dims` as the output size.
pub fn compose_input(
    background: &DynamicImage,
    object: &DynamicImage,
    dims: (u32, u32),
) -> ComposedInput {
    let background = resize_background(background, dims);
    let object = flatten_onto_white(object);
    let human = is_human_likely(&object);

    let (object_w, object_h) = object.dimensions();
    let scale = object_scale(dims, (object_w, object_h), human);
    let scaled_w = ((object_w as f64 * scale).round() as u32).max(1);
    let scaled_h = ((object_h as f64 * scale).round() as u32).max(1);
    let object = imageops::resize(&object, scaled_w, scaled_h, FilterType::Lanczos3);

    // min(2, W/200): zero for backgrounds narrower than 200 px
    let gap = (dims.0 / 200).min(MAX_PANEL_GAP);
    let canvas_w = dims.0 + gap + scaled_w;
    let canvas_h = dims.1.max(scaled_h);
    let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, Rgb([255, 255, 255]));

    let background_y = (canvas_h - dims.1) / 2;
    let object_y = (canvas_h - scaled_h) / 2;
    imageops::replace(&mut canvas, &background, 0, background_y as i64);
    imageops::replace(
        &mut canvas,
        &object,
        (dims.0 + gap) as i64,
        object_y as i64,
    );

    ComposedInput {
        image: canvas,
        background_width: dims.0,
        object_width: scaled_w,
        gap,
        object_human_likely: human,
    }
}

fn object_scale(background: (u32, u32), object: (u32, u32), human: bool) -> f64 {
    let (bg_w, bg_h) = background;
    let (obj_w, obj_h) = object;
    if human {
        let scale = HUMAN_HEIGHT_FRACTION * bg_h as f64 / obj_h as f64;
        return scale.clamp(HUMAN_SCALE_RANGE.0, HUMAN_SCALE_RANGE.1);
    }

    let bg_area = bg_w as f64 * bg_h as f64;
    let obj_area = obj_w as f64 * obj_h as f64;
    let mut scale = (OBJECT_AREA_FRACTION * bg_area / obj_area)
        .sqrt()
        .clamp(OBJECT_SCALE_RANGE.0, OBJECT_SCALE_RANGE.1);

    // The minimum-side rule is a hard floor and may override the clamp
    // ceiling for very small objects.
    let min_side_target = OBJECT_MIN_SIDE_FRACTION * bg_w.min(bg_h) as f64;
    let scaled_min_side = obj_w.min(obj_h) as f64 * scale;
    if scaled_min_side < min_side_target {
        scale = min_side_target / obj_w.min(obj_h) as f64;
    }
    scale
}

/// Heuristic flag for human subjects, which get the larger layout share.
/// Tall aspect plus a skin-tone pixel ratio plus a sane edge density. Known
/// to misfire; it only influences sizing, never correctness.
pub fn is_human_likely(object: &RgbImage) -> bool {
    let (width, height) = object.dimensions();
    if width == 0 || height == 0 {
        return false;
    }
    let aspect = height as f64 / width as f64;
    if aspect <= 1.1 {
        return false;
    }
    let skin = skin_tone_ratio(object);
    let edges = edge_density(object);
    skin > 0.10 && edges > 0.02 && edges < 0.45
}

fn skin_tone_ratio(image: &RgbImage) -> f64 {
    let (width, height) = image.dimensions();
    let step = sample_step(width, height);
    let mut sampled = 0u64;
    let mut skin = 0u64;
    for y in (0..height).step_by(step) {
        for x in (0..width).step_by(step) {
            let Rgb([r, g, b]) = *image.get_pixel(x, y);
            sampled += 1;
            if is_skin_rgb(r, g, b) && is_skin_hsv(r, g, b) {
                skin += 1;
            }
        }
    }
    if sampled == 0 {
        return 0.0;
    }
    skin as f64 / sampled as f64
}

fn is_skin_rgb(r: u8, g: u8, b: u8) -> bool {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    r > 95 && g > 40 && b > 20 && r > g && r > b && max - min > 15 && r - g > 15
}

fn is_skin_hsv(r: u8, g: u8, b: u8) -> bool {
    let r_f = r as f64 / 255.0;
    let g_f = g as f64 / 255.0;
    let b_f = b as f64 / 255.0;
    let max = r_f.max(g_f).max(b_f);
    let min = r_f.min(g_f).min(b_f);
    let delta = max - min;
    if max <= 0.0 || delta <= 0.0 {
        return false;
    }
    let saturation = delta / max;
    // hue only matters in the red-dominant case the RGB rule admits
    let hue = if max == r_f {
        60.0 * ((g_f - b_f) / delta).rem_euclid(6.0)
    } else {
        360.0
    };
    (0.0..=50.0).contains(&hue) && (0.2..=0.7).contains(&saturation) && max > 0.35
}

fn edge_density(image: &RgbImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 2 || height < 2 {
        return 0.0;
    }
    let step = sample_step(width, height);
    let mut sampled = 0u64;
    let mut edges = 0u64;
    for y in (0..height - 1).step_by(step) {
        for x in (0..width - 1).step_by(step) {
            let here = luma(image.get_pixel(x, y));
            let right = luma(image.get_pixel(x + 1, y));
            let below = luma(image.get_pixel(x, y + 1));
            sampled += 1;
            if (here - right).abs() > 40.0 || (here - below).abs() > 40.0 {
                edges += 1;
            }
        }
    }
    if sampled == 0 {
        return 0.0;
    }
    edges as f64 / sampled as f64
}

fn luma(pixel: &Rgb<u8>) -> f64 {
    let Rgb([r, g, b]) = *pixel;
    0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64
}

fn sample_step(width: u32, height: u32) -> usize {
    // keep sampling near 10k pixels regardless of input size
    let pixels = width as u64 * height as u64;
    (((pixels / 10_000) as f64).sqrt().floor() as usize).max(1)
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        DynamicImage::ImageRgba8(rgba) => {
            let mut out = RgbImage::new(rgba.width(), rgba.height());
            for (x, y, pixel) in rgba.enumerate_pixels() {
                let [r, g, b, a] = pixel.0;
                let alpha = a as u16;
                let blend = |channel: u8| -> u8 {
                    ((channel as u16 * alpha + 255 * (255 - alpha)) / 255) as u8
                };
                out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
            }
            out
        }
        other => other.to_rgb8(),
    }
}

/// PNG-encode for wire transfer and result stamping.
pub fn encode_png(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    #[test]
    fn resize_to_own_dims_is_a_no_op() {
        let background = solid(640, 480, [120, 130, 140]);
        let resized = resize_background(&background, (640, 480));
        assert_eq!(resized, background.to_rgb8());
    }

    #[test]
    fn composed_width_is_background_plus_gap_plus_object() {
        let background = solid(800, 600, [40, 90, 140]);
        let object = solid(200, 400, [200, 30, 30]);
        let composed = compose_input(&background, &object, (800, 600));
        assert_eq!(composed.gap, 2);
        assert_eq!(
            composed.image.width(),
            composed.background_width + composed.gap + composed.object_width
        );
        assert_eq!(composed.image.height(), 600);
    }

    #[test]
    fn narrow_background_gets_no_panel_gap() {
        let background = solid(160, 160, [50, 50, 50]);
        let object = solid(40, 40, [200, 30, 30]);
        let composed = compose_input(&background, &object, (160, 160));
        assert_eq!(composed.gap, 0);
        assert_eq!(
            composed.image.width(),
            composed.background_width + composed.object_width
        );
    }

    #[test]
    fn object_aspect_ratio_survives_scaling() {
        let background = solid(800, 600, [40, 90, 140]);
        let object = solid(200, 400, [200, 30, 30]);
        let composed = compose_input(&background, &object, (800, 600));
        let object_height = {
            // recover scaled height from the scale implied by the width
            let scale = composed.object_width as f64 / 200.0;
            (400.0 * scale).round()
        };
        let input_ratio = 200.0 / 400.0;
        let output_ratio = composed.object_width as f64 / object_height;
        assert!((input_ratio - output_ratio).abs() / input_ratio < 1e-3);
    }

    #[test]
    fn tiny_object_is_lifted_to_minimum_side() {
        let background = solid(1000, 1000, [20, 20, 20]);
        let object = solid(50, 50, [10, 200, 10]);
        let composed = compose_input(&background, &object, (1000, 1000));
        // min side target is 20% of the smaller canvas side
        assert!(composed.object_width >= 200);
    }

    #[test]
    fn transparent_object_pixels_flatten_to_white() {
        let mut rgba = image::RgbaImage::from_pixel(64, 160, Rgba([0, 0, 0, 0]));
        for y in 0..160 {
            rgba.put_pixel(32, y, Rgba([255, 0, 0, 255]));
        }
        let background = solid(400, 400, [0, 0, 0]);
        let composed = compose_input(&background, &DynamicImage::ImageRgba8(rgba), (400, 400));
        let corner_x = composed.background_width + composed.gap;
        let corner_y = (composed.image.height() - composed.image.height().min(400)) / 2;
        let pixel = composed.image.get_pixel(corner_x, corner_y.max(0));
        assert_eq!(*pixel, Rgb([255, 255, 255]));
    }

    #[test]
    fn skin_striped_tall_image_reads_human_likely() {
        let mut object = RgbImage::new(80, 120);
        for (x, _y, pixel) in object.enumerate_pixels_mut() {
            *pixel = if (x / 8) % 2 == 0 {
                Rgb([210, 160, 140])
            } else {
                Rgb([150, 100, 90])
            };
        }
        assert!(is_human_likely(&object));
    }

    #[test]
    fn flat_blue_square_is_not_human_likely() {
        let object = RgbImage::from_pixel(80, 120, Rgb([30, 60, 200]));
        assert!(!is_human_likely(&object));
    }

    #[test]
    fn wide_image_is_not_human_likely_regardless_of_tone() {
        let object = RgbImage::from_pixel(200, 100, Rgb([210, 160, 140]));
        assert!(!is_human_likely(&object));
    }

    #[test]
    fn human_scale_targets_seventy_percent_height() {
        let background = solid(800, 600, [90, 90, 90]);
        let mut tall = RgbImage::new(100, 300);
        for (x, _y, pixel) in tall.enumerate_pixels_mut() {
            *pixel = if (x / 8) % 2 == 0 {
                Rgb([210, 160, 140])
            } else {
                Rgb([150, 100, 90])
            };
        }
        let composed = compose_input(&background, &DynamicImage::ImageRgb8(tall), (800, 600));
        assert!(composed.object_human_likely);
        // 0.7 * 600 / 300 = 1.4 => object width 140
        assert_eq!(composed.object_width, 140);
    }

    #[test]
    fn png_round_trip_preserves_pixels() -> anyhow::Result<()> {
        let image = RgbImage::from_fn(33, 17, |x, y| Rgb([x as u8, y as u8, (x + y) as u8]));
        let bytes = encode_png(&image)?;
        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded, image);
        Ok(())
    }
}
