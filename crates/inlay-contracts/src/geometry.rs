use std::fmt;
use std::str::FromStr;

use crate::error::GenerateError;

/// Accepted width/height ratio band for MatchInput; anything outside falls
/// back to the preference table.
const ASPECT_RATIO_MIN: f64 = 0.3;
const ASPECT_RATIO_MAX: f64 = 3.5;

/// Axes derived from a scale computation are snapped to multiples of 64 and
/// never drop below this floor.
const SNAP_FLOOR: u32 = 512;

/// Long side used by the generic ratio presets.
const PRESET_LONG_SIDE: u32 = 1024;

/// Requested output shape for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectPreference {
    Square,
    Landscape16x9,
    Portrait9x16,
    Standard4x3,
    Portrait3x4,
    /// Follow the background's own dimensions through the safety ladder.
    /// Collapses to `Square` when no background is present.
    MatchInput,
    ProductSquare,
    ProductWide,
    ProductTall,
}

impl AspectPreference {
    fn nominal_dims(self) -> (u32, u32) {
        match self {
            AspectPreference::Square | AspectPreference::MatchInput => {
                (PRESET_LONG_SIDE, PRESET_LONG_SIDE)
            }
            AspectPreference::Landscape16x9 => (PRESET_LONG_SIDE, PRESET_LONG_SIDE * 9 / 16),
            AspectPreference::Portrait9x16 => (PRESET_LONG_SIDE * 9 / 16, PRESET_LONG_SIDE),
            AspectPreference::Standard4x3 => (PRESET_LONG_SIDE, PRESET_LONG_SIDE * 3 / 4),
            AspectPreference::Portrait3x4 => (PRESET_LONG_SIDE * 3 / 4, PRESET_LONG_SIDE),
            AspectPreference::ProductSquare => (1200, 1200),
            AspectPreference::ProductWide => (1600, 900),
            AspectPreference::ProductTall => (900, 1600),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AspectPreference::Square => "square",
            AspectPreference::Landscape16x9 => "16:9",
            AspectPreference::Portrait9x16 => "9:16",
            AspectPreference::Standard4x3 => "4:3",
            AspectPreference::Portrait3x4 => "3:4",
            AspectPreference::MatchInput => "match",
            AspectPreference::ProductSquare => "product-square",
            AspectPreference::ProductWide => "product-wide",
            AspectPreference::ProductTall => "product-tall",
        }
    }
}

impl fmt::Display for AspectPreference {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

impl FromStr for AspectPreference {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "square" | "1:1" => Ok(AspectPreference::Square),
            "16:9" | "landscape" => Ok(AspectPreference::Landscape16x9),
            "9:16" | "portrait" => Ok(AspectPreference::Portrait9x16),
            "4:3" => Ok(AspectPreference::Standard4x3),
            "3:4" => Ok(AspectPreference::Portrait3x4),
            "match" | "input" => Ok(AspectPreference::MatchInput),
            "product-square" => Ok(AspectPreference::ProductSquare),
            "product-wide" => Ok(AspectPreference::ProductWide),
            "product-tall" => Ok(AspectPreference::ProductTall),
            other => Err(format!("unknown aspect preference '{other}'")),
        }
    }
}

/// Memory envelope a model class can afford.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEnvelope {
    pub max_pixels: u64,
    pub max_side: u32,
    pub min_quality_pixels: u64,
}

/// Which runner handles the request, and under which memory envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Local,
    /// Kontext "pro" remote endpoint.
    RemoteA,
    /// Kontext "max" remote endpoint.
    RemoteB,
}

impl ModelClass {
    pub fn envelope(self) -> MemoryEnvelope {
        match self {
            ModelClass::Local => MemoryEnvelope {
                max_pixels: 1024 * 1024,
                max_side: 1280,
                min_quality_pixels: 512 * 512,
            },
            ModelClass::RemoteA => MemoryEnvelope {
                max_pixels: 1536 * 1536,
                max_side: 2048,
                min_quality_pixels: 512 * 512,
            },
            ModelClass::RemoteB => MemoryEnvelope {
                max_pixels: 2048 * 2048,
                max_side: 2560,
                min_quality_pixels: 512 * 512,
            },
        }
    }

    pub fn is_remote(self) -> bool {
        !matches!(self, ModelClass::Local)
    }

    /// Key into `api_models` configuration; `None` for the local class.
    pub fn api_model_key(self) -> Option<&'static str> {
        match self {
            ModelClass::Local => None,
            ModelClass::RemoteA => Some("pro"),
            ModelClass::RemoteB => Some("max"),
        }
    }

    /// Text-encoder token budget for prompt clamping. The local class uses
    /// the CLIP budget; remote endpoints accept long prompts.
    pub fn token_budget(self) -> usize {
        match self {
            ModelClass::Local => 77,
            ModelClass::RemoteA | ModelClass::RemoteB => 512,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelClass::Local => "local",
            ModelClass::RemoteA => "pro",
            ModelClass::RemoteB => "max",
        }
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

impl FromStr for ModelClass {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ModelClass::Local),
            "pro" | "remote-a" => Ok(ModelClass::RemoteA),
            "max" | "remote-b" => Ok(ModelClass::RemoteB),
            other => Err(format!("unknown model class '{other}'")),
        }
    }
}

/// Choose the final canvas size.
///
/// The resolver always produces a pair satisfying the model-class envelope:
/// `W*H <= max_pixels`, `max(W, H) <= max_side`, both axes divisible by 8
/// (64 when derived from a scale computation). Only degenerate backgrounds
/// (a side below 8 px) are rejected.
pub fn resolve_dims(
    background: Option<(u32, u32)>,
    preference: AspectPreference,
    model_class: ModelClass,
) -> Result<(u32, u32), GenerateError> {
    if let Some((width, height)) = background {
        if width < 8 || height < 8 {
            return Err(GenerateError::InvalidGeometry(format!(
                "background {width}x{height} is below the 8 px minimum side"
            )));
        }
    }

    let envelope = model_class.envelope();
    match (preference, background) {
        (AspectPreference::MatchInput, Some(size)) => Ok(match_input_dims(size, &envelope)),
        (AspectPreference::MatchInput, None) => {
            Ok(table_dims(AspectPreference::Square, &envelope))
        }
        (pref, _) => Ok(table_dims(pref, &envelope)),
    }
}

/// Preference-table dims, shrunk through the same ladder when the preset
/// exceeds the class envelope (the product presets overflow the local pixel
/// budget).
fn table_dims(preference: AspectPreference, envelope: &MemoryEnvelope) -> (u32, u32) {
    let (width, height) = preference.nominal_dims();
    let width = round_down_multiple(width, 8);
    let height = round_down_multiple(height, 8);
    if fits_envelope(width, height, envelope) {
        return (width, height);
    }
    shrink_to_envelope(width, height, envelope)
}

fn fits_envelope(width: u32, height: u32, envelope: &MemoryEnvelope) -> bool {
    width as u64 * height as u64 <= envelope.max_pixels && width.max(height) <= envelope.max_side
}

fn match_input_dims((width, height): (u32, u32), envelope: &MemoryEnvelope) -> (u32, u32) {
    let pixels = width as u64 * height as u64;
    let ratio = width as f64 / height as f64;
    if !(ASPECT_RATIO_MIN..=ASPECT_RATIO_MAX).contains(&ratio) {
        return table_dims(AspectPreference::Square, envelope);
    }

    if fits_envelope(width, height, envelope) && pixels >= envelope.min_quality_pixels {
        return (round_down_multiple(width, 8), round_down_multiple(height, 8));
    }

    // Downward-only safety scale; the quality override below is the one
    // place allowed to push back up.
    let (mut out_width, mut out_height) = shrink_to_envelope(width, height, envelope);

    let scaled_pixels = out_width as u64 * out_height as u64;
    if scaled_pixels < envelope.min_quality_pixels {
        let lift = (envelope.min_quality_pixels as f64 / scaled_pixels as f64).sqrt();
        out_width = snap_scaled_axis((out_width as f64 * lift).ceil() as u32);
        out_height = snap_scaled_axis((out_height as f64 * lift).ceil() as u32);
        walk_back_overshoot(&mut out_width, &mut out_height, envelope);
    }

    (out_width, out_height)
}

fn shrink_to_envelope(width: u32, height: u32, envelope: &MemoryEnvelope) -> (u32, u32) {
    let pixels = width as u64 * height as u64;
    let scale = f64::min(
        (envelope.max_pixels as f64 / pixels as f64).sqrt(),
        envelope.max_side as f64 / width.max(height) as f64,
    )
    .min(1.0);
    let mut out_width = snap_scaled_axis((width as f64 * scale).round() as u32);
    let mut out_height = snap_scaled_axis((height as f64 * scale).round() as u32);
    walk_back_overshoot(&mut out_width, &mut out_height, envelope);
    (out_width, out_height)
}

/// Snapping can overshoot the pixel cap by a sliver; walk the longer axis
/// back down in 64 px steps.
fn walk_back_overshoot(width: &mut u32, height: &mut u32, envelope: &MemoryEnvelope) {
    while *width as u64 * *height as u64 > envelope.max_pixels {
        if *width >= *height && *width > SNAP_FLOOR {
            *width -= 64;
        } else if *height > SNAP_FLOOR {
            *height -= 64;
        } else {
            break;
        }
    }
}

fn snap_scaled_axis(value: u32) -> u32 {
    round_down_multiple(value, 64).max(SNAP_FLOOR)
}

fn round_down_multiple(value: u32, multiple: u32) -> u32 {
    value / multiple * multiple
}
