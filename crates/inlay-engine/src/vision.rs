use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, Rgb, RgbImage};
use inlay_contracts::error::GenerateError;
use inlay_contracts::selection::SelectionRect;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::compose::encode_png;

pub const DEFAULT_VISION_API_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Provider id used when the caller does not pick one.
pub const DEFAULT_VISION_PROVIDER: &str = "qwen-vl-max";
const VISION_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const VISION_TEMPERATURE: f64 = 0.3;
const VISION_MAX_TOKENS: u32 = 500;

/// Returned whenever the vision path degrades; auto-prompt is a convenience,
/// not a correctness path, so it never raises to the orchestrator.
pub const FALLBACK_PROMPT: &str =
    "object positioned naturally in the selected area with appropriate lighting and context";

/// Redirect object placement off human surfaces to environmental ones.
const SAFETY_SUBSTITUTIONS: &[(&str, &str)] = &[
    ("on skin", "on table surface"),
    ("on clothing", "on nearby surface"),
    ("on fabric", "on solid surface"),
];

const PROMPT_LABELS: &[&str] = &[
    "prompt:",
    "here's the prompt:",
    "here is the prompt:",
    "generation prompt:",
];

const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 80, 255]);
const OVERLAY_THICKNESS: u32 = 3;

/// Structured placement description from the vision service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementAnalysis {
    pub scene: String,
    pub selection_area: String,
    pub object_description: String,
    pub generation_prompt: String,
}

/// One analysis request: background with the selection to burn in, optional
/// object, provider id, credential.
pub struct VisionRequest<'a> {
    pub background: &'a DynamicImage,
    pub object: Option<&'a DynamicImage>,
    pub selection: SelectionRect,
    pub provider: &'a str,
    pub credential: &'a str,
}

/// Capability the analyzer needs from the wire: one OpenAI-compatible chat
/// completion POST with a bearer credential.
pub trait VisionTransport {
    fn chat(&self, url: &str, api_key: &str, payload: &Value) -> anyhow::Result<Value>;
}

impl VisionTransport for Box<dyn VisionTransport> {
    fn chat(&self, url: &str, api_key: &str, payload: &Value) -> anyhow::Result<Value> {
        (**self).chat(url, api_key, payload)
    }
}

pub struct HttpVisionTransport {
    http: HttpClient,
}

impl HttpVisionTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpVisionTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionTransport for HttpVisionTransport {
    fn chat(&self, url: &str, api_key: &str, payload: &Value) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .header("accept", "application/json")
            .json(payload)
            .timeout(VISION_REQUEST_TIMEOUT)
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            anyhow::bail!("vision request failed ({}): {body}", status.as_u16());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Queries the vision-language service for a structured placement
/// description of the two images plus the selection rectangle.
pub struct VisionAnalyzer<T: VisionTransport> {
    api_base: String,
    transport: T,
}

impl VisionAnalyzer<HttpVisionTransport> {
    pub fn new() -> Self {
        Self::with_transport(DEFAULT_VISION_API_BASE, HttpVisionTransport::new())
    }
}

impl Default for VisionAnalyzer<HttpVisionTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: VisionTransport> VisionAnalyzer<T> {
    pub fn with_transport(api_base: impl Into<String>, transport: T) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { api_base, transport }
    }

    /// Full structured analysis. Errors as `VisionUnavailable`; callers that
    /// only want the prompt should use [`VisionAnalyzer::auto_prompt`].
    pub fn analyze(&self, request: &VisionRequest<'_>) -> Result<PlacementAnalysis, GenerateError> {
        self.analyze_inner(request)
            .map_err(|err| GenerateError::VisionUnavailable(format!("{err:#}")))
    }

    /// The 40-60 word placement prompt. Never fails: any upstream problem
    /// degrades to [`FALLBACK_PROMPT`].
    pub fn auto_prompt(&self, request: &VisionRequest<'_>) -> String {
        match self.analyze(request) {
            Ok(analysis) if !analysis.generation_prompt.trim().is_empty() => {
                analysis.generation_prompt
            }
            _ => FALLBACK_PROMPT.to_string(),
        }
    }

    fn analyze_inner(&self, request: &VisionRequest<'_>) -> anyhow::Result<PlacementAnalysis> {
        let (bg_width, bg_height) = (request.background.width(), request.background.height());
        let overlaid = draw_selection_overlay(request.background, request.selection);
        let region = request.selection.position_tag(bg_width, bg_height);
        let instruction =
            build_instruction(request.object.is_some(), request.selection, region);

        let mut content = vec![
            json!({"type": "text", "text": instruction}),
            json!({"type": "image_url", "image_url": {"url": png_data_url(&overlaid)?}}),
        ];
        if let Some(object) = request.object {
            let object_rgb = object.to_rgb8();
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": png_data_url(&object_rgb)?}
            }));
        }

        let payload = json!({
            "model": provider_model(request.provider),
            "messages": [{"role": "user", "content": content}],
            "temperature": VISION_TEMPERATURE,
            "max_tokens": VISION_MAX_TOKENS,
        });

        let url = format!("{}/chat/completions", self.api_base);
        let response = self.transport.chat(&url, request.credential, &payload)?;
        let text = response
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("vision response carried no text"))?;

        Ok(parse_analysis(text))
    }
}

fn provider_model(provider: &str) -> String {
    match provider.trim().to_ascii_lowercase().as_str() {
        "qwen-vl-max" | "qwen-vl" => "qwen-vl-max-latest".to_string(),
        "qwen-vl-plus" => "qwen-vl-plus-latest".to_string(),
        other if !other.is_empty() => other.to_string(),
        _ => "qwen-vl-max-latest".to_string(),
    }
}

/// The single user-turn instruction. Its vocabulary overlaps the classifier
/// marker set on purpose, so auto-generated prompts keep routing as auto.
fn build_instruction(has_object: bool, selection: SelectionRect, region: &str) -> String {
    let object_clause = if has_object {
        "The second image shows the object to integrate."
    } else {
        "No object image is provided; describe what would fit the marked area."
    };
    format!(
        "You are analyzing a photo composition task. The first image is the background scene; \
the blue selection box drawn on it marks the selected area where the object should be placed \
({region} region, pixels {left},{top} to {right},{bottom}). {object_clause} Respond with \
strict JSON only, exactly these fields: {{\"scene\": \"...\", \"selection_area\": \"...\", \
\"object_description\": \"...\", \"generation_prompt\": \"...\"}}. The generation_prompt must \
be a single 40-60 word instruction describing how the object sits in the selected area of the \
background scene with natural lighting, scale, and contact shadows.",
        region = region,
        left = selection.left,
        top = selection.top,
        right = selection.right,
        bottom = selection.bottom,
    )
}

/// Burn the selection rectangle into the background pixels so the model sees
/// exactly the region the user drew.
pub fn draw_selection_overlay(background: &DynamicImage, selection: SelectionRect) -> RgbImage {
    let mut image = background.to_rgb8();
    let (width, height) = image.dimensions();
    let near_edge = |value: u32, low: u32, high: u32| {
        value >= low.saturating_sub(OVERLAY_THICKNESS / 2)
            && value < (low + OVERLAY_THICKNESS).min(high)
    };
    for y in 0..height {
        for x in 0..width {
            let on_vertical = (near_edge(x, selection.left, width)
                || near_edge(x, selection.right.saturating_sub(OVERLAY_THICKNESS), width))
                && y >= selection.top
                && y < selection.bottom;
            let on_horizontal = (near_edge(y, selection.top, height)
                || near_edge(y, selection.bottom.saturating_sub(OVERLAY_THICKNESS), height))
                && x >= selection.left
                && x < selection.right;
            if on_vertical || on_horizontal {
                image.put_pixel(x, y, OVERLAY_COLOR);
            }
        }
    }
    image
}

fn parse_analysis(text: &str) -> PlacementAnalysis {
    let Some(parsed) = extract_json_object(text) else {
        // no JSON span: treat the whole reply as the prompt
        return PlacementAnalysis {
            generation_prompt: clean_generation_prompt(text),
            ..PlacementAnalysis::default()
        };
    };
    let field = |key: &str| {
        parsed
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    PlacementAnalysis {
        scene: field("scene"),
        selection_area: field("selection_area"),
        object_description: field("object_description"),
        generation_prompt: clean_generation_prompt(&field("generation_prompt")),
    }
}

/// Locate and parse the first `{…}` span in free-form model output.
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Normalize a raw generation prompt: drop labels and enclosing quotes,
/// redirect placement off human surfaces, drop the trailing period.
pub fn clean_generation_prompt(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    let lowered = text.to_lowercase();
    for label in PROMPT_LABELS {
        if lowered.starts_with(label) {
            text = text[label.len()..].trim_start().to_string();
            break;
        }
    }

    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            text = text[1..text.len() - 1].trim().to_string();
        }
    }

    for (pattern, replacement) in SAFETY_SUBSTITUTIONS {
        text = replace_case_insensitive(&text, pattern, replacement);
    }

    if text.ends_with('.') {
        text.pop();
    }
    text.trim().to_string()
}

fn replace_case_insensitive(text: &str, pattern: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let lowered = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find(&pattern) {
        let at = cursor + found;
        out.push_str(&text[cursor..at]);
        out.push_str(replacement);
        cursor = at + pattern.len();
    }
    out.push_str(&text[cursor..]);
    out
}

fn png_data_url(image: &RgbImage) -> anyhow::Result<String> {
    let bytes = encode_png(image)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
}

#[cfg(test)]
mod tests {
    use inlay_contracts::prompt::{classify_prompt, PromptKind};

    use super::*;

    struct FakeVision {
        response: anyhow::Result<Value>,
    }

    impl VisionTransport for FakeVision {
        fn chat(&self, _url: &str, _api_key: &str, _payload: &Value) -> anyhow::Result<Value> {
            match &self.response {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(anyhow::anyhow!("{err:#}")),
            }
        }
    }

    fn chat_response(content: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    fn request_images() -> (DynamicImage, DynamicImage) {
        let background = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            800,
            600,
            Rgb([120, 120, 120]),
        ));
        let object = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 400, Rgb([200, 40, 40])));
        (background, object)
    }

    #[test]
    fn auto_prompt_returns_cleaned_generation_prompt() {
        let (background, object) = request_images();
        let selection = SelectionRect::new(400, 100, 600, 500, 800, 600).unwrap();
        let analyzer = VisionAnalyzer::with_transport(
            "https://vision.example/v1",
            FakeVision {
                response: Ok(chat_response(
                    r#"Here is the analysis: {"scene": "wooden kitchen table", "selection_area": "center of the table", "object_description": "ceramic vase", "generation_prompt": "\"object placed naturally on the wooden table, soft daylight.\""}"#,
                )),
            },
        );
        let prompt = analyzer.auto_prompt(&VisionRequest {
            background: &background,
            object: Some(&object),
            selection,
            provider: "Qwen-VL-Max",
            credential: "K",
        });
        assert_eq!(
            prompt,
            "object placed naturally on the wooden table, soft daylight"
        );
    }

    #[test]
    fn transport_failure_degrades_to_fallback_prompt() {
        let (background, object) = request_images();
        let selection = SelectionRect::new(10, 10, 100, 100, 800, 600).unwrap();
        let analyzer = VisionAnalyzer::with_transport(
            "https://vision.example/v1",
            FakeVision {
                response: Err(anyhow::anyhow!("503 upstream unavailable")),
            },
        );
        let prompt = analyzer.auto_prompt(&VisionRequest {
            background: &background,
            object: Some(&object),
            selection,
            provider: "qwen-vl-max",
            credential: "K",
        });
        assert_eq!(prompt, FALLBACK_PROMPT);
    }

    #[test]
    fn non_json_reply_is_used_raw_after_cleaning() {
        let (background, _object) = request_images();
        let selection = SelectionRect::new(10, 10, 100, 100, 800, 600).unwrap();
        let analyzer = VisionAnalyzer::with_transport(
            "https://vision.example/v1",
            FakeVision {
                response: Ok(chat_response(
                    "Prompt: vase resting gently near the window light.",
                )),
            },
        );
        let prompt = analyzer.auto_prompt(&VisionRequest {
            background: &background,
            object: None,
            selection,
            provider: "qwen-vl-max",
            credential: "K",
        });
        assert_eq!(prompt, "vase resting gently near the window light");
    }

    #[test]
    fn cleanup_redirects_placement_off_human_surfaces() {
        assert_eq!(
            clean_generation_prompt("place the watch On Skin near the wrist."),
            "place the watch on table surface near the wrist"
        );
        assert_eq!(
            clean_generation_prompt("pin it on clothing, centered"),
            "pin it on nearby surface, centered"
        );
        assert_eq!(
            clean_generation_prompt("\"rest it on fabric.\""),
            "rest it on solid surface"
        );
    }

    #[test]
    fn only_the_final_period_is_stripped() {
        assert_eq!(
            clean_generation_prompt("vase fading into soft shadow..."),
            "vase fading into soft shadow.."
        );
        assert_eq!(clean_generation_prompt("no trailing period"), "no trailing period");
    }

    #[test]
    fn json_span_is_extracted_from_surrounding_prose() {
        let value = extract_json_object("sure! {\"generation_prompt\": \"x\"} hope that helps")
            .unwrap();
        assert_eq!(value["generation_prompt"], json!("x"));
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn overlay_burns_blue_border_at_selection_edges() {
        let background =
            DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([10, 10, 10])));
        let selection = SelectionRect::new(50, 60, 150, 160, 200, 200).unwrap();
        let overlaid = draw_selection_overlay(&background, selection);
        assert_eq!(*overlaid.get_pixel(50, 100), OVERLAY_COLOR);
        assert_eq!(*overlaid.get_pixel(100, 60), OVERLAY_COLOR);
        assert_eq!(*overlaid.get_pixel(100, 100), Rgb([10, 10, 10]));
    }

    #[test]
    fn instruction_vocabulary_routes_auto_through_classifier() {
        let selection = SelectionRect::new(400, 100, 600, 500, 800, 600).unwrap();
        let instruction = build_instruction(true, selection, "middle-right");
        assert_eq!(classify_prompt(&instruction), PromptKind::AutoGenerated);
        // marker overlap must hold even for short excerpts of the vocabulary
        assert!(instruction.contains("blue selection box"));
        assert!(instruction.contains("selected area"));
    }

    #[test]
    fn fallback_prompt_routes_auto_through_classifier() {
        assert_eq!(classify_prompt(FALLBACK_PROMPT), PromptKind::AutoGenerated);
    }

    #[test]
    fn provider_ids_map_to_service_models() {
        assert_eq!(provider_model("Qwen-VL-Max"), "qwen-vl-max-latest");
        assert_eq!(provider_model("qwen-vl-plus"), "qwen-vl-plus-latest");
        assert_eq!(provider_model("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(provider_model("  "), "qwen-vl-max-latest");
    }
}
