pub mod compose;
pub mod local;
pub mod remote;
pub mod vision;

use chrono::Utc;
use image::{DynamicImage, RgbImage};
use inlay_contracts::config::{
    resolve_credential, AppConfig, REMOTE_CREDENTIAL_ENV, VISION_CREDENTIAL_ENV,
};
use inlay_contracts::error::GenerateError;
use inlay_contracts::events::{EventLog, EventPayload};
use inlay_contracts::geometry::{resolve_dims, AspectPreference, ModelClass};
use inlay_contracts::prompt::{assemble_prompt, AssembleContext};
use inlay_contracts::selection::SelectionRect;
use serde_json::json;

use crate::compose::{compose_input, encode_png, resize_background};
use crate::local::{LocalInvocation, LocalRunner, PipelineKind};
use crate::remote::{
    CancelToken, HttpTransport, RemoteJobRequest, RemoteJobRunner, RemoteTransport,
};
use crate::vision::{
    HttpVisionTransport, VisionAnalyzer, VisionRequest, VisionTransport,
    DEFAULT_VISION_API_BASE, DEFAULT_VISION_PROVIDER, FALLBACK_PROMPT,
};

const MAX_STEPS: u32 = 50;
const MAX_GUIDANCE: f64 = 10.0;

/// One generation request as the caller states it.
#[derive(Clone)]
pub struct GenerateParams {
    pub background: Option<DynamicImage>,
    pub object: Option<DynamicImage>,
    pub selection: Option<SelectionRect>,
    pub prompt: String,
    pub aspect: AspectPreference,
    pub steps: u32,
    pub guidance: f64,
    pub model_class: ModelClass,
    pub credential: Option<String>,
    pub seed: Option<i64>,
    pub scale_guidance: Option<String>,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            background: None,
            object: None,
            selection: None,
            prompt: prompt.into(),
            aspect: AspectPreference::MatchInput,
            steps: 28,
            guidance: 2.5,
            model_class: ModelClass::RemoteA,
            credential: None,
            seed: None,
            scale_guidance: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: RgbImage,
    pub generation_id: String,
    pub generation_timestamp_ms: i64,
}

/// Ties the pipeline together: geometry, composition, prompt assembly, then
/// the remote or local runner. One engine serves one session; its event log
/// and cancel token are shared across requests.
pub struct Engine {
    config: AppConfig,
    events: EventLog,
    remote: RemoteJobRunner<Box<dyn RemoteTransport>>,
    vision: VisionAnalyzer<Box<dyn VisionTransport>>,
    local: LocalRunner,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(config: AppConfig, events: EventLog) -> Self {
        let local = LocalRunner::new(config.models.clone());
        Self::with_components(
            config,
            events,
            RemoteJobRunner::new(Box::new(HttpTransport::new())),
            VisionAnalyzer::with_transport(
                DEFAULT_VISION_API_BASE,
                Box::new(HttpVisionTransport::new()),
            ),
            local,
        )
    }

    pub fn with_components(
        config: AppConfig,
        events: EventLog,
        remote: RemoteJobRunner<Box<dyn RemoteTransport>>,
        vision: VisionAnalyzer<Box<dyn VisionTransport>>,
        local: LocalRunner,
    ) -> Self {
        Self {
            config,
            events,
            remote,
            vision,
            local,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn generate(&self, params: &GenerateParams) -> Result<GenerationResult, GenerateError> {
        self.generate_with_progress(params, None)
    }

    pub fn generate_with_progress(
        &self,
        params: &GenerateParams,
        progress: Option<&dyn Fn(f64, &str)>,
    ) -> Result<GenerationResult, GenerateError> {
        self.emit(
            "generation_started",
            payload(&[
                ("model", json!(params.model_class.label())),
                ("aspect", json!(params.aspect.label())),
                ("prompt_chars", json!(params.prompt.trim().len())),
            ]),
        );
        match self.generate_inner(params, progress) {
            Ok(result) => {
                self.emit(
                    "generation_finished",
                    payload(&[
                        ("generation_id", json!(result.generation_id)),
                        ("width", json!(result.image.width())),
                        ("height", json!(result.image.height())),
                    ]),
                );
                Ok(result)
            }
            Err(err) => {
                self.emit(
                    "generation_failed",
                    payload(&[
                        ("error", json!(err.to_string())),
                        ("pre_dispatch", json!(err.rejected_before_dispatch())),
                    ]),
                );
                Err(err)
            }
        }
    }

    fn generate_inner(
        &self,
        params: &GenerateParams,
        progress: Option<&dyn Fn(f64, &str)>,
    ) -> Result<GenerationResult, GenerateError> {
        validate_params(params)?;

        let background_dims = params
            .background
            .as_ref()
            .map(|image| (image.width(), image.height()));
        let dims = resolve_dims(background_dims, params.aspect, params.model_class)?;
        self.emit(
            "dims_resolved",
            payload(&[("width", json!(dims.0)), ("height", json!(dims.1))]),
        );

        // Input image: composed two-panel layout when both panels exist, a
        // resized background alone otherwise, nothing for pure text-to-image.
        let input = match (params.background.as_ref(), params.object.as_ref()) {
            (Some(background), Some(object)) => {
                let composed = compose_input(background, object, dims);
                self.emit(
                    "input_composed",
                    payload(&[
                        ("background_width", json!(composed.background_width)),
                        ("object_width", json!(composed.object_width)),
                        ("gap", json!(composed.gap)),
                        ("human_likely", json!(composed.object_human_likely)),
                    ]),
                );
                Some(composed.image)
            }
            (Some(background), None) => Some(resize_background(background, dims)),
            (None, _) => None,
        };

        let pipeline_kind = if input.is_some() {
            PipelineKind::ImageToImage
        } else {
            PipelineKind::TextToImage
        };
        let token_budget = if params.model_class == ModelClass::Local {
            self.local.token_budget(pipeline_kind)
        } else {
            None
        };
        let assembled = assemble_prompt(
            &params.prompt,
            &AssembleContext {
                has_object: params.object.is_some(),
                has_background: params.background.is_some(),
                model_class: params.model_class,
                scale_guidance: params.scale_guidance.clone(),
                token_budget,
            },
        );
        self.emit(
            "prompt_assembled",
            payload(&[
                ("kind", json!(assembled.kind.label())),
                ("tokens", json!(assembled.token_count)),
                ("truncated", json!(assembled.truncated)),
            ]),
        );

        let image = if params.model_class.is_remote() {
            self.run_remote(params, dims, &assembled.text, input, progress)?
        } else {
            self.run_local(params, dims, &assembled.text, input, pipeline_kind)?
        };

        let now_ms = Utc::now().timestamp_millis();
        Ok(GenerationResult {
            image,
            generation_id: format!("gen_{now_ms}"),
            generation_timestamp_ms: now_ms,
        })
    }

    fn run_remote(
        &self,
        params: &GenerateParams,
        dims: (u32, u32),
        prompt: &str,
        input: Option<RgbImage>,
        progress: Option<&dyn Fn(f64, &str)>,
    ) -> Result<RgbImage, GenerateError> {
        let key = params
            .model_class
            .api_model_key()
            .ok_or_else(|| GenerateError::RemoteProtocol("model class is not remote".into()))?;
        let api = self
            .config
            .api_model(key)
            .ok_or_else(|| GenerateError::RemoteProtocol(format!("no api model configured for '{key}'")))?
            .clone();
        let api_key = resolve_credential(params.credential.as_deref(), REMOTE_CREDENTIAL_ENV)
            .ok_or_else(|| GenerateError::NoCredential(key.to_string()))?;

        let input_image_png = match input {
            Some(image) => Some(encode_png(&image).map_err(|err| {
                GenerateError::InvalidInput(format!("input image encoding failed: {err:#}"))
            })?),
            None => None,
        };

        let request = RemoteJobRequest {
            prompt: prompt.to_string(),
            input_image_png,
            width: dims.0,
            height: dims.1,
            steps: params.steps,
            guidance: params.guidance,
            seed: params.seed,
            depth_map_png: None,
            depth_strength: None,
        };
        self.emit(
            "remote_submitted",
            payload(&[
                ("endpoint", json!(key)),
                ("width", json!(dims.0)),
                ("height", json!(dims.1)),
            ]),
        );

        let bytes = self
            .remote
            .run(&api, &api_key, &request, &self.cancel, progress)?;
        let image = image::load_from_memory(&bytes).map_err(|err| {
            GenerateError::RemoteProtocol(format!("result image decoding failed: {err}"))
        })?;
        Ok(image.to_rgb8())
    }

    fn run_local(
        &self,
        params: &GenerateParams,
        dims: (u32, u32),
        prompt: &str,
        input: Option<RgbImage>,
        kind: PipelineKind,
    ) -> Result<RgbImage, GenerateError> {
        let invocation = LocalInvocation {
            prompt: prompt.to_string(),
            input,
            width: dims.0,
            height: dims.1,
            steps: params.steps,
            guidance: params.guidance,
            num_images: 1,
        };
        self.local.generate(kind, &invocation)
    }

    /// Describe the selection with the vision service and return a placement
    /// prompt. Degrades to [`FALLBACK_PROMPT`] on any failure, including a
    /// missing credential.
    pub fn auto_prompt(
        &self,
        background: &DynamicImage,
        object: Option<&DynamicImage>,
        selection: SelectionRect,
        provider: Option<&str>,
        credential: Option<&str>,
    ) -> String {
        let Some(api_key) = resolve_credential(credential, VISION_CREDENTIAL_ENV) else {
            self.emit(
                "auto_prompt_generated",
                payload(&[("fallback", json!(true)), ("reason", json!("no credential"))]),
            );
            return FALLBACK_PROMPT.to_string();
        };
        let prompt = self.vision.auto_prompt(&VisionRequest {
            background,
            object,
            selection,
            provider: provider.unwrap_or(DEFAULT_VISION_PROVIDER),
            credential: &api_key,
        });
        self.emit(
            "auto_prompt_generated",
            payload(&[
                ("fallback", json!(prompt == FALLBACK_PROMPT)),
                ("prompt_chars", json!(prompt.len())),
            ]),
        );
        prompt
    }

    // Telemetry never blocks or fails a generation.
    fn emit(&self, event_type: &str, fields: EventPayload) {
        let _ = self.events.emit(event_type, fields);
    }
}

fn validate_params(params: &GenerateParams) -> Result<(), GenerateError> {
    if params.prompt.trim().is_empty() {
        return Err(GenerateError::InvalidInput("prompt is empty".into()));
    }
    if params.steps == 0 || params.steps > MAX_STEPS {
        return Err(GenerateError::InvalidInput(format!(
            "steps {} outside 1..={MAX_STEPS}",
            params.steps
        )));
    }
    if !(0.0..=MAX_GUIDANCE).contains(&params.guidance) {
        return Err(GenerateError::InvalidInput(format!(
            "guidance {} outside 0..={MAX_GUIDANCE}",
            params.guidance
        )));
    }
    if params.object.is_some() && params.background.is_none() {
        return Err(GenerateError::InvalidInput(
            "an object image requires a background image".into(),
        ));
    }
    if let (Some(selection), Some(background)) =
        (params.selection.as_ref(), params.background.as_ref())
    {
        if selection.right > background.width() || selection.bottom > background.height() {
            return Err(GenerateError::InvalidInput(format!(
                "selection ({},{},{},{}) exceeds background {}x{}",
                selection.left,
                selection.top,
                selection.right,
                selection.bottom,
                background.width(),
                background.height()
            )));
        }
    }
    Ok(())
}

fn payload(fields: &[(&str, serde_json::Value)]) -> EventPayload {
    let mut map = EventPayload::new();
    for (key, value) in fields {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
