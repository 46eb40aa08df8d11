use std::sync::{Arc, Mutex};

use image::RgbImage;
use inlay_contracts::config::LocalModels;
use inlay_contracts::error::GenerateError;

/// Default per-prompt token capacity of the local text encoder.
pub const LOCAL_TOKEN_BUDGET: usize = 77;

/// Which local pipeline a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    TextToImage,
    ImageToImage,
}

impl PipelineKind {
    fn label(self) -> &'static str {
        match self {
            Self::TextToImage => "text-to-image",
            Self::ImageToImage => "image-to-image",
        }
    }
}

/// One local generation call.
pub struct LocalInvocation {
    pub prompt: String,
    pub input: Option<RgbImage>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    pub num_images: u32,
}

/// An in-process diffusion pipeline. Implementations own their weights and
/// device placement; calls are serialized by [`LocalRunner`].
pub trait DiffusionPipeline: Send + Sync {
    fn generate(&self, invocation: &LocalInvocation) -> anyhow::Result<Vec<RgbImage>>;

    fn token_budget(&self) -> usize {
        LOCAL_TOKEN_BUDGET
    }
}

/// Builds a pipeline from configured weight locations. The error string is
/// surfaced verbatim in `LocalPipelineUnavailable`.
pub type PipelineFactory = Box<
    dyn Fn(PipelineKind, &LocalModels) -> Result<Arc<dyn DiffusionPipeline>, String> + Send + Sync,
>;

enum LoadState {
    NotLoaded,
    Ready(Arc<dyn DiffusionPipeline>),
    Unavailable(String),
}

/// Lazily loads and caches the two local pipelines. A failed load is cached
/// too, so repeated requests do not retry an absent backend.
pub struct LocalRunner {
    models: LocalModels,
    factory: PipelineFactory,
    text_to_image: Mutex<LoadState>,
    image_to_image: Mutex<LoadState>,
}

impl LocalRunner {
    pub fn new(models: LocalModels) -> Self {
        Self::with_factory(models, Box::new(builtin_factory))
    }

    pub fn with_factory(models: LocalModels, factory: PipelineFactory) -> Self {
        Self {
            models,
            factory,
            text_to_image: Mutex::new(LoadState::NotLoaded),
            image_to_image: Mutex::new(LoadState::NotLoaded),
        }
    }

    fn slot(&self, kind: PipelineKind) -> &Mutex<LoadState> {
        match kind {
            PipelineKind::TextToImage => &self.text_to_image,
            PipelineKind::ImageToImage => &self.image_to_image,
        }
    }

    fn pipeline(&self, kind: PipelineKind) -> Result<Arc<dyn DiffusionPipeline>, GenerateError> {
        let mut state = self
            .slot(kind)
            .lock()
            .map_err(|_| GenerateError::LocalPipelineUnavailable("pipeline lock poisoned".into()))?;
        if let LoadState::NotLoaded = *state {
            *state = match (self.factory)(kind, &self.models) {
                Ok(pipeline) => LoadState::Ready(pipeline),
                Err(reason) => LoadState::Unavailable(reason),
            };
        }
        match &*state {
            LoadState::Ready(pipeline) => Ok(Arc::clone(pipeline)),
            LoadState::Unavailable(reason) => {
                Err(GenerateError::LocalPipelineUnavailable(reason.clone()))
            }
            LoadState::NotLoaded => unreachable!("load state settled above"),
        }
    }

    /// Token capacity of the pipeline's text encoder, when it is loadable.
    pub fn token_budget(&self, kind: PipelineKind) -> Option<usize> {
        self.pipeline(kind).ok().map(|p| p.token_budget())
    }

    pub fn generate(
        &self,
        kind: PipelineKind,
        invocation: &LocalInvocation,
    ) -> Result<RgbImage, GenerateError> {
        let pipeline = self.pipeline(kind)?;
        let mut images = pipeline.generate(invocation).map_err(|err| {
            GenerateError::LocalPipelineUnavailable(format!(
                "{} generation failed: {err:#}",
                kind.label()
            ))
        })?;
        if images.is_empty() {
            return Err(GenerateError::LocalPipelineUnavailable(format!(
                "{} pipeline returned no images",
                kind.label()
            )));
        }
        Ok(images.remove(0))
    }
}

/// The build ships without an in-process diffusion backend; weight paths are
/// still validated so configuration mistakes surface distinctly.
fn builtin_factory(
    kind: PipelineKind,
    models: &LocalModels,
) -> Result<Arc<dyn DiffusionPipeline>, String> {
    let configured = match kind {
        PipelineKind::TextToImage => models.text_to_image.as_ref(),
        PipelineKind::ImageToImage => models.image_to_image.as_ref(),
    };
    let Some(path) = configured else {
        return Err(format!("no {} weights configured", kind.label()));
    };
    if !path.exists() {
        return Err(format!(
            "{} weights not found at {}",
            kind.label(),
            path.display()
        ));
    }
    Err("no in-process diffusion backend is linked".to_string())
}
