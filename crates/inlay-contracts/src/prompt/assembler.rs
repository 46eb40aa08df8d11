use crate::geometry::ModelClass;
use crate::prompt::classifier::{classify_prompt, PromptKind};

/// Layer 1: preservation / integration prefix for remote side-by-side input.
pub const PRESERVATION_PREFIX: &str = "Seamlessly integrate the SINGLE OBJECT from the left side \
of the input image into the background scene on the right, maintain the object's exact \
appearance, size, and proportions from the reference, preserve the original scale and dimensions \
of the object, create only ONE instance of the object, maintain exact human pose and expression \
from the background image, ensure natural physics with realistic placement, proper shadows, and \
natural contact points.";

/// Layer 4: anti-duplication coda.
pub const ANTI_DUPLICATION_CODA: &str = "IMPORTANT: Use only the single object shown in the \
input image - do not create additional objects.";

/// Layer 5: photography finish, appended verbatim (leading comma included).
pub const PHOTOGRAPHY_FINISH: &str = ", professional studio lighting, realistic shadows and \
contact points, commercial photography quality, single object integration only.";

const LOCAL_INTEGRATION_PREFIX: &str = "Integrate the object from the left side of the input \
image into the background scene on the right.";

const LOCAL_INTEGRATION_CODA: &str = "Natural integration, consistent lighting.";

#[derive(Debug, Clone)]
pub struct AssembleContext {
    pub has_object: bool,
    pub has_background: bool,
    pub model_class: ModelClass,
    /// Scale pre-analysis sentence injected between the prefix and the scene
    /// description when available.
    pub scale_guidance: Option<String>,
    /// Overrides the model-class token budget; set from the local pipeline's
    /// own tokenizer once loaded.
    pub token_budget: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    pub kind: PromptKind,
    pub token_count: usize,
    pub truncated: bool,
}

/// Build the effective prompt.
///
/// Manual prompts bypass every enhancement layer and only pass through the
/// token clamp; within budget that clamp is the identity, so manual text
/// survives byte-for-byte after trim. Auto-generated prompts with both panels
/// present get the full enhancement stack (remote) or the reduced local form.
pub fn assemble_prompt(user_prompt: &str, context: &AssembleContext) -> AssembledPrompt {
    let trimmed = user_prompt.trim();
    let kind = classify_prompt(trimmed);
    let budget = context
        .token_budget
        .unwrap_or_else(|| context.model_class.token_budget());

    let layered = match kind {
        PromptKind::Manual => trimmed.to_string(),
        PromptKind::AutoGenerated if context.has_object && context.has_background => {
            if context.model_class.is_remote() {
                enhance_remote(trimmed, context.scale_guidance.as_deref())
            } else {
                enhance_local(trimmed)
            }
        }
        PromptKind::AutoGenerated => trimmed.to_string(),
    };

    let (text, truncated) = truncate_to_budget(&layered, budget);
    let token_count = count_tokens(&text);
    AssembledPrompt {
        text,
        kind,
        token_count,
        truncated,
    }
}

fn enhance_remote(prompt: &str, scale_guidance: Option<&str>) -> String {
    let mut out = String::from(PRESERVATION_PREFIX);
    if let Some(guidance) = scale_guidance {
        let guidance = guidance.trim();
        if !guidance.is_empty() {
            out.push(' ');
            out.push_str(guidance);
            if !guidance.ends_with('.') {
                out.push('.');
            }
        }
    }
    out.push_str(" Scene description: ");
    out.push_str(prompt);
    out.push_str(". ");
    out.push_str(ANTI_DUPLICATION_CODA);
    out.push_str(PHOTOGRAPHY_FINISH);
    out
}

fn enhance_local(prompt: &str) -> String {
    format!("{LOCAL_INTEGRATION_PREFIX} {prompt}. {LOCAL_INTEGRATION_CODA}")
}

/// Whitespace tokenizer standing in for the text encoder's tokenizer. Real
/// encoders split slightly finer, so budgets stay conservative at the word
/// level.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Clamp to the token budget: tokenize, truncate, detokenize. Text within
/// budget is returned unchanged.
pub fn truncate_to_budget(text: &str, budget: usize) -> (String, bool) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= budget {
        return (text.to_string(), false);
    }
    (tokens[..budget].join(" "), true)
}
