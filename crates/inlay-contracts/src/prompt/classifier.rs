/// Manual prompts stay below this word count.
pub const MANUAL_WORD_LIMIT: usize = 20;

/// Substrings that only appear in auto-generated placement prompts: the
/// vision instruction's own vocabulary plus the phrases our cleanup pass
/// substitutes in. Review together with the vision instruction text; an
/// instruction change without a marker update silently reroutes prompts
/// (covered by a test in the vision module).
pub const AUTO_PROMPT_MARKERS: &[&str] = &[
    "blue selection box",
    "selection box",
    "selected area",
    "generation_prompt",
    "the image shows",
    "person on the left",
    "person on the right",
    "background scene",
    "table surface",
    "nearby surface",
    "solid surface",
];

const AUTO_PROMPT_PREFIXES: &[&str] = &["the image shows", "in this image", "this scene"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// User-written; preserved byte-for-byte after trim.
    Manual,
    /// Produced by the vision analyzer; eligible for enhancement layering.
    AutoGenerated,
}

impl PromptKind {
    pub fn label(self) -> &'static str {
        match self {
            PromptKind::Manual => "manual",
            PromptKind::AutoGenerated => "auto",
        }
    }
}

/// Pure classification over the prompt string. Manual requires all three:
/// short word count, no marker substring, no auto prefix.
pub fn classify_prompt(prompt: &str) -> PromptKind {
    let trimmed = prompt.trim();
    let lowered = trimmed.to_lowercase();

    if AUTO_PROMPT_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return PromptKind::AutoGenerated;
    }
    if AUTO_PROMPT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return PromptKind::AutoGenerated;
    }
    if trimmed.split_whitespace().count() >= MANUAL_WORD_LIMIT {
        return PromptKind::AutoGenerated;
    }
    PromptKind::Manual
}
