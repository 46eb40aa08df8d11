mod assembler;
mod classifier;

pub use assembler::{
    assemble_prompt, count_tokens, truncate_to_budget, AssembleContext, AssembledPrompt,
    ANTI_DUPLICATION_CODA, PHOTOGRAPHY_FINISH, PRESERVATION_PREFIX,
};
pub use classifier::{classify_prompt, PromptKind, AUTO_PROMPT_MARKERS, MANUAL_WORD_LIMIT};
