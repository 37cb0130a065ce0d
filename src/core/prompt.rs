//! Pass prompt construction.

use crate::domain::{PassRole, Run, Slot};

/// Characters of a per-stage addendum kept
pub const STAGE_PROMPT_CAP: usize = 4000;

const TOOLS_NOTE: &str = "You have access to tools that can help you research and gather data. \
                          Use them when needed to provide accurate responses.";

/// Instructions and user input for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassPrompt {
    pub instructions: String,
    pub input: String,
}

/// Build the prompt for `slot`.
///
/// `prior_output` is the previous pass's output (A for refine, B for
/// synthesis) when that pass succeeded; without it the pass answers the
/// augmented query directly.
pub fn build_pass_prompt(
    run: &Run,
    slot: Slot,
    augmented_query: &str,
    prior_output: Option<&str>,
) -> PassPrompt {
    let base = format!("{}\n\n{}", run.instructions, run.output_length.hint());
    let role = slot.role();

    let instructions = match role {
        PassRole::Draft => format!("{}\n\n{}", base, TOOLS_NOTE),
        PassRole::Refine | PassRole::Synthesis => base,
    };

    let input = match (role, prior_output) {
        (PassRole::Refine, Some(draft)) => format!(
            "Original request: {}\n\n\
             Initial draft to improve:\n{}\n\n\
             Please analyze the above draft and provide an improved, refined version. \
             Address gaps, improve clarity, and ensure correctness.",
            run.query, draft
        ),
        (PassRole::Synthesis, Some(refined)) => format!(
            "Original request: {}\n\n\
             Refined response to validate:\n{}\n\n\
             Please review the above response against the original request. \
             Verify it is accurate, complete, and well-structured. Provide the final, polished version.",
            run.query, refined
        ),
        _ => augmented_query.to_string(),
    };

    PassPrompt {
        instructions,
        input: with_addendum(input, slot, run.stage_prompt_for(slot)),
    }
}

fn with_addendum(input: String, slot: Slot, extra: Option<&str>) -> String {
    let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) else {
        return input;
    };
    let extra: String = extra.chars().take(STAGE_PROMPT_CAP).collect();
    format!(
        "{}\n\n--- Additional instructions for stage {} (append-only) ---\n{}\n--- End additional instructions ---",
        input,
        slot.as_str().to_ascii_uppercase(),
        extra
    )
}
