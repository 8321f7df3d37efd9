//! Prompt construction for outline planning and unit generation.

use crate::store::{GenerationInput, Outline, OutlineUnit, UnitKind};

/// System prompt of the planning call.
pub const PLAN_SYSTEM_PROMPT: &str = "You are an outline planner for long-form documents. \
You split a writing request into an ordered list of sections and answer with JSON only.";

/// System prompt of every unit call.
pub const UNIT_SYSTEM_PROMPT: &str = "You are a careful long-form writer. \
You write exactly one section of a larger document and return only that section's prose.";

/// Escapes chat-template control sequences so user text cannot
/// impersonate role markers.
pub fn sanitize_for_prompt(text: &str) -> String {
    text.replace("<|", "< |")
        .replace("|>", "| >")
        .replace("<s>", "< s >")
        .replace("</s>", "< / s >")
        .replace("[INST]", "[ INST ]")
        .replace("[/INST]", "[ / INST ]")
        .replace("<<SYS>>", "< < SYS > >")
        .replace("<</SYS>>", "< < / SYS > >")
}

fn request_details(input: &GenerationInput) -> String {
    let mut lines = Vec::new();
    if let Some(title) = &input.title {
        lines.push(format!("Title: {}", sanitize_for_prompt(title)));
    }
    if let Some(style) = &input.style {
        lines.push(format!("Style: {}", sanitize_for_prompt(style)));
    }
    if let Some(template) = &input.template {
        lines.push(format!("Template: {}", sanitize_for_prompt(template)));
    }
    if let Some(language) = &input.language {
        lines.push(format!("Write in: {}", sanitize_for_prompt(language)));
    }
    if input.mode.deep_research {
        lines.push("Depth: thorough, research-grade treatment with concrete detail".to_string());
    }
    if input.mode.include_references {
        lines.push("Cite sources inline where claims need support".to_string());
    }
    lines.join("\n")
}

/// Builds the planning prompt.
pub fn build_plan_prompt(
    input: &GenerationInput,
    max_units: usize,
    default_target_size: u32,
) -> String {
    format!(
        r#"REQUEST:
{prompt}

{details}

Plan the document as at most {max_units} sections. The first section should
have kind "opening", the last "closing", all others "body".

Respond with ONLY this JSON object (no markdown, no commentary):
{{
  "title": "Document title",
  "units": [
    {{"index": 0, "title": "Section title", "kind": "opening", "target_size": {default_target_size}, "summary": "What this section covers"}}
  ]
}}

Indices start at 0 and increase by one. target_size is a word count."#,
        prompt = sanitize_for_prompt(&input.prompt),
        details = request_details(input),
        max_units = max_units,
        default_target_size = default_target_size,
    )
}

fn kind_guidance(kind: UnitKind) -> &'static str {
    match kind {
        UnitKind::Opening => "This is the opening: introduce the topic and set up what follows.",
        UnitKind::Body => "This is a body section: develop its topic fully.",
        UnitKind::Closing => "This is the closing: draw the document together and conclude.",
    }
}

/// Builds the prompt for one unit.
///
/// The header line `Section {n} of {total}` (1-based) is stable and unique
/// per unit.
pub fn build_unit_prompt(input: &GenerationInput, outline: &Outline, unit: &OutlineUnit) -> String {
    let total = outline.total_units();
    let previous = unit
        .index
        .checked_sub(1)
        .and_then(|i| outline.units.get(i))
        .map(|u| sanitize_for_prompt(&u.title));
    let next = outline
        .units
        .get(unit.index + 1)
        .map(|u| sanitize_for_prompt(&u.title));

    let mut prompt = format!(
        "Section {} of {}: {}\nDocument: {}\n",
        unit.index + 1,
        total,
        sanitize_for_prompt(&unit.title),
        sanitize_for_prompt(&outline.title),
    );
    if let Some(summary) = &unit.summary {
        prompt.push_str(&format!("Covers: {}\n", sanitize_for_prompt(summary)));
    }
    if let Some(prev) = previous {
        prompt.push_str(&format!("Previous section: {}\n", prev));
    }
    if let Some(next) = next {
        prompt.push_str(&format!("Next section: {}\n", next));
    }
    prompt.push_str(&format!(
        "\n{}\nTarget length: about {} words.\n",
        kind_guidance(unit.kind),
        unit.target_size
    ));

    let details = request_details(input);
    if !details.is_empty() {
        prompt.push_str(&format!("\n{}\n", details));
    }
    prompt.push_str(&format!(
        "\nOriginal request:\n{}\n\nDo not repeat the section title.",
        sanitize_for_prompt(&input.prompt)
    ));
    prompt
}

/// Placeholder stored when a unit could not be generated.
pub fn fallback_placeholder(unit: &OutlineUnit) -> String {
    format!(
        "[Section {} \"{}\" could not be generated.]",
        unit.index + 1,
        unit.title
    )
}
