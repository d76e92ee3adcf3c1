// Prompt text for CV enhancement. The reply must match the provider result
// envelope exactly; it is schema-checked before it is stored.

pub const ENHANCEMENT_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

pub const ENHANCEMENT_PROMPT_TEMPLATE: &str = r#"Tailor the CV below to the job description.

Return a single JSON object with exactly these fields:
{
  "enhancedContent": { "summary": string, "experience": [string], "skills": [string] },
  "suggestions": [string],
  "matchScore": number between 0 and 100
}

CRITICAL: Only restate facts present in the CV. Do NOT invent employers, dates,
titles, metrics or skills. Put anything the candidate should add themselves into
"suggestions" instead.

## Job description
{job_description}

## CV
{cv_content}
"#;

/// Fills both placeholders in a single pass over the template, so braces in
/// user-supplied text are never expanded.
pub fn build_enhancement_prompt(cv_content: &str, job_description: &str) -> String {
    let mut prompt = String::with_capacity(
        ENHANCEMENT_PROMPT_TEMPLATE.len() + cv_content.len() + job_description.len(),
    );
    let mut rest = ENHANCEMENT_PROMPT_TEMPLATE;
    while let Some(open) = rest.find('{') {
        prompt.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{job_description}") {
            prompt.push_str(job_description);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{cv_content}") {
            prompt.push_str(cv_content);
            rest = after;
        } else {
            prompt.push('{');
            rest = &tail[1..];
        }
    }
    prompt.push_str(rest);
    prompt
}
