// Model Prompt Templates & Parsing
// Prompts for the planner, page summarizer, section writer and critic, plus
// tolerant JSON extraction: models are asked for strict JSON but callers
// survive fenced blocks, wrapper objects and plain prose.

use serde::Deserialize;

use crate::types::{Note, SectionKey};

/// Fallback step used when the planner output cannot be parsed.
pub const FALLBACK_STEP_TITLE: &str = "Perform initial web research";
pub const FALLBACK_TOOL_HINT: &str = "searxng";

// ============================================================================
// Parsed shapes
// ============================================================================

/// A step proposed by the planner.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedStep {
    pub title: String,
    #[serde(default)]
    pub tool_hint: Option<String>,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub theme: Option<String>,
}

/// One page note emitted by the summarizer.
#[derive(Debug, Clone, Deserialize)]
pub struct PageNote {
    #[serde(default)]
    pub url: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub importance: Option<i64>,
}

/// Full summarizer response.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerOutput {
    #[serde(default)]
    pub page_notes: Vec<PageNote>,
    #[serde(default)]
    pub step_summary: Option<String>,
}

/// Critic response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CriticOutput {
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub follow_up: Vec<String>,
    #[serde(default)]
    pub limitations: String,
}

impl CriticOutput {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty() && self.follow_up.is_empty() && self.limitations.trim().is_empty()
    }
}

// ============================================================================
// Prompt builders
// ============================================================================

pub fn build_planner_prompt(question: &str, max_steps: u32, prior_context: &str) -> String {
    let context_section = if prior_context.trim().is_empty() {
        String::new()
    } else {
        format!("\n## Prior Findings\n{}\n", prior_context)
    };

    format!(
        r#"You are the planning stage of a deep-research pipeline.

## Research Question
{question}

{context_section}
## Your Task
Propose an ordered list of investigative steps. Each step should target one
angle of the question and be answerable with a web search.

## Output Format
You MUST output a valid JSON array. Each element must have:
- "title": short step title
- "objective": the concrete search objective for this step
- "tool_hint": preferred search tool ("searxng" or "workflow"), optional

Example:
```json
[
  {{"title": "Regulatory landscape", "objective": "current EU AI Act obligations for providers", "tool_hint": "searxng"}},
  {{"title": "Industry response", "objective": "how model providers adapted compliance programs"}}
]
```

## Rules
1. Maximum {max_steps} steps
2. Order from broad orientation to specific follow-ups
3. Output ONLY the JSON array, no other text."#,
        question = question,
        context_section = context_section,
        max_steps = max_steps,
    )
}

pub fn build_expansion_prompt(
    question: &str,
    iteration: u32,
    step_summaries: &str,
    max_steps: u32,
) -> String {
    format!(
        r#"You are the planning stage of a deep-research pipeline, reviewing coverage
after research round {iteration}.

## Research Question
{question}

## Findings So Far
{step_summaries}

## Your Task
Propose follow-up investigative steps ONLY for genuine gaps in the findings.
If coverage is sufficient, output an empty JSON array: []

## Output Format
A JSON array of {{"title", "objective", "tool_hint"}} objects, at most
{max_steps} entries. Output ONLY the JSON array."#,
        iteration = iteration,
        question = question,
        step_summaries = step_summaries,
        max_steps = max_steps,
    )
}

pub fn build_summarizer_prompt(question: &str, objective: &str, pages: &str) -> String {
    format!(
        r#"You are the summarization stage of a deep-research pipeline.

## Research Question
{question}

## Step Objective
{objective}

## Retrieved Pages
{pages}

## Your Task
Summarize each page with respect to the objective, then write one short
summary of what this step established overall.

## Output Format
You MUST output a JSON object:
{{
  "page_notes": [
    {{"url": "https://...", "summary": "key facts from this page", "importance": 1-5}}
  ],
  "step_summary": "what this step established"
}}

Rate importance 1 (background) to 5 (directly answers the question).
Output ONLY the JSON object."#,
        question = question,
        objective = objective,
        pages = pages,
    )
}

pub fn build_section_prompt(question: &str, section: SectionKey, notes: &str) -> String {
    format!(
        r#"You are writing the "{heading}" section of a research report.

## Research Question
{question}

## Evidence Notes
Each note ends with its citation markers, e.g. [1][4].
{notes}

## Rules
1. Write flowing prose for the "{heading}" section only, no heading line
2. Keep every citation marker [n] attached to the claims it supports
3. Do not invent citations or facts beyond the notes

Write the section now."#,
        heading = section.heading(),
        question = question,
        notes = notes,
    )
}

pub fn build_synthesis_prompt(question: &str, notes: &str) -> String {
    format!(
        r#"You are the synthesis stage of a deep-research pipeline.

## Research Question
{question}

## Evidence Notes
{notes}

## Your Task
Write a structured markdown research report answering the question from the
evidence: an executive summary, the key findings, and recommendations.
Reference evidence with citation markers [n] where the notes carry them.

Write the report now."#,
        question = question,
        notes = notes,
    )
}

pub fn build_critic_prompt(draft: &str, notes: &str) -> String {
    format!(
        r#"You are the critic stage of a deep-research pipeline. Review the draft
report against the evidence notes.

## Draft Report
{draft}

## Evidence Notes
{notes}

## Output Format
You MUST output a JSON object:
{{
  "issues": ["unsupported or contradicted claims"],
  "follow_up": ["research questions still open"],
  "limitations": "short paragraph on coverage gaps and confidence"
}}

Be strict but fair. Output ONLY the JSON object."#,
        draft = draft,
        notes = notes,
    )
}

/// Render notes for a synthesis or critic prompt.
pub fn render_notes(notes: &[Note]) -> String {
    let mut out = String::new();
    for note in notes {
        out.push_str(&format!(
            "- [{}] (importance {}) {}\n",
            note.role.as_str(),
            note.importance,
            note.content
        ));
    }
    out
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_plan(output: &str) -> Option<Vec<PlannedStep>> {
    #[derive(Deserialize)]
    struct WrappedSteps {
        steps: Vec<PlannedStep>,
    }
    #[derive(Deserialize)]
    struct WrappedPlan {
        plan: Vec<PlannedStep>,
    }

    let parse = |raw: &str| -> Option<Vec<PlannedStep>> {
        if let Ok(steps) = serde_json::from_str::<Vec<PlannedStep>>(raw) {
            return Some(steps);
        }
        if let Ok(wrapped) = serde_json::from_str::<WrappedSteps>(raw) {
            return Some(wrapped.steps);
        }
        if let Ok(wrapped) = serde_json::from_str::<WrappedPlan>(raw) {
            return Some(wrapped.plan);
        }
        None
    };

    if let Some(steps) = parse(output) {
        return Some(normalize_plan(steps));
    }
    for candidate in json_candidates(output) {
        if let Some(steps) = parse(&candidate) {
            return Some(normalize_plan(steps));
        }
    }
    None
}

fn normalize_plan(steps: Vec<PlannedStep>) -> Vec<PlannedStep> {
    steps
        .into_iter()
        .filter_map(|mut step| {
            step.title = step.title.trim().to_string();
            step.objective = step.objective.trim().to_string();
            if step.title.is_empty() {
                return None;
            }
            if step.objective.is_empty() {
                step.objective = step.title.clone();
            }
            step.tool_hint = step
                .tool_hint
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty());
            Some(step)
        })
        .collect()
}

/// The one-step plan used when the planner output is unusable.
pub fn fallback_plan(question: &str) -> Vec<PlannedStep> {
    vec![PlannedStep {
        title: FALLBACK_STEP_TITLE.to_string(),
        tool_hint: Some(FALLBACK_TOOL_HINT.to_string()),
        objective: question.to_string(),
        theme: None,
    }]
}

pub fn parse_summary(output: &str) -> Option<SummarizerOutput> {
    if let Ok(parsed) = serde_json::from_str::<SummarizerOutput>(output) {
        if !parsed.page_notes.is_empty() || parsed.step_summary.is_some() {
            return Some(parsed);
        }
    }
    for candidate in json_candidates(output) {
        if let Ok(parsed) = serde_json::from_str::<SummarizerOutput>(&candidate) {
            if !parsed.page_notes.is_empty() || parsed.step_summary.is_some() {
                return Some(parsed);
            }
        }
    }
    None
}

pub fn parse_critic(output: &str) -> Option<CriticOutput> {
    if let Ok(parsed) = serde_json::from_str::<CriticOutput>(output) {
        return Some(parsed);
    }
    for candidate in json_candidates(output) {
        if let Ok(parsed) = serde_json::from_str::<CriticOutput>(&candidate) {
            return Some(parsed);
        }
    }
    None
}

/// Candidate JSON payloads inside model prose: fenced blocks first, then the
/// outermost bracket/brace spans.
fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();

    for marker in ["```json", "```JSON", "```"] {
        if let Some(start) = output.find(marker) {
            let after = &output[start + marker.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    out.push(block.to_string());
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (output.find('['), output.rfind(']')) {
        if start <= end {
            out.push(output[start..=end].to_string());
        }
    }
    if let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) {
        if start <= end {
            out.push(output[start..=end].to_string());
        }
    }

    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_bare_array() {
        let output = r#"[
            {"title": "Landscape", "objective": "map the field", "tool_hint": "searxng"},
            {"title": "Deep dive", "objective": "follow the strongest lead"}
        ]"#;
        let steps = parse_plan(output).expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].tool_hint.as_deref(), Some("searxng"));
        assert!(steps[1].tool_hint.is_none());
    }

    #[test]
    fn parse_plan_fenced_with_prose() {
        let output = r#"Here is my plan:
```json
[{"title": "Only step", "objective": "do the thing"}]
```
Good luck!"#;
        let steps = parse_plan(output).expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].title, "Only step");
    }

    #[test]
    fn parse_plan_wrapped_object() {
        let output = r#"{"steps": [{"title": "A", "objective": "a"}]}"#;
        assert_eq!(parse_plan(output).unwrap().len(), 1);

        let output = r#"{"plan": [{"title": "B", "objective": "b"}]}"#;
        assert_eq!(parse_plan(output).unwrap().len(), 1);
    }

    #[test]
    fn parse_plan_rejects_prose() {
        assert!(parse_plan("I would start by searching the web.").is_none());
    }

    #[test]
    fn empty_objective_falls_back_to_title() {
        let output = r#"[{"title": "Market sizing"}]"#;
        let steps = parse_plan(output).unwrap();
        assert_eq!(steps[0].objective, "Market sizing");
    }

    #[test]
    fn fallback_plan_shape() {
        let steps = fallback_plan("what is happening");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].title, FALLBACK_STEP_TITLE);
        assert_eq!(steps[0].tool_hint.as_deref(), Some(FALLBACK_TOOL_HINT));
        assert_eq!(steps[0].objective, "what is happening");
    }

    #[test]
    fn parse_summary_full_shape() {
        let output = r#"{
            "page_notes": [
                {"url": "https://a", "summary": "fact one", "importance": 4},
                {"summary": "fact two"}
            ],
            "step_summary": "established the basics"
        }"#;
        let parsed = parse_summary(output).expect("summary");
        assert_eq!(parsed.page_notes.len(), 2);
        assert_eq!(parsed.page_notes[0].importance, Some(4));
        assert!(parsed.page_notes[1].url.is_none());
        assert_eq!(parsed.step_summary.as_deref(), Some("established the basics"));
    }

    #[test]
    fn parse_summary_rejects_prose_and_empty() {
        assert!(parse_summary("The page talks about many things.").is_none());
        assert!(parse_summary("{}").is_none());
    }

    #[test]
    fn parse_critic_tolerates_fences() {
        let output = r#"```json
{"issues": ["claim X unsupported"], "follow_up": [], "limitations": "thin coverage of Y"}
```"#;
        let parsed = parse_critic(output).expect("critic");
        assert_eq!(parsed.issues.len(), 1);
        assert_eq!(parsed.limitations, "thin coverage of Y");
        assert!(!parsed.is_empty());
    }

    #[test]
    fn critic_empty_detection() {
        let parsed = parse_critic(r#"{"issues": [], "follow_up": [], "limitations": "  "}"#)
            .expect("critic");
        assert!(parsed.is_empty());
    }
}
