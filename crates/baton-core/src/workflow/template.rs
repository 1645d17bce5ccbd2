//! Prompt rendering for delegated work.

use std::collections::HashMap;

/// Values available to a prompt template.
pub struct PromptContext<'a> {
    pub query: &'a str,
    pub item: Option<&'a str>,
    /// Text form of the step's input artifacts, one per line as `${inputs}`.
    pub inputs: &'a [String],
    pub variables: &'a HashMap<String, String>,
}

/// Render a step's prompt template.
///
/// Without a template the prompt is the fan-out item, or the step's query
/// for single delegations.
pub fn render_prompt(template: Option<&str>, ctx: &PromptContext<'_>) -> String {
    let Some(template) = template else {
        return ctx.item.unwrap_or(ctx.query).to_string();
    };

    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            match key {
                "query" => ctx.query.to_string(),
                "item" => ctx
                    .item
                    .map(str::to_string)
                    .unwrap_or_else(|| "${item}".to_string()),
                "inputs" => ctx.inputs.join("\n"),
                _ => {
                    if let Some(var) = key.strip_prefix("variables.") {
                        if let Some(v) = ctx.variables.get(var) {
                            return v.clone();
                        }
                    }
                    ctx.variables
                        .get(key)
                        .cloned()
                        .or_else(|| std::env::var(key).ok())
                        .unwrap_or_else(|| format!("${{{}}}", key))
                }
            }
        })
        .to_string()
}

fn placeholder_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid regex"))
}
