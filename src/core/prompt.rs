//! Prompt construction and tolerant parsing of batch responses

use serde_json::Value;

use crate::core::config::PromptTemplates;
use crate::core::config::DEFAULT_TARGET_LANG;
use crate::core::models::{BatchItem, BatchPolicy, Glossary, Task};

const SYSTEM_TEXT: &str = "You are a helpful assistant.";

fn default_template(task: Task) -> &'static str {
    match task {
        Task::Translate => {
            "Translate the following content to {{targetLang}}. Return the translation only.\n\n{{text}}"
        }
        Task::Summarize => {
            "Summarize the following content in {{targetLang}} with concise bullet points.\n\n{{text}}"
        }
        Task::Rewrite => {
            "Rewrite the following content in {{targetLang}}, keeping the original meaning.\n\n{{text}}"
        }
        Task::Polish => "Polish the following content in {{targetLang}} to improve fluency.\n\n{{text}}",
        Task::Chat => "Provide a helpful answer for the following content:\n\n{{text}}",
    }
}

/// Render the prompt for a single-shot task
pub fn make_prompt(task: Task, text: &str, target_lang: &str, templates: &PromptTemplates) -> String {
    let target = match target_lang.trim() {
        "" => DEFAULT_TARGET_LANG,
        lang => lang,
    };
    let template = templates
        .for_task(task)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| default_template(task));

    template
        .replace("{{targetLang}}", target)
        .replace("{{text}}", text.trim())
}

/// Fold the system text into the user turn; some models reject system roles
pub fn make_user_message(prompt: &str) -> String {
    format!("{}\n\n{}", SYSTEM_TEXT, prompt)
}

/// Build the JSON-array batch translation prompt
pub fn build_batch_prompt(
    items: &[BatchItem],
    target_lang: &str,
    policy: &BatchPolicy,
    glossary: Option<&Glossary>,
) -> String {
    let mut rules = vec![
        "Output a JSON array only, with no explanation, prefix or suffix.".to_string(),
        r#"Each element must be exactly {"id": string, "text": string}, in the same order as the input."#
            .to_string(),
    ];
    if policy.preserve_placeholders {
        rules.push("Keep placeholders such as __VAR_1__, {name} and %s exactly as they are.".to_string());
    }
    if policy.preserve_numbers {
        rules.push("Keep every number and its formatting.".to_string());
    }
    if policy.is_strict() {
        rules.push("Do not use code fences such as ```json and do not output blank lines or extra characters.".to_string());
        rules.push("If an item cannot be translated, return its text unchanged.".to_string());
    }

    let mut lines = vec![
        "You are a machine translation engine that strictly follows the output format.".to_string(),
        format!("Translate the text of every element in items to {}.", target_lang),
        format!("Output rules: {}", rules.join(" ")),
    ];

    if let Some(glossary) = glossary.filter(|g| !g.is_empty()) {
        lines.push("Glossary:".to_string());
        if !glossary.not_translate.is_empty() {
            lines.push(format!("Do not translate: {}", glossary.not_translate.join(", ")));
        }
        if !glossary.terms.is_empty() {
            let terms = serde_json::to_string(&glossary.terms).unwrap_or_default();
            lines.push(format!("Term mapping: {}", terms));
        }
    }

    let compact = serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".to_string());
    format!("{}\n\nitems:\n{}", lines.join("\n"), compact)
}

/// Strip one leading and one trailing markdown code fence
fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = match rest.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
            _ => rest,
        };
        text = rest.trim_start();
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    text
}

/// Extract `{id, text}` pairs from a vendor reply.
///
/// Tolerates code fences and prose around the array by slicing from the
/// first `[` to the last `]`. Elements without string `id` and `text` are
/// skipped; an unparseable reply yields an empty list.
pub fn extract_json_array(raw: &str) -> Vec<BatchItem> {
    let text = strip_fences(raw);
    let slice = match (text.find('['), text.rfind(']')) {
        (Some(first), Some(last)) if last >= first => &text[first..=last],
        _ => text,
    };

    let values: Vec<Value> = match serde_json::from_str::<Value>(slice) {
        Ok(Value::Array(values)) => values,
        _ => return vec![],
    };

    values
        .into_iter()
        .filter_map(|value| {
            let id = match value.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let text = value.get("text")?.as_str()?.to_string();
            Some(BatchItem { id, text })
        })
        .collect()
}
