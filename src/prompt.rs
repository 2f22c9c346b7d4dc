use serde::{Deserialize, Serialize};

pub const DEFAULT_PORTRAIT_PROMPT: &str = "Transform this photo into a professional studio portrait of a {gender}, \
soft natural lighting, sharp focus on the face, high detail, photorealistic";

const GENDER_PLACEHOLDERS: &[&str] = &["{{gender}}", "{gender}"];
const DEFAULT_SUBJECT: &str = "person";

/// A named prompt template the user picks to steer generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub category: String,
    pub prompt_template: String,
}

/// Renders the final prompt for a scene (or the default portrait prompt).
///
/// Every gender placeholder is substituted. A supplied gender always ends up
/// in the prompt, even when the template has no placeholder for it.
pub fn build_prompt(scene: Option<&Scene>, gender: Option<&str>) -> String {
    let template = scene
        .map(|scene| scene.prompt_template.trim())
        .filter(|template| !template.is_empty())
        .unwrap_or(DEFAULT_PORTRAIT_PROMPT);
    let gender = gender.map(str::trim).filter(|value| !value.is_empty());
    let subject = gender.unwrap_or(DEFAULT_SUBJECT);

    let mut prompt = template.to_string();
    for placeholder in GENDER_PLACEHOLDERS {
        prompt = prompt.replace(placeholder, subject);
    }

    if let Some(gender) = gender {
        if !contains_word(&prompt, gender) {
            let trimmed = prompt.trim_end().trim_end_matches('.');
            prompt = format!("{trimmed}. Subject: {gender}.");
        }
    }
    prompt
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let word = word.to_lowercase();
    haystack
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}
