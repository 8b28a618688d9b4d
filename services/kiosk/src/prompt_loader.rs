use anyhow::{Context, Result, bail};
use kiosk_core::intent::DEFAULT_INTENT_PROMPT;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// File stem of the classifier prompt inside the prompts directory.
pub const INTENT_PROMPT_KEY: &str = "classify_intent";

const REQUIRED_INTENT_PLACEHOLDERS: [&str; 2] = ["{input}", "{commands}"];

/// Reads every `.md` file in `dir_path`, keyed by file stem.
pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("md") {
            continue;
        }

        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Could not get file stem for prompt file")?
            .to_string();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
        prompts.insert(key, content);
    }

    Ok(prompts)
}

/// Prompt templates used by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSet {
    pub intent: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            intent: DEFAULT_INTENT_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    /// Loads overrides from `dir_path`, falling back to the built-in prompts
    /// when the directory or a file is absent. A present but unusable
    /// template is an error.
    pub fn load(dir_path: &Path) -> Result<Self> {
        if !dir_path.is_dir() {
            tracing::warn!(
                "Prompts directory {} not found, using built-in prompts",
                dir_path.display()
            );
            return Ok(Self::default());
        }

        let mut prompts = load_prompts(dir_path)?;
        let intent = match prompts.remove(INTENT_PROMPT_KEY) {
            Some(template) => {
                validate_intent_prompt(&template)?;
                template
            }
            None => {
                tracing::debug!("No {}.md, using the built-in classifier prompt", INTENT_PROMPT_KEY);
                DEFAULT_INTENT_PROMPT.to_string()
            }
        };
        for unused in prompts.keys() {
            tracing::debug!("Ignoring unused prompt {:?}", unused);
        }

        Ok(Self { intent })
    }
}

fn validate_intent_prompt(template: &str) -> Result<()> {
    for placeholder in REQUIRED_INTENT_PLACEHOLDERS {
        if !template.contains(placeholder) {
            bail!("{}.md is missing the {} placeholder", INTENT_PROMPT_KEY, placeholder);
        }
    }
    Ok(())
}
