use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub provider: String,
    pub id: String,
    #[serde(alias = "context_window")]
    pub context_window: u32,
    #[serde(default, alias = "max_output_tokens")]
    pub max_output_tokens: Option<u32>,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, id: impl Into<String>, context_window: u32) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
            context_window,
            max_output_tokens: None,
        }
    }
}

/// Known provider/model pairs and their context windows.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl ModelCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut catalog = Self::empty();
        for (provider, id, context_window, max_output) in BUILTIN_MODELS {
            catalog.insert(ModelSpec {
                provider: (*provider).to_string(),
                id: (*id).to_string(),
                context_window: *context_window,
                max_output_tokens: Some(*max_output),
            });
        }
        catalog
    }

    /// Adds or replaces the entry for the same provider/model pair.
    pub fn insert(&mut self, spec: ModelSpec) {
        match self
            .models
            .iter_mut()
            .find(|existing| existing.provider == spec.provider && existing.id == spec.id)
        {
            Some(existing) => *existing = spec,
            None => self.models.push(spec),
        }
    }

    pub fn extend(&mut self, specs: impl IntoIterator<Item = ModelSpec>) {
        for spec in specs {
            self.insert(spec);
        }
    }

    pub fn lookup(&self, provider: &str, model: &str) -> Option<&ModelSpec> {
        self.models
            .iter()
            .find(|spec| spec.provider == provider && spec.id == model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

const BUILTIN_MODELS: &[(&str, &str, u32, u32)] = &[
    ("openai", "gpt-4o", 128_000, 16_384),
    ("openai", "gpt-4o-mini", 128_000, 16_384),
    ("openai", "gpt-4.1", 1_047_576, 32_768),
    ("openai", "o3-mini", 200_000, 100_000),
    ("anthropic", "claude-3-5-sonnet-latest", 200_000, 8_192),
    ("anthropic", "claude-3-5-haiku-latest", 200_000, 8_192),
    ("anthropic", "claude-sonnet-4-0", 200_000, 64_000),
    ("google", "gemini-2.0-flash", 1_048_576, 8_192),
    ("google", "gemini-2.5-pro", 1_048_576, 65_536),
    ("deepseek", "deepseek-chat", 64_000, 8_192),
    ("deepseek", "deepseek-reasoner", 64_000, 8_192),
    ("ollama", "llama3.1", 128_000, 4_096),
];
