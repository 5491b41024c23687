use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Provider {
    OpenAi,
    Gemini,
    OpenRouter,
    Ollama,
}

impl Provider {
    /// Env key holding this provider's API key, if it needs one.
    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::OpenRouter => Some("OPENROUTER_API_KEY"),
            Provider::Ollama => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::OpenAi => "OpenAI",
            Provider::Gemini => "Gemini",
            Provider::OpenRouter => "OpenRouter",
            Provider::Ollama => "Ollama",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub provider: Provider,
    pub name: &'static str,
}

/// Models the compute node can serve, in picker order.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<Model>,
}

const OPENAI_MODELS: &[&str] = &["gpt-4-turbo", "gpt-4o", "gpt-4o-mini", "o1-mini", "o1-preview"];

const GEMINI_MODELS: &[&str] = &[
    "gemini-1.0-pro",
    "gemini-1.5-pro",
    "gemini-1.5-pro-exp-0827",
    "gemini-1.5-flash",
    "gemini-2.0-flash-exp",
    "gemma-2-2b-it",
    "gemma-2-9b-it",
    "gemma-2-27b-it",
];

const OPENROUTER_MODELS: &[&str] = &[
    "meta-llama/llama-3.1-8b-instruct",
    "meta-llama/llama-3.1-70b-instruct",
    "meta-llama/llama-3.1-405b-instruct",
    "meta-llama/llama-3.1-70b-instruct:free",
    "meta-llama/llama-3.3-70b-instruct",
    "anthropic/claude-3.5-sonnet:beta",
    "anthropic/claude-3-5-haiku-20241022:beta",
    "qwen/qwen-2.5-72b-instruct",
    "qwen/qwen-2.5-7b-instruct",
    "qwen/qwen-2.5-coder-32b-instruct",
    "qwen/qwq-32b-preview",
    "deepseek/deepseek-chat",
    "nousresearch/hermes-3-llama-3.1-405b",
    "nvidia/llama-3.1-nemotron-70b-instruct",
];

const OLLAMA_MODELS: &[&str] = &[
    "finalend/hermes-3-llama-3.1:8b-q8_0",
    "phi3:14b-medium-4k-instruct-q4_1",
    "phi3:14b-medium-128k-instruct-q4_1",
    "phi3.5:3.8b",
    "phi3.5:3.8b-mini-instruct-fp16",
    "gemma2:9b-instruct-q8_0",
    "gemma2:9b-instruct-fp16",
    "llama3.1:latest",
    "llama3.1:8b-instruct-q8_0",
    "llama3.1:8b-instruct-fp16",
    "llama3.1:8b-text-q4_K_M",
    "llama3.1:8b-text-q8_0",
    "llama3.1:70b-instruct-q4_0",
    "llama3.1:70b-instruct-q8_0",
    "llama3.1:70b-text-q4_0",
    "llama3.3:70b",
    "llama3.2:1b",
    "llama3.2:1b-text-q4_K_M",
    "llama3.2:3b",
    "qwen2.5:7b-instruct-q5_0",
    "qwen2.5:7b-instruct-fp16",
    "qwen2.5:32b-instruct-fp16",
    "qwen2.5-coder:1.5b",
    "qwen2.5-coder:7b-instruct",
    "qwen2.5-coder:7b-instruct-q8_0",
    "qwen2.5-coder:7b-instruct-fp16",
    "qwq",
    "deepseek-coder:6.7b",
    "mixtral:8x7b",
];

impl Default for ModelCatalog {
    fn default() -> Self {
        let groups = [
            (Provider::OpenAi, OPENAI_MODELS),
            (Provider::Gemini, GEMINI_MODELS),
            (Provider::OpenRouter, OPENROUTER_MODELS),
            (Provider::Ollama, OLLAMA_MODELS),
        ];
        let models = groups
            .into_iter()
            .flat_map(|(provider, names)| {
                names.iter().copied().map(move |name| Model { provider, name })
            })
            .collect();
        Self { models }
    }
}

/// Result of parsing a comma separated list of picker IDs.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub models: Vec<Model>,
    pub invalid: Vec<String>,
}

impl Selection {
    pub fn to_csv(&self) -> String {
        self.models
            .iter()
            .map(|m| m.name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl ModelCatalog {
    pub fn find(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Providers used by a comma separated model list. Unknown names are ignored.
    pub fn providers_for(&self, csv: &str) -> BTreeSet<Provider> {
        csv.split(',')
            .map(str::trim)
            .filter_map(|name| self.find(name))
            .map(|m| m.provider)
            .collect()
    }

    /// Renders the picker table with 1-based IDs.
    pub fn render_table(&self) -> String {
        const ID_WIDTH: usize = 4;
        const PROVIDER_WIDTH: usize = 10;
        const NAME_WIDTH: usize = 50;

        let separator = format!(
            "+{}+{}+{}+",
            "-".repeat(ID_WIDTH + 2),
            "-".repeat(PROVIDER_WIDTH + 2),
            "-".repeat(NAME_WIDTH + 2)
        );
        let mut out = String::new();
        out.push_str(&separator);
        out.push('\n');
        out.push_str(&format!(
            "| {:<ID_WIDTH$} | {:<PROVIDER_WIDTH$} | {:<NAME_WIDTH$} |\n",
            "ID", "Provider", "Name"
        ));
        out.push_str(&separator);
        out.push('\n');
        for (idx, model) in self.models.iter().enumerate() {
            out.push_str(&format!(
                "| {:<ID_WIDTH$} | {:<PROVIDER_WIDTH$} | {:<NAME_WIDTH$} |\n",
                idx + 1,
                model.provider.to_string(),
                model.name
            ));
        }
        out.push_str(&separator);
        out
    }

    /// Parses picker input such as `1,2,4`. Duplicates are ignored; blanks,
    /// non-numbers and out-of-range IDs are reported once each.
    pub fn parse_selection(&self, input: &str) -> Selection {
        let mut selection = Selection::default();
        let mut picked = BTreeSet::new();

        for raw in input.split(',').map(str::trim) {
            if raw.is_empty() || selection.invalid.iter().any(|i| i == raw) {
                continue;
            }
            match raw.parse::<usize>() {
                Ok(id) if id >= 1 && id <= self.models.len() => {
                    if picked.insert(id) {
                        selection.models.push(self.models[id - 1]);
                    }
                }
                _ => selection.invalid.push(raw.to_string()),
            }
        }

        selection
    }
}

#[cfg(test)]
mod tests {
    use super::{ModelCatalog, Provider};

    #[test]
    fn selection_ignores_duplicates_and_reports_invalid_ids() {
        let catalog = ModelCatalog::default();
        let selection = catalog.parse_selection("2,2,x,0,9999,1,x,");

        assert_eq!(selection.to_csv(), "gpt-4o,gpt-4-turbo");
        assert_eq!(selection.invalid, vec!["x", "0", "9999"]);
    }

    #[test]
    fn ids_cross_provider_boundaries_in_catalog_order() {
        let catalog = ModelCatalog::default();
        let first_gemini = super::OPENAI_MODELS.len() + 1;
        let selection = catalog.parse_selection(&first_gemini.to_string());

        assert_eq!(selection.models[0].provider, Provider::Gemini);
        assert_eq!(selection.models[0].name, "gemini-1.0-pro");
    }

    #[test]
    fn providers_for_picks_up_each_known_model() {
        let catalog = ModelCatalog::default();
        let providers = catalog.providers_for("gpt-4o, llama3.1:latest,unknown-model");

        assert!(providers.contains(&Provider::OpenAi));
        assert!(providers.contains(&Provider::Ollama));
        assert!(!providers.contains(&Provider::Gemini));
    }

    #[test]
    fn table_lists_every_model() {
        let catalog = ModelCatalog::default();
        let table = catalog.render_table();
        assert!(table.contains("| 1    | OpenAI     | gpt-4-turbo"));
        assert!(table.contains("mixtral:8x7b"));
    }
}
