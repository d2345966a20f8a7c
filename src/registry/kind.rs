//! Provider kinds and the per-kind upstream handling table.

use serde::{Deserialize, Serialize};

/// Vendor family of a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "vscode_proxy")]
    VsCodeProxy,
    #[serde(rename = "lmstudio")]
    LmStudio,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    /// Placeholder row; never routed.
    #[serde(rename = "none")]
    None,
}

/// How a kind maps a configured model onto an upstream request.
#[derive(Debug, Clone, Copy)]
pub struct KindProfile {
    pub default_base_url: &'static str,
    /// Path appended to the base URL for chat completions.
    pub chat_path: &'static str,
    pub requires_api_key: bool,
    pub map_model: fn(&str) -> String,
}

fn verbatim(model: &str) -> String {
    model.to_string()
}

fn claude_prefixed(model: &str) -> String {
    if model.starts_with("claude-") {
        model.to_string()
    } else {
        format!("claude-{}", model)
    }
}

fn gemini_unprefixed(model: &str) -> String {
    model.strip_prefix("gemini/").unwrap_or(model).to_string()
}

const OPENAI: KindProfile = KindProfile {
    default_base_url: "https://api.openai.com/v1",
    chat_path: "/chat/completions",
    requires_api_key: true,
    map_model: verbatim,
};

const ANTHROPIC: KindProfile = KindProfile {
    default_base_url: "https://api.anthropic.com/v1",
    chat_path: "/chat/completions",
    requires_api_key: true,
    map_model: claude_prefixed,
};

const GEMINI: KindProfile = KindProfile {
    default_base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
    chat_path: "/chat/completions",
    requires_api_key: true,
    map_model: gemini_unprefixed,
};

const OPENROUTER: KindProfile = KindProfile {
    default_base_url: "https://openrouter.ai/api/v1",
    chat_path: "/chat/completions",
    requires_api_key: true,
    map_model: verbatim,
};

const VSCODE_PROXY: KindProfile = KindProfile {
    default_base_url: "http://127.0.0.1:3000",
    chat_path: "/v1/chat/completions",
    requires_api_key: false,
    map_model: verbatim,
};

const LMSTUDIO: KindProfile = KindProfile {
    default_base_url: "http://127.0.0.1:1234/v1",
    chat_path: "/chat/completions",
    requires_api_key: false,
    map_model: verbatim,
};

const OPENAI_COMPATIBLE: KindProfile = KindProfile {
    default_base_url: "",
    chat_path: "/chat/completions",
    requires_api_key: false,
    map_model: verbatim,
};

const NONE: KindProfile = KindProfile {
    default_base_url: "",
    chat_path: "",
    requires_api_key: false,
    map_model: verbatim,
};

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::VsCodeProxy => "vscode_proxy",
            ProviderKind::LmStudio => "lmstudio",
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::None => "none",
        }
    }

    pub fn profile(&self) -> &'static KindProfile {
        match self {
            ProviderKind::OpenAi => &OPENAI,
            ProviderKind::Anthropic => &ANTHROPIC,
            ProviderKind::Gemini => &GEMINI,
            ProviderKind::OpenRouter => &OPENROUTER,
            ProviderKind::VsCodeProxy => &VSCODE_PROXY,
            ProviderKind::LmStudio => &LMSTUDIO,
            ProviderKind::OpenAiCompatible => &OPENAI_COMPATIBLE,
            ProviderKind::None => &NONE,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        self.profile().default_base_url
    }

    pub fn requires_api_key(&self) -> bool {
        self.profile().requires_api_key
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip_through_serde() {
        let kind: ProviderKind = serde_json::from_str("\"openai_compatible\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAiCompatible);
        assert_eq!(kind.as_str(), "openai_compatible");
        assert!(serde_json::from_str::<ProviderKind>("\"bedrock\"").is_err());
    }

    #[test]
    fn test_anthropic_model_gets_claude_prefix() {
        let map = ProviderKind::Anthropic.profile().map_model;
        assert_eq!(map("3-haiku-20240307"), "claude-3-haiku-20240307");
        assert_eq!(map("claude-3-haiku-20240307"), "claude-3-haiku-20240307");
    }

    #[test]
    fn test_gemini_prefix_stripped() {
        let map = ProviderKind::Gemini.profile().map_model;
        assert_eq!(map("gemini/gemini-2.0-flash"), "gemini-2.0-flash");
        assert_eq!(map("gemini-2.0-flash"), "gemini-2.0-flash");
    }

    #[test]
    fn test_local_kinds_need_no_key() {
        assert!(!ProviderKind::LmStudio.requires_api_key());
        assert!(!ProviderKind::VsCodeProxy.requires_api_key());
        assert!(ProviderKind::OpenAi.requires_api_key());
    }
}
