//! # Configuration Helpers
//!
//! Convenience utilities for pointing the reference transport adapter at
//! the usual local inference servers. They only resolve endpoint URLs and
//! model names; everything else is configured on the request or the
//! middleware itself.
//!
//! ## Environment Variables
//!
//! - `MIDSTREAM_BASE_URL`: override the base URL for any provider
//! - `MIDSTREAM_MODEL`: override the model name (when `prefer_env` is true)
//!
//! ## Examples
//!
//! ```rust
//! use midstream::{Provider, get_base_url, get_model};
//!
//! let url = get_base_url(Some(Provider::Ollama), None);
//! assert!(url.starts_with("http://localhost:11434"));
//!
//! let model = get_model(Some("llama3:8b"), false);
//! assert_eq!(model.as_deref(), Some("llama3:8b"));
//! ```

use std::env;
use std::str::FromStr;

/// Supported local LLM server providers.
///
/// | Provider | Default URL | Description |
/// |----------|-------------|-------------|
/// | LMStudio | http://localhost:1234/v1 | GUI-based local server |
/// | Ollama | http://localhost:11434/v1 | CLI-focused server |
/// | LlamaCpp | http://localhost:8080/v1 | C++ inference engine |
/// | VLLM | http://localhost:8000/v1 | High-performance server |
///
/// All of them expose the OpenAI-compatible chat API the reference adapter
/// speaks, so they are interchangeable from the middleware's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    LMStudio,
    Ollama,
    LlamaCpp,
    VLLM,
}

impl Provider {
    /// Default base URL where this provider's server typically runs.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LlamaCpp => "http://localhost:8080/v1",
            Provider::VLLM => "http://localhost:8000/v1",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(Provider::LMStudio),
            "ollama" => Ok(Provider::Ollama),
            "llamacpp" | "llama-cpp" | "llama_cpp" | "llama.cpp" => Ok(Provider::LlamaCpp),
            "vllm" => Ok(Provider::VLLM),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Resolve the base URL: explicit override, then `MIDSTREAM_BASE_URL`,
/// then the provider default, then LM Studio's default.
pub fn get_base_url(provider: Option<Provider>, explicit: Option<&str>) -> String {
    if let Some(url) = explicit {
        return url.to_string();
    }
    if let Ok(url) = env::var("MIDSTREAM_BASE_URL") {
        if !url.is_empty() {
            return url;
        }
    }
    provider
        .unwrap_or(Provider::LMStudio)
        .default_base_url()
        .to_string()
}

/// Resolve the model name. With `prefer_env`, `MIDSTREAM_MODEL` wins over
/// the explicit value.
pub fn get_model(explicit: Option<&str>, prefer_env: bool) -> Option<String> {
    let env_model = env::var("MIDSTREAM_MODEL").ok().filter(|m| !m.is_empty());
    if prefer_env {
        env_model.or_else(|| explicit.map(String::from))
    } else {
        explicit.map(String::from).or(env_model)
    }
}
