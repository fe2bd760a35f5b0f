//! Named system prompt presets
//!
//! Built-in presets are fixed; custom presets can be added and removed at
//! runtime.

use super::errors::{ChatError, ChatResult};
use std::collections::BTreeMap;

/// Preset applied to new sessions
pub const DEFAULT_PRESET: &str = "general";

/// Switches kept per session
pub const PRESET_HISTORY_LIMIT: usize = 10;

const BUILTIN_PRESETS: &[(&str, &str)] = &[
    ("general", "You are Claude, a helpful AI assistant."),
    (
        "code_review",
        "You are a skilled software developer reviewing and improving code. \
         Identify bugs, suggest optimizations and point out departures from good practice. \
         Explain clearly and give concrete code examples.",
    ),
    (
        "teacher",
        "You are an expert teacher who explains complex concepts in simple terms. \
         Break difficult topics into understandable parts and use relevant examples. \
         Encourage questions and explain step by step.",
    ),
    (
        "translator",
        "You are a professional translator fluent in many languages. \
         Translate accurately while keeping context and nuance. \
         Explain cultural context when it matters.",
    ),
    (
        "writer",
        "You are a creative writer at home in many styles and formats. \
         Help with writing, editing and improving text. \
         Give constructive feedback and suggestions.",
    ),
];

/// Lookup table of presets
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    custom: BTreeMap<String, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptLibrary {
    pub fn new() -> Self {
        Self {
            custom: BTreeMap::new(),
        }
    }

    pub fn is_builtin(name: &str) -> bool {
        BUILTIN_PRESETS.iter().any(|(n, _)| *n == name)
    }

    /// Prompt text for a preset, built-ins first
    pub fn get(&self, name: &str) -> Option<&str> {
        BUILTIN_PRESETS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, prompt)| *prompt)
            .or_else(|| self.custom.get(name).map(String::as_str))
    }

    /// The prompt every new session starts with
    pub fn default_prompt(&self) -> &str {
        self.get(DEFAULT_PRESET).unwrap_or_default()
    }

    /// All preset names, built-ins in fixed order followed by custom ones
    pub fn names(&self) -> Vec<&str> {
        BUILTIN_PRESETS
            .iter()
            .map(|(n, _)| *n)
            .chain(self.custom.keys().map(String::as_str))
            .collect()
    }

    /// Add or replace a custom preset
    pub fn add_custom(&mut self, name: &str, prompt: &str) -> ChatResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidParameters(
                "preset name must not be empty".into(),
            ));
        }
        if Self::is_builtin(name) {
            return Err(ChatError::InvalidParameters(format!(
                "cannot overwrite built-in preset '{}'",
                name
            )));
        }
        if prompt.trim().is_empty() {
            return Err(ChatError::InvalidParameters(format!(
                "preset '{}' has an empty prompt",
                name
            )));
        }
        self.custom.insert(name.to_string(), prompt.to_string());
        tracing::debug!(preset = name, "Custom preset added");
        Ok(())
    }

    pub fn remove_custom(&mut self, name: &str) -> ChatResult<()> {
        if Self::is_builtin(name) {
            return Err(ChatError::InvalidParameters(format!(
                "cannot remove built-in preset '{}'",
                name
            )));
        }
        match self.custom.remove(name) {
            Some(_) => Ok(()),
            None => Err(ChatError::InvalidParameters(format!(
                "unknown preset '{}'",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_present() {
        let library = PromptLibrary::new();
        assert_eq!(
            library.names(),
            vec!["general", "code_review", "teacher", "translator", "writer"]
        );
        assert!(library.default_prompt().contains("helpful"));
        assert!(library.get("teacher").unwrap().contains("teacher"));
        assert!(library.get("missing").is_none());
    }

    #[test]
    fn test_custom_presets() {
        let mut library = PromptLibrary::new();
        library.add_custom("pirate", "Answer like a pirate.").unwrap();
        assert_eq!(library.get("pirate"), Some("Answer like a pirate."));
        assert_eq!(library.names().last(), Some(&"pirate"));

        library.remove_custom("pirate").unwrap();
        assert!(library.get("pirate").is_none());
        assert!(library.remove_custom("pirate").is_err());
    }

    #[test]
    fn test_builtins_are_protected() {
        let mut library = PromptLibrary::new();
        let err = library.add_custom("general", "override").unwrap_err();
        assert!(matches!(err, ChatError::InvalidParameters(_)));
        assert!(library.remove_custom("writer").is_err());
        assert!(library.add_custom("  ", "x").is_err());
        assert!(library.add_custom("blank", " ").is_err());
    }
}
