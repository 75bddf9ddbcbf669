//! Fingerprint derivation from a request key and its context.
//!
//! Only a fixed, allow-listed subset of the caller's context takes part:
//! a normalized project type, the extension of the file being worked on,
//! skill level, language, plus any extra fields named in
//! [`ContextConfig::extra_fields`](crate::config::ContextConfig). Free text
//! and volatile fields never reach the hash, so they cannot split the cache.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PROJECT_TYPE: &str = "project_type";
const FILE_EXTENSION: &str = "file_extension";
const SKILL_LEVEL: &str = "skill_level";
const LANGUAGE: &str = "language";

const BUILTIN_FIELDS: [&str; 4] = [PROJECT_TYPE, FILE_EXTENSION, SKILL_LEVEL, LANGUAGE];

/// Fields compared by the read-time compatibility gate.
const CRITICAL_FIELDS: [&str; 2] = [PROJECT_TYPE, SKILL_LEVEL];

/// Longest value (in chars) kept for any context field.
const MAX_VALUE_CHARS: usize = 128;

/// Caller-supplied request context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheContext {
    pub project_type: Option<String>,
    /// Path of the file the request is about. Only its extension is used.
    pub current_file: Option<String>,
    pub skill_level: Option<String>,
    pub language: Option<String>,
    /// Anything else the caller knows. Dropped unless allow-listed.
    pub extra: BTreeMap<String, String>,
}

impl CacheContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project_type(mut self, value: impl Into<String>) -> Self {
        self.project_type = Some(value.into());
        self
    }

    pub fn with_current_file(mut self, value: impl Into<String>) -> Self {
        self.current_file = Some(value.into());
        self
    }

    pub fn with_skill_level(mut self, value: impl Into<String>) -> Self {
        self.skill_level = Some(value.into());
        self
    }

    pub fn with_language(mut self, value: impl Into<String>) -> Self {
        self.language = Some(value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// Normalized, allow-listed context as stored alongside an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SanitizedContext(BTreeMap<String, String>);

impl SanitizedContext {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Critical fields must be absent on both sides or equal on both.
    pub fn is_compatible_with(&self, request: &SanitizedContext) -> bool {
        CRITICAL_FIELDS
            .iter()
            .all(|field| self.get(field) == request.get(field))
    }
}

/// Derives fingerprints and sanitizes context.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    extra_fields: Vec<String>,
}

impl KeyDeriver {
    /// `extra_fields` extends the built-in allow-list. Names are matched
    /// case-insensitively; names shadowing a built-in field are ignored.
    pub fn new(extra_fields: &[String]) -> Self {
        let mut extra_fields: Vec<String> = extra_fields
            .iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty() && !BUILTIN_FIELDS.contains(&f.as_str()))
            .collect();
        extra_fields.sort();
        extra_fields.dedup();
        Self { extra_fields }
    }

    /// Reduce `context` to its allow-listed, normalized fields.
    pub fn sanitize(&self, context: Option<&CacheContext>) -> SanitizedContext {
        let mut out = BTreeMap::new();
        let Some(ctx) = context else {
            return SanitizedContext(out);
        };

        if let Some(v) = ctx.project_type.as_deref().and_then(normalize_project_type) {
            out.insert(PROJECT_TYPE.to_string(), v);
        }
        if let Some(v) = ctx.current_file.as_deref().and_then(file_extension) {
            out.insert(FILE_EXTENSION.to_string(), v);
        }
        if let Some(v) = ctx.skill_level.as_deref().and_then(normalize_token) {
            out.insert(SKILL_LEVEL.to_string(), v);
        }
        if let Some(v) = ctx.language.as_deref().and_then(normalize_token) {
            out.insert(LANGUAGE.to_string(), v);
        }
        for (name, value) in &ctx.extra {
            let name = name.trim().to_lowercase();
            if !self.extra_fields.contains(&name) {
                continue;
            }
            if let Some(v) = clamp_value(value.trim()) {
                out.insert(name, v);
            }
        }
        SanitizedContext(out)
    }

    /// Fingerprint for `key` under `context`.
    ///
    /// When `context_sensitive` is off, or the context sanitizes to nothing,
    /// this is the hash of the key alone.
    pub fn derive(
        &self,
        key: &str,
        context: Option<&CacheContext>,
        context_sensitive: bool,
    ) -> String {
        if !context_sensitive {
            return fingerprint(key, &SanitizedContext::default());
        }
        fingerprint(key, &self.sanitize(context))
    }
}

/// SHA-256 over the length-prefixed key followed by the sorted context pairs.
///
/// Length prefixes keep `("a|b", {})` and `("a", {"b": ..})` apart.
pub fn fingerprint(key: &str, context: &SanitizedContext) -> String {
    let mut hasher = Sha256::new();
    update_prefixed(&mut hasher, key);
    for (name, value) in context.iter() {
        update_prefixed(&mut hasher, name);
        update_prefixed(&mut hasher, value);
    }
    hex::encode(hasher.finalize())
}

/// Request key for an LLM prompt: SHA-256 of `(model, system_prompt, user_prompt)`.
pub fn prompt_key(model: &str, system_prompt: &str, user_prompt: &str) -> String {
    let mut hasher = Sha256::new();
    update_prefixed(&mut hasher, model);
    update_prefixed(&mut hasher, system_prompt);
    update_prefixed(&mut hasher, user_prompt);
    hex::encode(hasher.finalize())
}

/// Whether `s` has the shape of a fingerprint (64 lowercase hex chars).
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn update_prefixed(hasher: &mut Sha256, part: &str) {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

/// `"React Native"` / `"react_native"` → `"react-native"`.
fn normalize_project_type(raw: &str) -> Option<String> {
    let joined = raw
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    clamp_value(&joined)
}

fn normalize_token(raw: &str) -> Option<String> {
    clamp_value(&raw.trim().to_lowercase())
}

fn file_extension(path: &str) -> Option<String> {
    let ext = Path::new(path.trim()).extension()?.to_str()?;
    clamp_value(&ext.to_lowercase())
}

fn clamp_value(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    Some(value.chars().take(MAX_VALUE_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web() -> CacheContext {
        CacheContext::new().with_project_type("web")
    }

    #[test]
    fn test_derive_deterministic() {
        let d = KeyDeriver::default();
        let a = d.derive("q", Some(&web()), true);
        let b = d.derive("q", Some(&web()), true);
        assert_eq!(a, b);
        assert!(is_fingerprint(&a));
    }

    #[test]
    fn test_relevant_context_changes_fingerprint() {
        let d = KeyDeriver::default();
        let mobile = CacheContext::new().with_project_type("mobile");
        assert_ne!(
            d.derive("q", Some(&web()), true),
            d.derive("q", Some(&mobile), true)
        );
    }

    #[test]
    fn test_irrelevant_context_ignored() {
        let d = KeyDeriver::default();
        let a = web().with_field("session_id", "abc");
        let b = web().with_field("session_id", "xyz").with_field("mood", "grumpy");
        assert_eq!(d.derive("q", Some(&a), true), d.derive("q", Some(&b), true));
    }

    #[test]
    fn test_context_ignored_when_insensitive() {
        let d = KeyDeriver::default();
        let mobile = CacheContext::new().with_project_type("mobile");
        assert_eq!(
            d.derive("q", Some(&web()), false),
            d.derive("q", Some(&mobile), false)
        );
        assert_eq!(d.derive("q", Some(&web()), false), d.derive("q", None, true));
    }

    #[test]
    fn test_absent_and_empty_context_match_key_only() {
        let d = KeyDeriver::default();
        let noise = CacheContext::new().with_field("request_id", "1");
        assert_eq!(d.derive("q", None, true), d.derive("q", Some(&noise), true));
    }

    #[test]
    fn test_only_extension_of_current_file_counts() {
        let d = KeyDeriver::default();
        let a = CacheContext::new().with_current_file("src/main.rs");
        let b = CacheContext::new().with_current_file("/other/dir/lib.RS");
        let c = CacheContext::new().with_current_file("app.ts");
        assert_eq!(d.derive("q", Some(&a), true), d.derive("q", Some(&b), true));
        assert_ne!(d.derive("q", Some(&a), true), d.derive("q", Some(&c), true));
    }

    #[test]
    fn test_project_type_normalized() {
        let d = KeyDeriver::default();
        let a = CacheContext::new().with_project_type("React Native");
        let b = CacheContext::new().with_project_type("react_native");
        let sanitized = d.sanitize(Some(&a));
        assert_eq!(sanitized.get("project_type"), Some("react-native"));
        assert_eq!(d.derive("q", Some(&a), true), d.derive("q", Some(&b), true));
    }

    #[test]
    fn test_extra_fields_require_allow_list() {
        let ctx = web().with_field("Framework", "axum");
        let plain = KeyDeriver::default();
        let allowing = KeyDeriver::new(&["framework".to_string()]);
        assert!(plain.sanitize(Some(&ctx)).get("framework").is_none());
        assert_eq!(allowing.sanitize(Some(&ctx)).get("framework"), Some("axum"));
        assert_ne!(
            plain.derive("q", Some(&ctx), true),
            allowing.derive("q", Some(&ctx), true)
        );
    }

    #[test]
    fn test_extra_field_cannot_shadow_builtin() {
        let d = KeyDeriver::new(&["project_type".to_string()]);
        let ctx = CacheContext::new().with_field("project_type", "spoofed");
        assert!(d.sanitize(Some(&ctx)).is_empty());
    }

    #[test]
    fn test_long_values_clamped() {
        let d = KeyDeriver::default();
        let ctx = CacheContext::new().with_language("x".repeat(1_000));
        let sanitized = d.sanitize(Some(&ctx));
        assert_eq!(sanitized.get("language").map(str::len), Some(MAX_VALUE_CHARS));
    }

    #[test]
    fn test_compatibility_rules() {
        let d = KeyDeriver::default();
        let none = d.sanitize(None);
        let web_s = d.sanitize(Some(&web()));
        let web_beginner = d.sanitize(Some(&web().with_skill_level("Beginner")));
        let web_rs = d.sanitize(Some(&web().with_current_file("a.rs")));

        assert!(none.is_compatible_with(&none));
        assert!(web_s.is_compatible_with(&web_s));
        assert!(!web_s.is_compatible_with(&none));
        assert!(!none.is_compatible_with(&web_s));
        assert!(!web_s.is_compatible_with(&web_beginner));
        // Non-critical fields do not gate compatibility.
        assert!(web_s.is_compatible_with(&web_rs));
    }

    #[test]
    fn test_no_separator_collision() {
        let d = KeyDeriver::default();
        let a = d.derive("a|b", None, true);
        let b = d.derive("a", Some(&CacheContext::new().with_language("b")), true);
        assert_ne!(a, b);
        assert_ne!(prompt_key("a|b", "", "c"), prompt_key("a", "b", "c"));
    }

    #[test]
    fn test_prompt_key_aware_of_each_part() {
        let base = prompt_key("gpt-4", "sys", "hello");
        assert_eq!(base, prompt_key("gpt-4", "sys", "hello"));
        assert_ne!(base, prompt_key("claude", "sys", "hello"));
        assert_ne!(base, prompt_key("gpt-4", "other", "hello"));
        assert_ne!(base, prompt_key("gpt-4", "sys", "goodbye"));
    }

    #[test]
    fn test_is_fingerprint() {
        assert!(is_fingerprint(&"a".repeat(64)));
        assert!(!is_fingerprint(&"A".repeat(64)));
        assert!(!is_fingerprint("abc"));
        assert!(!is_fingerprint(&"g".repeat(64)));
    }
}
