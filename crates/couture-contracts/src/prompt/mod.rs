//! Prompt derivation from structured generation parameters.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Keys rendered in a fixed order; anything else follows in insertion order.
const KNOWN_KEYS: &[&str] = &[
    "garment", "style", "model", "pose", "setting", "lighting", "camera", "mood",
];

/// Opaque bag of generation parameters (style, pose, lighting, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptParams {
    #[serde(default)]
    pub fields: IndexMap<String, String>,
    #[serde(default)]
    pub video: bool,
}

impl PromptParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Sets a field; an empty value removes it.
    pub fn set(&mut self, key: &str, value: &str) {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return;
        }
        let value = value.trim();
        if value.is_empty() {
            self.fields.shift_remove(&key);
        } else {
            self.fields.insert(key, value.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Applies `key=value` pairs, ignoring malformed entries.
    pub fn apply_assignments<'a>(&mut self, pairs: impl IntoIterator<Item = &'a str>) -> usize {
        let mut applied = 0;
        for pair in pairs {
            if let Some((key, value)) = pair.split_once('=') {
                self.set(key, value);
                applied += 1;
            }
        }
        applied
    }
}

/// Renders the automatic prompt. Pure and deterministic.
pub fn derive_prompt(params: &PromptParams) -> String {
    let field = |key: &str| params.get(key).filter(|value| !value.is_empty());
    let mut parts: Vec<String> = Vec::new();

    let subject = match field("garment") {
        Some(garment) => format!("Professional fashion photo of {garment}"),
        None => "Professional fashion photo of the uploaded garment".to_string(),
    };
    parts.push(subject);
    if let Some(style) = field("style") {
        parts.push(format!("{style} style"));
    }
    if let Some(model) = field("model") {
        parts.push(format!("worn by {model}"));
    }
    if let Some(pose) = field("pose") {
        parts.push(format!("{pose} pose"));
    }
    if let Some(setting) = field("setting") {
        parts.push(format!("in {setting}"));
    }
    if let Some(lighting) = field("lighting") {
        parts.push(format!("{lighting} lighting"));
    }
    if let Some(camera) = field("camera") {
        parts.push(format!("shot on {camera}"));
    }
    if let Some(mood) = field("mood") {
        parts.push(format!("{mood} mood"));
    }
    for (key, value) in &params.fields {
        if KNOWN_KEYS.contains(&key.as_str()) || value.is_empty() {
            continue;
        }
        parts.push(format!("{key}: {value}"));
    }
    if params.video {
        parts.push("subtle natural motion, fabric moving with the model".to_string());
    }
    format!("{}.", parts.join(", "))
}

/// Tracks the automatic prompt and an optional manual override.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptComposer {
    params: PromptParams,
    derived: String,
    manual_override_active: bool,
    override_text: String,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(PromptParams::default())
    }
}

impl PromptComposer {
    pub fn new(params: PromptParams) -> Self {
        let derived = derive_prompt(&params);
        Self {
            params,
            derived,
            manual_override_active: false,
            override_text: String::new(),
        }
    }

    pub fn params(&self) -> &PromptParams {
        &self.params
    }

    /// Recomputes the automatic text. A manual override is left as is.
    pub fn on_params_changed(&mut self, params: PromptParams) {
        self.derived = derive_prompt(&params);
        self.params = params;
    }

    pub fn set_manual_text(&mut self, text: impl Into<String>) {
        self.override_text = text.into();
        self.manual_override_active = true;
    }

    pub fn reset_to_auto(&mut self) {
        self.manual_override_active = false;
    }

    /// The prompt that would be submitted right now.
    pub fn text(&self) -> &str {
        if self.manual_override_active {
            &self.override_text
        } else {
            &self.derived
        }
    }

    pub fn derived_text(&self) -> &str {
        &self.derived
    }

    pub fn is_manual(&self) -> bool {
        self.manual_override_active
    }

    /// True when the manual text no longer matches what the params derive.
    pub fn is_override_stale(&self) -> bool {
        self.manual_override_active && self.override_text != self.derived
    }

    /// Unified diff from the automatic text to the manual one.
    pub fn override_diff(&self) -> Option<Vec<String>> {
        if !self.manual_override_active {
            return None;
        }
        let auto = format!("{}\n", self.derived);
        let manual = format!("{}\n", self.override_text);
        let diff = TextDiff::from_lines(auto.as_str(), manual.as_str());
        let rendered = diff.unified_diff().header("auto", "manual").to_string();
        Some(rendered.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn studio_params() -> PromptParams {
        PromptParams::new()
            .with("garment", "linen blazer")
            .with("style", "editorial")
            .with("lighting", "soft daylight")
    }

    #[test]
    fn derive_orders_known_keys_then_extras() {
        let params = PromptParams::new()
            .with("palette", "earth tones")
            .with("lighting", "golden hour")
            .with("garment", "silk dress");
        assert_eq!(
            derive_prompt(&params),
            "Professional fashion photo of silk dress, golden hour lighting, palette: earth tones."
        );
    }

    #[test]
    fn derive_is_deterministic() {
        assert_eq!(derive_prompt(&studio_params()), derive_prompt(&studio_params()));
    }

    #[test]
    fn video_mode_adds_motion_clause() {
        let text = derive_prompt(&studio_params().with_video(true));
        assert!(text.contains("natural motion"));
    }

    #[test]
    fn empty_values_remove_fields() {
        let mut params = studio_params();
        params.set("style", "  ");
        assert!(params.get("style").is_none());
        assert_eq!(params.apply_assignments(["pose=walking", "broken"]), 1);
        assert_eq!(params.get("pose"), Some("walking"));
    }

    #[test]
    fn param_changes_follow_live_derivation() {
        let mut composer = PromptComposer::new(studio_params());
        let next = studio_params().with("pose", "seated");
        composer.on_params_changed(next.clone());
        assert_eq!(composer.text(), derive_prompt(&next));
        assert!(!composer.is_override_stale());
    }

    #[test]
    fn manual_override_survives_param_changes() {
        let mut composer = PromptComposer::new(studio_params());
        composer.set_manual_text("my own words");
        composer.on_params_changed(studio_params().with("pose", "seated"));
        assert_eq!(composer.text(), "my own words");
        assert!(composer.is_manual());
    }

    #[test]
    fn staleness_tracks_current_params() {
        let p1 = studio_params();
        let p2 = studio_params().with("mood", "moody");
        let mut composer = PromptComposer::new(p1.clone());
        composer.set_manual_text(derive_prompt(&p1));
        assert!(!composer.is_override_stale());

        composer.on_params_changed(p2);
        assert!(composer.is_override_stale());

        composer.on_params_changed(p1);
        assert!(!composer.is_override_stale());
    }

    #[test]
    fn reset_to_auto_resumes_derivation() {
        let mut composer = PromptComposer::new(studio_params());
        composer.set_manual_text("custom");
        composer.reset_to_auto();
        let next = studio_params().with("camera", "35mm film");
        composer.on_params_changed(next.clone());
        assert_eq!(composer.text(), derive_prompt(&next));
        assert!(!composer.is_override_stale());
        assert!(composer.override_diff().is_none());
    }

    #[test]
    fn override_diff_shows_both_sides() {
        let mut composer = PromptComposer::new(studio_params());
        composer.set_manual_text("custom prompt");
        let diff = composer.override_diff().unwrap_or_default();
        assert!(diff.iter().any(|line| line == "+custom prompt"));
        assert!(diff.iter().any(|line| line.starts_with("-Professional fashion photo")));
    }
}
