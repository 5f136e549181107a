use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::registry::{CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, TRANSFORM_COMMANDS};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, command: &str, reason: &str) -> Self {
        let mut intent = Self::new("invalid", raw);
        intent
            .command_args
            .insert("command".to_string(), Value::String(command.to_string()));
        intent
            .command_args
            .insert("reason".to_string(), Value::String(reason.to_string()));
        intent
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn arg_f64(&self, key: &str) -> Option<f64> {
        self.command_args.get(key).and_then(Value::as_f64)
    }

    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        self.command_args.get(key).and_then(Value::as_u64)
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_percent(raw: &str) -> Option<f64> {
    let value = raw.trim().trim_end_matches('%').parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

fn parse_crop(raw: &str, arg: &str) -> Intent {
    let parts = split_args(arg);
    if parts.len() != 4 {
        return Intent::invalid(raw, "crop", "usage: /crop X Y W H (percent of the image)");
    }
    let values = parts
        .iter()
        .map(|part| parse_percent(part))
        .collect::<Option<Vec<f64>>>();
    let Some(values) = values else {
        return Intent::invalid(raw, "crop", "crop values must be numbers");
    };
    let mut intent = Intent::new("crop", raw);
    for (key, value) in ["x", "y", "width", "height"].iter().zip(values) {
        intent.command_args.insert((*key).to_string(), json!(value));
    }
    intent
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, TRANSFORM_COMMANDS) {
                let mut intent = Intent::new("transform", text);
                intent
                    .command_args
                    .insert("kind".to_string(), Value::String(action.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("value".to_string(), Value::String(arg.to_string()));
                if action == "set_prompt" {
                    intent.prompt = Some(arg.to_string());
                }
                return intent;
            }

            match command.as_str() {
                "crop" => return parse_crop(text, arg),
                "use" => {
                    let parts = split_args(arg);
                    let Some(id) = parts.first() else {
                        return Intent::invalid(text, "use", "usage: /use VERSION_ID");
                    };
                    let mut intent = Intent::new("select_version", text);
                    intent
                        .command_args
                        .insert("version_id".to_string(), Value::String(id.clone()));
                    return intent;
                }
                "compare" => {
                    let parts = split_args(arg);
                    if parts.len() != 2 {
                        return Intent::invalid(text, "compare", "usage: /compare LEFT RIGHT");
                    }
                    let mut intent = Intent::new("compare", text);
                    intent
                        .command_args
                        .insert("left".to_string(), Value::String(parts[0].clone()));
                    intent
                        .command_args
                        .insert("right".to_string(), Value::String(parts[1].clone()));
                    return intent;
                }
                "set" => {
                    let mut intent = Intent::new("set_params", text);
                    intent.command_args.insert(
                        "assignments".to_string(),
                        Value::Array(split_args(arg).into_iter().map(Value::String).collect()),
                    );
                    return intent;
                }
                "generate" => {
                    let mut intent = Intent::new("generate_images", text);
                    if !arg.is_empty() {
                        let Ok(count) = arg.parse::<u64>() else {
                            return Intent::invalid(text, "generate", "usage: /generate [COUNT]");
                        };
                        intent
                            .command_args
                            .insert("count".to_string(), Value::Number(count.into()));
                    }
                    return intent;
                }
                _ => {}
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("set_prompt", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
