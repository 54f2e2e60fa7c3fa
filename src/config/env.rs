//! Environment variable loading.

use std::env;
use std::str::FromStr;

use super::LiveConfig;

/// Read a non-empty environment variable.
pub(crate) fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, reporting the offending value on failure.
pub(crate) fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, String> {
    match env_string(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("Invalid value for {name}: {value}")),
        None => Ok(None),
    }
}

/// Parse a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub(crate) fn env_bool(name: &str) -> Result<Option<bool>, String> {
    match env_string(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid value for {name}: {value}")),
        },
        None => Ok(None),
    }
}

/// Build a configuration from environment variables over defaults.
pub(crate) fn load_from_env() -> Result<LiveConfig, Box<dyn std::error::Error>> {
    let mut config = LiveConfig::default();

    config.api_key = env_string("GEMINI_API_KEY").or_else(|| env_string("API_KEY"));
    config.url = env_string("GEMINI_LIVE_URL");
    if let Some(model) = env_string("GEMINI_LIVE_MODEL") {
        config.model = model;
    }
    if let Some(voice) = env_string("GEMINI_LIVE_VOICE") {
        config.voice = voice;
    }
    if let Some(instruction) = env_string("LIVE_SYSTEM_INSTRUCTION") {
        config.system_instruction = instruction;
    }
    if let Some(flag) = env_bool("LIVE_INPUT_TRANSCRIPTION")? {
        config.input_transcription = flag;
    }
    if let Some(flag) = env_bool("LIVE_OUTPUT_TRANSCRIPTION")? {
        config.output_transcription = flag;
    }

    if let Some(rate) = env_parse("CAPTURE_SAMPLE_RATE")? {
        config.capture_sample_rate = rate;
    }
    if let Some(rate) = env_parse("PLAYBACK_SAMPLE_RATE")? {
        config.playback_sample_rate = rate;
    }
    if let Some(samples) = env_parse("CAPTURE_FRAME_SAMPLES")? {
        config.frame_samples = samples;
    }

    if let Some(capacity) = env_parse("SEND_QUEUE_CAPACITY")? {
        config.send_queue_capacity = capacity;
    }
    if let Some(seconds) = env_parse("CONNECT_TIMEOUT_SECONDS")? {
        config.connect_timeout_seconds = seconds;
    }
    if let Some(ms) = env_parse("TEARDOWN_TIMEOUT_MS")? {
        config.teardown_timeout_ms = ms;
    }

    Ok(config)
}
