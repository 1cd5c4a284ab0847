//! Fragment url templates of both manifest dialects.
//!
//! The DASH placeholder grammar matches the one of dash-mpd-rs (`fetch.rs`) and vsd
//! (`dash/template.rs`).

use regex::{Captures, Regex, Replacer};
use std::{collections::HashMap, sync::LazyLock};

// From https://dashif.org/docs/DASH-IF-IOP-v4.3.pdf:
// "For the avoidance of doubt, only %0[width]d is permitted and no other identifiers."
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
static DASH_TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$")
        .expect("static regex is valid")
});

// Smooth Streaming fragment urls only know two placeholders.
//
// Example template: "QualityLevels({bitrate})/Fragments(video={start time})"
static SMOOTH_TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(bitrate|Bitrate|start time|start_time)\}").expect("static regex is valid")
});

/// Which placeholder syntax a media url template is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateDialect {
    Dash,
    Smooth,
}

#[derive(Debug, Default)]
pub struct Template {
    args: HashMap<&'static str, String>,
}

impl Template {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";

    pub fn new() -> Self {
        Self {
            args: HashMap::with_capacity(4),
        }
    }

    pub fn insert(&mut self, key: &'static str, value: String) -> &mut Self {
        self.args.insert(key, value);
        self
    }

    pub fn insert_optional(&mut self, key: &'static str, value: Option<String>) -> &mut Self {
        if let Some(value) = value {
            self.args.insert(key, value);
        }
        self
    }

    pub fn resolve(&self, dialect: TemplateDialect, template: &str) -> String {
        match dialect {
            TemplateDialect::Dash => DASH_TEMPLATE_REGEX
                .replace_all(template, DashReplacer(&self.args))
                .to_string(),
            TemplateDialect::Smooth => SMOOTH_TEMPLATE_REGEX
                .replace_all(template, SmoothReplacer(&self.args))
                .to_string(),
        }
    }
}

struct DashReplacer<'a>(&'a HashMap<&'static str, String>);

impl Replacer for DashReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let Some(value) = caps.get(1).and_then(|key| self.0.get(key.as_str())) else {
            dst.push_str(whole);
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(value),
        }
    }
}

struct SmoothReplacer<'a>(&'a HashMap<&'static str, String>);

impl Replacer for SmoothReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let key = match caps.get(1).map(|m| m.as_str()) {
            Some("bitrate" | "Bitrate") => Template::BANDWIDTH,
            Some("start time" | "start_time") => Template::TIME,
            _ => {
                dst.push_str(whole);
                return;
            }
        };

        match self.0.get(key) {
            Some(value) => dst.push_str(value),
            None => dst.push_str(whole),
        }
    }
}
