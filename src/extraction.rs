use serde_json::Value;

use crate::error::GenerationError;

#[derive(Debug, Clone, Copy)]
pub enum Segment {
    Key(&'static str),
    Index(usize),
}

/// One place the service may put the output image.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionStrategy {
    pub name: &'static str,
    pub path: &'static [Segment],
}

impl ExtractionStrategy {
    /// The value at the path, as a URL string or an object's `url` field.
    pub fn extract(&self, payload: &Value) -> Option<String> {
        let mut current = payload;
        for segment in self.path {
            current = match segment {
                Segment::Key(key) => current.get(*key)?,
                Segment::Index(index) => current.get(*index)?,
            };
        }
        image_reference(current)
    }
}

use Segment::{Index, Key};

/// Tried in order; the first hit wins.
pub const RESULT_STRATEGIES: &[ExtractionStrategy] = &[
    ExtractionStrategy {
        name: "images[0].url",
        path: &[Key("images"), Index(0)],
    },
    ExtractionStrategy {
        name: "data.images[0].url",
        path: &[Key("data"), Key("images"), Index(0)],
    },
    ExtractionStrategy {
        name: "image.url",
        path: &[Key("image")],
    },
    ExtractionStrategy {
        name: "output_images[0]",
        path: &[Key("output_images"), Index(0)],
    },
    ExtractionStrategy {
        name: "output[0]",
        path: &[Key("output"), Index(0)],
    },
    ExtractionStrategy {
        name: "output",
        path: &[Key("output")],
    },
    ExtractionStrategy {
        name: "response.images[0].url",
        path: &[Key("response"), Key("images"), Index(0)],
    },
    ExtractionStrategy {
        name: "url",
        path: &[Key("url")],
    },
];

fn image_reference(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(map) => map.get("url")?.as_str()?,
        _ => return None,
    };
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// First matching output reference and the strategy that found it.
pub fn find_image_url(payload: &Value) -> Option<(&'static str, String)> {
    RESULT_STRATEGIES
        .iter()
        .find_map(|strategy| strategy.extract(payload).map(|url| (strategy.name, url)))
}

pub fn extract_image_url(payload: &Value) -> Result<String, GenerationError> {
    find_image_url(payload)
        .map(|(_, url)| url)
        .ok_or_else(|| GenerationError::InvalidResponse("no output image in result".to_string()))
}

pub fn extract_seed(payload: &Value) -> Option<u64> {
    [payload.get("seed"), payload.pointer("/data/seed")]
        .into_iter()
        .flatten()
        .find_map(|value| match value {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        })
}

pub fn extract_description(payload: &Value) -> Option<String> {
    [payload.get("description"), payload.pointer("/data/description")]
        .into_iter()
        .flatten()
        .find_map(|value| value.as_str())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
