use anyhow::Context;
use std::path::Path;

/// COCO class names, in model index order.
pub const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

pub fn coco_labels() -> Vec<String> {
    COCO_NAMES.iter().map(|s| s.to_string()).collect()
}

/// One class name per line; blank lines and `#` comments are skipped.
pub fn parse_labels(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn load_labels(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read label file {}", path.display()))?;
    let labels = parse_labels(&text);
    if labels.is_empty() {
        anyhow::bail!("Label file {} contains no class names", path.display());
    }
    Ok(labels)
}

/// Label table from the `names` entry of an exported model, written as a
/// Python dict literal: `{0: 'person', 1: 'bicycle'}`. Indices must cover
/// `0..n` with no gaps.
pub fn parse_model_names(text: &str) -> anyhow::Result<Vec<String>> {
    let body = text
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .with_context(|| format!("Model names are not a dict: {}", text))?;

    let mut chars = body.chars().peekable();
    let mut entries: Vec<(usize, String)> = Vec::new();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let key: String = std::iter::from_fn(|| chars.next_if(char::is_ascii_digit)).collect();
        let index: usize = key
            .parse()
            .with_context(|| format!("Expected a class index in model names: {}", text))?;

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some(':') {
            anyhow::bail!("Expected ':' after class index {} in model names", index);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let quote = match chars.next() {
            Some(q @ ('\'' | '"')) => q,
            _ => anyhow::bail!("Expected a quoted name for class index {}", index),
        };
        let mut name = String::new();
        loop {
            match chars.next() {
                Some('\\') => name.extend(chars.next()),
                Some(c) if c == quote => break,
                Some(c) => name.push(c),
                None => anyhow::bail!("Unterminated name for class index {}", index),
            }
        }
        entries.push((index, name));
    }

    if entries.is_empty() {
        anyhow::bail!("Model names are empty");
    }
    entries.sort_by_key(|(index, _)| *index);
    entries
        .into_iter()
        .enumerate()
        .map(|(position, (index, name))| {
            if position == index {
                Ok(name)
            } else {
                Err(anyhow::anyhow!("Model names skip class index {}", position))
            }
        })
        .collect()
}
