//! Mouth shape from the character being spoken

use serde::Serialize;

/// Visual mouth-shape category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Viseme {
    /// Lips pressed together (b, m, p)
    Closed,
    /// Spread lips for front vowels (e, i, y)
    Wide,
    /// Rounded open mouth for back and open vowels (a, o, u)
    Open,
    /// Upper teeth on lower lip (f, v)
    Teeth,
    /// Tongue between teeth ("th")
    Tongue,
    /// No text cue; shape follows amplitude alone
    #[default]
    Rest,
}

/// Classify the character at `progress` through `text`
///
/// `progress` is clamped to `[0, 1]` and indexes characters, not bytes.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn classify(text: &str, progress: f32) -> Viseme {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Viseme::Rest;
    }

    let index = ((progress.clamp(0.0, 1.0) * chars.len() as f32).floor() as usize)
        .min(chars.len() - 1);
    let current = chars[index].to_ascii_lowercase();
    let prev = index
        .checked_sub(1)
        .map(|i| chars[i].to_ascii_lowercase());
    let next = chars.get(index + 1).map(char::to_ascii_lowercase);

    let digraph = (current == 't' && next == Some('h')) || (current == 'h' && prev == Some('t'));
    if digraph {
        return Viseme::Tongue;
    }

    match current {
        'b' | 'm' | 'p' => Viseme::Closed,
        'e' | 'i' | 'y' => Viseme::Wide,
        'a' | 'o' | 'u' => Viseme::Open,
        'f' | 'v' => Viseme::Teeth,
        _ => Viseme::Rest,
    }
}
