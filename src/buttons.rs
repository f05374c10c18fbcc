//! Action-button label table
//!
//! Finished jobs offer follow-up actions. The raw emoji and labels reported by
//! the service are mapped to display names and rendered as a numbered menu
//! that `/up <task-id> <n>` refers back to.

use crate::client::TaskButton;

/// Buttons that are never offered
const HIDDEN: &[&str] = &["🎉Imagine all", "❤️"];

fn display_emoji(emoji: &str) -> &str {
    match emoji {
        "upscale_1" => "🔼",
        "🪄" => "✨",
        "🖌️" => "🎨",
        other => other,
    }
}

fn display_label(raw: &str) -> Option<&'static str> {
    let label = match raw {
        "Upscale (Subtle)" => "Upscale (subtle)",
        "Upscale (Creative)" => "Upscale (creative)",
        "Redo Upscale (Subtle)" => "Redo upscale (subtle)",
        "Redo Upscale (Creative)" => "Redo upscale (creative)",
        "Vary (Subtle)" => "Vary (subtle)",
        "Vary (Strong)" => "Vary (strong)",
        // Region editing and custom zoom need an interactive editor
        "Vary (Region)" | "Custom Zoom" => " ",
        "Zoom Out 2x" => "Zoom out 2x",
        "Zoom Out 1.5x" => "Zoom out 1.5x",
        "Make Square" => "Make square",
        "⬅️" => "Pan left",
        "➡️" => "Pan right",
        "⬆️" => "Pan up",
        "⬇️" => "Pan down",
        "U1" => "🔍 Upscale image 1",
        "U2" => "🔍 Upscale image 2",
        "U3" => "🔍 Upscale image 3",
        "U4" => "🔍 Upscale image 4",
        "V1" => "🪄 Vary image 1",
        "V2" => "🪄 Vary image 2",
        "V3" => "🪄 Vary image 3",
        "V4" => "🪄 Vary image 4",
        "🔄" => " Reroll",
        "" => "",
        _ => return None,
    };
    Some(label)
}

/// Display name of a button
#[must_use]
pub fn button_name(button: &TaskButton) -> String {
    let emoji = display_emoji(&button.emoji);
    let key = if button.label.is_empty() {
        button.emoji.as_str()
    } else {
        button.label.as_str()
    };
    // An empty emoji must not shadow an unknown label
    let label = display_label(key)
        .or_else(|| {
            Some(button.emoji.as_str())
                .filter(|e| !e.is_empty())
                .and_then(display_label)
        })
        .map_or_else(|| button.label.clone(), str::to_string);
    format!("{emoji}{label}")
}

/// Whether the button is offered to users
#[must_use]
pub fn is_visible(button: &TaskButton) -> bool {
    !HIDDEN.contains(&button_name(button).as_str())
}

/// Numbered menu, one ` n- name` line per visible button
#[must_use]
pub fn render_buttons(buttons: &[TaskButton]) -> String {
    buttons
        .iter()
        .filter(|b| is_visible(b))
        .enumerate()
        .map(|(i, b)| format!(" {}- {}\n", i + 1, button_name(b)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button(emoji: &str, label: &str) -> TaskButton {
        TaskButton {
            custom_id: format!("MJ::{label}"),
            emoji: emoji.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn test_known_labels_are_mapped() {
        assert_eq!(button_name(&button("", "U2")), "🔍 Upscale image 2");
        assert_eq!(button_name(&button("🪄", "Vary (Strong)")), "✨Vary (strong)");
        assert_eq!(button_name(&button("🔄", "")), "🔄 Reroll");
        assert_eq!(button_name(&button("⬅️", "")), "⬅️Pan left");
    }

    #[test]
    fn test_unknown_labels_pass_through() {
        assert_eq!(button_name(&button("", "Animate")), "Animate");
        assert_eq!(button_name(&button("🎬", "Animate")), "🎬Animate");
    }

    #[test]
    fn test_menu_skips_hidden_buttons_and_numbers_the_rest() {
        let buttons = vec![
            button("", "U1"),
            button("🎉", "Imagine all"),
            button("❤️", ""),
            button("", "V1"),
        ];
        assert_eq!(
            render_buttons(&buttons),
            " 1- 🔍 Upscale image 1\n 2- 🪄 Vary image 1\n"
        );
        assert_eq!(render_buttons(&[]), "");
    }

    #[test]
    fn test_menu_keeps_unknown_labels() {
        let buttons = vec![button("", "Animate"), button("", "U1")];
        assert_eq!(
            render_buttons(&buttons),
            " 1- Animate\n 2- 🔍 Upscale image 1\n"
        );
    }
}
