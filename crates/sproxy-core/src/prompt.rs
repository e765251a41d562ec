use std::sync::OnceLock;

use regex::Regex;

fn remix_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"s_[a-f0-9]{32}").expect("static regex"))
}

fn remix_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://sora\.chatgpt\.com/p/s_[a-f0-9]{32}").expect("static regex")
    })
}

fn style_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^}]+)\}").expect("static regex"))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First share id embedded in the text, in either the full URL or the bare
/// `s_<32-hex>` form.
pub fn extract_remix_id(text: &str) -> Option<String> {
    remix_id_regex().find(text).map(|m| m.as_str().to_string())
}

/// Strips share links (both forms) and collapses the leftover whitespace.
pub fn clean_remix_link(prompt: &str) -> String {
    let cleaned = remix_url_regex().replace_all(prompt, "");
    let cleaned = remix_id_regex().replace_all(&cleaned, "");
    collapse_whitespace(&cleaned)
}

/// Pulls a `{style}` tag out of the prompt; returns the cleaned prompt and
/// the style id, if any.
pub fn extract_style(prompt: &str) -> (String, Option<String>) {
    let Some(caps) = style_regex().captures(prompt) else {
        return (prompt.to_string(), None);
    };
    let style_id = caps[1].trim().to_string();
    let cleaned = style_regex().replace_all(prompt, "");
    (collapse_whitespace(&cleaned), Some(style_id))
}

/// `![Generated Image](url)` occurrences, in order.
pub fn extract_image_urls(markdown: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"!\[Generated Image\]\((.*?)\)").expect("static regex")
    });
    re.captures_iter(markdown)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARE_ID: &str = "s_68e3a06dcd888191b150971da152c1f5";

    #[test]
    fn remix_id_from_full_url() {
        let prompt = format!("make it rain https://sora.chatgpt.com/p/{SHARE_ID}");
        assert_eq!(extract_remix_id(&prompt).as_deref(), Some(SHARE_ID));
    }

    #[test]
    fn remix_id_from_bare_form() {
        let prompt = format!("make it rain {SHARE_ID}");
        assert_eq!(extract_remix_id(&prompt).as_deref(), Some(SHARE_ID));
        assert_eq!(extract_remix_id("no id here"), None);
    }

    #[test]
    fn cleaning_strips_both_forms_and_collapses() {
        let prompt = format!("make it rain https://sora.chatgpt.com/p/{SHARE_ID} please");
        assert_eq!(clean_remix_link(&prompt), "make it rain please");
        let prompt = format!("make it rain {SHARE_ID}");
        assert_eq!(clean_remix_link(&prompt), "make it rain");
    }

    #[test]
    fn style_extraction() {
        let (cleaned, style) = extract_style("a cat {anime} on a roof");
        assert_eq!(cleaned, "a cat on a roof");
        assert_eq!(style.as_deref(), Some("anime"));

        let (cleaned, style) = extract_style("plain prompt");
        assert_eq!(cleaned, "plain prompt");
        assert!(style.is_none());
    }

    #[test]
    fn image_urls_from_markdown() {
        let markdown = "![Generated Image](http://h/tmp/a.png)\n![Generated Image](http://h/tmp/b.png)";
        assert_eq!(
            extract_image_urls(markdown),
            vec!["http://h/tmp/a.png", "http://h/tmp/b.png"]
        );
        assert!(extract_image_urls("no images").is_empty());
    }
}
