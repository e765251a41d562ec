use std::sync::OnceLock;

use regex::Regex;

fn shot_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+(?:\.\d+)?)s\]\s*([^\[]+)").expect("static regex"))
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+(?:\.\d+)?s\]").expect("static regex"))
}

/// A prompt is a storyboard when it carries at least one `[Ns]` shot marker.
pub fn is_storyboard_prompt(prompt: &str) -> bool {
    !prompt.is_empty() && marker_regex().is_match(prompt)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shot {
    pub duration: String,
    pub scene: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Storyboard {
    /// Narrative preamble found before the first shot marker.
    pub instructions: Option<String>,
    pub shots: Vec<Shot>,
}

pub fn parse_storyboard(prompt: &str) -> Option<Storyboard> {
    let shots: Vec<Shot> = shot_regex()
        .captures_iter(prompt)
        .map(|caps| Shot {
            duration: caps[1].to_string(),
            scene: caps[2].trim().to_string(),
        })
        .collect();
    if shots.is_empty() {
        return None;
    }

    let instructions = prompt
        .find('[')
        .filter(|pos| *pos > 0)
        .map(|pos| prompt[..pos].trim().to_string())
        .filter(|text| !text.is_empty());

    Some(Storyboard {
        instructions,
        shots,
    })
}

pub fn format_storyboard(storyboard: &Storyboard) -> String {
    let timeline = storyboard
        .shots
        .iter()
        .enumerate()
        .map(|(idx, shot)| {
            format!(
                "Shot {}:\nduration: {}sec\nScene: {}",
                idx + 1,
                shot.duration,
                shot.scene
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    match &storyboard.instructions {
        Some(instructions) => {
            format!("current timeline:\n{timeline}\n\ninstructions:\n{instructions}")
        }
        None => timeline,
    }
}

/// Rewrites a shot-marked prompt into the storyboard API schema; prompts
/// without markers pass through unchanged.
pub fn format_storyboard_prompt(prompt: &str) -> String {
    match parse_storyboard(prompt) {
        Some(storyboard) => format_storyboard(&storyboard),
        None => prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_single_and_multiple_shots() {
        assert!(is_storyboard_prompt("[5.0s]jump"));
        assert!(is_storyboard_prompt("intro [5s]a [10.5s]b"));
        assert!(!is_storyboard_prompt("no markers here"));
        assert!(!is_storyboard_prompt(""));
        assert!(!is_storyboard_prompt("[5m]not seconds"));
    }

    #[test]
    fn formats_shots_with_preamble() {
        let formatted = format_storyboard_prompt("猫猫的奇妙冒险 [5.0s]跳伞 [5.0s]降落");
        assert_eq!(
            formatted,
            "current timeline:\nShot 1:\nduration: 5.0sec\nScene: 跳伞\n\nShot 2:\nduration: 5.0sec\nScene: 降落\n\ninstructions:\n猫猫的奇妙冒险"
        );
    }

    #[test]
    fn formats_shots_without_preamble() {
        let formatted = format_storyboard_prompt("[3s]wave [2s]smile");
        assert_eq!(
            formatted,
            "Shot 1:\nduration: 3sec\nScene: wave\n\nShot 2:\nduration: 2sec\nScene: smile"
        );
    }

    #[test]
    fn one_shot_prompt_is_still_a_storyboard() {
        let storyboard = parse_storyboard("[7.5s]slow pan over the bay").unwrap();
        assert_eq!(storyboard.shots.len(), 1);
        assert_eq!(storyboard.shots[0].duration, "7.5");
        assert!(storyboard.instructions.is_none());
    }

    #[test]
    fn unmarked_prompt_passes_through() {
        assert_eq!(format_storyboard_prompt("plain prompt"), "plain prompt");
    }

    #[test]
    fn formatting_is_a_fixed_point() {
        let input = "intro text [5.0s]first [2s]second";
        let once = format_storyboard_prompt(input);
        // A formatted timeline has no bracket markers left, so a second pass
        // must leave it untouched.
        assert_eq!(format_storyboard_prompt(&once), once);
    }
}
