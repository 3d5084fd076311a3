//! Interactive prompt heuristic
//!
//! A command is considered to be waiting for input when its latest line ends
//! like a question or a label (`Continue?`, `Password:`) and the output then
//! goes quiet. The quiet part is timed by the execution channel; this module
//! only judges the text.

/// Whether `line` reads like a prompt for input
pub fn looks_like_prompt(line: &str) -> bool {
    let line = line.trim_end();
    line.ends_with('?') || line.ends_with(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_and_label_are_prompts() {
        assert!(looks_like_prompt("Continue?"));
        assert!(looks_like_prompt("Password: "));
        assert!(looks_like_prompt("Enter your name:\t\r"));
        assert!(looks_like_prompt("[y/N]?"));
    }

    #[test]
    fn test_ordinary_output_is_not_a_prompt() {
        assert!(!looks_like_prompt("done."));
        assert!(!looks_like_prompt(""));
        assert!(!looks_like_prompt("   "));
        assert!(!looks_like_prompt("progress: 50%"));
    }
}
