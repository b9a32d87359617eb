//! §4.9 step 5: before POSTing a result, strip ASCII control characters
//! other than `\n`, `\r`, `\t` so a browser-captured log line full of
//! terminal escape codes can't give the control plane's JSON decoder
//! trouble.

pub fn strip_control_chars(input: &str) -> String {
    input.chars().filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t')).collect()
}

pub fn strip_control_chars_vec(items: &[String]) -> Vec<String> {
    items.iter().map(|s| strip_control_chars(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newlines_tabs_and_carriage_returns() {
        let input = "line one\nline two\ttabbed\r\n";
        assert_eq!(strip_control_chars(input), input);
    }

    #[test]
    fn strips_other_control_characters() {
        let input = "before\x1b[31mred\x1b[0mafter";
        assert_eq!(strip_control_chars(input), "before[31mred[0mafter");
    }

    #[test]
    fn strips_across_a_vec_of_log_lines() {
        let logs = vec!["ok\n".to_string(), "bad\x07bell".to_string()];
        assert_eq!(strip_control_chars_vec(&logs), vec!["ok\n".to_string(), "badbell".to_string()]);
    }
}
