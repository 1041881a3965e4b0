pub mod backup;
pub mod check;
pub mod maintenance;
pub mod restore;
pub mod rm;
pub mod sync;

use coffre_types::Result;

/// Read an ignore file: one pattern per line, `#` comments and blank
/// lines stripped, trailing carriage returns and tabs trimmed.
pub fn load_ignore_file(path: &std::path::Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_ignore_lines(&contents))
}

pub(crate) fn parse_ignore_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.trim_end_matches(['\r', '\t', ' ']))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_parsing_strips_comments_and_blanks() {
        let contents = "# comment\n\n*.tmp\r\n  \ntarget\t\n#another\nnode_modules";
        assert_eq!(
            parse_ignore_lines(contents),
            vec!["*.tmp", "target", "node_modules"]
        );
    }

    #[test]
    fn ignore_parsing_empty_input() {
        assert!(parse_ignore_lines("").is_empty());
        assert!(parse_ignore_lines("# only\n# comments\n").is_empty());
    }
}
