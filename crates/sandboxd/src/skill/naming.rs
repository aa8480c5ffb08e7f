//! Command-name derivation for skills.

/// Highest numeric suffix tried when a fork's command name collides.
pub const MAX_FORK_SUFFIX: u32 = 100;

/// Kebab-case command name: "Revenue Analysis Report" -> "revenue-analysis-report".
///
/// The result may be empty; callers reject that.
pub fn sanitize_command_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ' || *c == '-')
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .trim_matches('-')
        .to_string()
}

pub fn fork_name(name: &str) -> String {
    format!("{name} (Fork)")
}

/// Candidate command names for a fork, in the order they are tried.
pub fn fork_command_candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string())
        .chain((2..=MAX_FORK_SUFFIX).map(move |i| format!("{base}-{i}")))
}

/// Sandbox file name for a command.
pub fn command_file(command_name: &str) -> String {
    format!("{command_name}.md")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_examples() {
        assert_eq!(
            sanitize_command_name("Revenue Analysis Report"),
            "revenue-analysis-report"
        );
        assert_eq!(sanitize_command_name("  Code   Review!! "), "code-review");
        assert_eq!(sanitize_command_name("--Deploy v2--"), "deploy-v2");
        assert_eq!(sanitize_command_name("Émoji 🚀 Tool"), "moji-tool");
        assert_eq!(sanitize_command_name("!!!"), "");
    }

    #[test]
    fn fork_candidates_are_capped() {
        let names: Vec<String> = fork_command_candidates("review-fork").collect();
        assert_eq!(names.len(), 100);
        assert_eq!(names[0], "review-fork");
        assert_eq!(names[1], "review-fork-2");
        assert_eq!(names[99], "review-fork-100");
    }

    #[test]
    fn fork_name_suffix() {
        assert_eq!(fork_name("Review"), "Review (Fork)");
        assert_eq!(sanitize_command_name(&fork_name("Review")), "review-fork");
    }
}
