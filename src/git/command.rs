//! Parsing of the command line a Git client sends in an SSH `exec` request.
//!
//! ```text
//! git-upload-pack '/org/repo.git'
//! git-receive-pack "org/repo"
//! ```
//!
//! The line is split the way a POSIX shell would split it (quotes and
//! backslash escapes), and must consist of exactly a service name and a
//! repository path.  The line sent upstream is rebuilt from those two words,
//! so shell metacharacters in the path never reach the remote shell
//! unquoted.

use super::{GitOperation, RECEIVE_PACK, UPLOAD_PACK};

// ---------------------------------------------------------------------------
// Shape check
// ---------------------------------------------------------------------------

/// `true` when `tokens` is exactly `[<git-upload-pack|git-receive-pack>, <path>]`.
pub fn is_git_shell<S: AsRef<str>>(tokens: &[S]) -> bool {
    match tokens {
        [service, _repository] => matches!(service.as_ref(), UPLOAD_PACK | RECEIVE_PACK),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Parsed command
// ---------------------------------------------------------------------------

/// A validated git shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitShellCommand {
    service: String,
    repository: String,
    line: String,
}

impl GitShellCommand {
    /// Parse and validate an exec command line.  Returns `None` for anything
    /// that is not a two-token git transport command.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens = split_words(line)?;
        if !is_git_shell(&tokens) {
            return None;
        }
        let mut tokens = tokens.into_iter();
        let service = tokens.next()?;
        let repository = tokens.next()?;
        if repository.is_empty() {
            return None;
        }
        let line = format!("{service} {}", shell_quote(&repository));
        Some(Self {
            service,
            repository,
            line,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Repository path with shell quoting removed, e.g. `/org/repo.git`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `<service> '<repository>'`, the command executed on the upstream host.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn operation(&self) -> GitOperation {
        GitOperation::from_service(&self.service)
    }
}

// ---------------------------------------------------------------------------
// Word splitting
// ---------------------------------------------------------------------------

/// Split a command line into words following POSIX shell quoting rules.
/// Returns `None` on an unterminated quote or a trailing backslash.
fn split_words(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        other => current.push(other),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            escaped @ ('"' | '\\' | '$' | '`') => current.push(escaped),
                            '\n' => {}
                            other => {
                                current.push('\\');
                                current.push(other);
                            }
                        },
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}

/// Single-quote `word` for a POSIX shell.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_accepts_both_services() {
        assert!(is_git_shell(&["git-upload-pack", "/org/repo.git"]));
        assert!(is_git_shell(&["git-receive-pack", "/org/repo.git"]));
    }

    #[test]
    fn shape_rejects_wrong_arity_or_service() {
        assert!(!is_git_shell(&["git-upload-pack"]));
        assert!(!is_git_shell(&["ls", "-la"]));
        assert!(!is_git_shell(&["git-receive-pack", "/a", "/b"]));
        assert!(!is_git_shell::<&str>(&[]));
        assert!(!is_git_shell(&["git-upload-archive", "/org/repo.git"]));
    }

    #[test]
    fn parse_single_quoted_path() {
        let cmd = GitShellCommand::parse("git-upload-pack '/acme/widgets.git'").unwrap();
        assert_eq!(cmd.service(), "git-upload-pack");
        assert_eq!(cmd.repository(), "/acme/widgets.git");
        assert_eq!(cmd.line(), "git-upload-pack '/acme/widgets.git'");
        assert_eq!(cmd.operation(), GitOperation::Read);
    }

    #[test]
    fn parse_double_quoted_and_bare_paths() {
        let cmd = GitShellCommand::parse("git-receive-pack \"org/repo\"").unwrap();
        assert_eq!(cmd.repository(), "org/repo");
        assert_eq!(cmd.operation(), GitOperation::Write);

        let cmd = GitShellCommand::parse("git-receive-pack org/repo.git").unwrap();
        assert_eq!(cmd.repository(), "org/repo.git");
        assert_eq!(cmd.line(), "git-receive-pack 'org/repo.git'");
    }

    #[test]
    fn metacharacters_stay_inside_the_repository_word() {
        let cmd = GitShellCommand::parse("git-upload-pack /org/x.git;id").unwrap();
        assert_eq!(cmd.repository(), "/org/x.git;id");
        assert_eq!(cmd.line(), "git-upload-pack '/org/x.git;id'");

        let cmd = GitShellCommand::parse("git-upload-pack '/org/$(id)`id`|x&.git'").unwrap();
        assert_eq!(cmd.line(), "git-upload-pack '/org/$(id)`id`|x&.git'");

        let cmd = GitShellCommand::parse(r#"git-upload-pack "/org/it's.git""#).unwrap();
        assert_eq!(cmd.repository(), "/org/it's.git");
        assert_eq!(cmd.line(), r"git-upload-pack '/org/it'\''s.git'");
        assert_eq!(split_words(cmd.line()).unwrap(), vec!["git-upload-pack", "/org/it's.git"]);
    }

    #[test]
    fn quoted_path_with_space_is_one_token() {
        let cmd = GitShellCommand::parse("git-upload-pack '/org/my repo.git'").unwrap();
        assert_eq!(cmd.repository(), "/org/my repo.git");
    }

    #[test]
    fn parse_rejects_invalid_commands() {
        assert!(GitShellCommand::parse("").is_none());
        assert!(GitShellCommand::parse("ls -la").is_none());
        assert!(GitShellCommand::parse("git-upload-pack").is_none());
        assert!(GitShellCommand::parse("git-upload-pack ''").is_none());
        assert!(GitShellCommand::parse("git-upload-pack /a /b").is_none());
        assert!(GitShellCommand::parse("git-upload-pack '/unterminated").is_none());
        assert!(GitShellCommand::parse("sh -c 'git-upload-pack /a'").is_none());
    }

    #[test]
    fn split_words_handles_escapes() {
        assert_eq!(
            split_words(r#"a\ b "c\"d" 'e\f'"#).unwrap(),
            vec!["a b".to_string(), "c\"d".to_string(), "e\\f".to_string()]
        );
        assert!(split_words("trailing\\").is_none());
    }
}
