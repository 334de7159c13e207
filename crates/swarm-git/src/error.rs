use std::path::PathBuf;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git command returned non-zero exit ({command}) status={status:?}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("git command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("path is not inside a git repository: {path}")]
    NotARepository { path: PathBuf },
    #[error("invalid git output: {context}")]
    Parse { context: String },
}

#[cfg(test)]
mod tests {
    use super::GitError;
    use std::error::Error;
    use std::path::PathBuf;

    #[test]
    fn io_variant_includes_command_and_source() {
        let err = GitError::Io {
            command: "git status".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary"),
        };
        assert!(err.to_string().contains("git command failed to start (git status)"));
        assert!(err.source().is_some());
    }

    #[test]
    fn command_failed_mentions_status() {
        let err = GitError::CommandFailed {
            command: "git merge topic".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "CONFLICT".to_string(),
        };
        assert!(err.to_string().contains("status=Some(1)"));
    }

    #[test]
    fn repository_and_parse_variants_carry_context() {
        let err = GitError::NotARepository {
            path: PathBuf::from("/tmp/plain"),
        };
        assert!(err.to_string().contains("/tmp/plain"));

        let err = GitError::Parse {
            context: "expected worktree line".to_string(),
        };
        assert!(err.to_string().contains("expected worktree line"));
    }
}
