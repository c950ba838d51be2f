//! Shell selection and prompt configuration per platform.
//!
//! Pure functions: nothing here touches the process table or the
//! filesystem, so the whole mapping is unit-testable on any host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable holding the workspace's parent directory; prompts
/// show `$PWD` relative to it.
pub const WORKSPACE_PARENT_ENV: &str = "CHATTERM_WORKSPACE_PARENT";

const POSIX_PROMPT: &str = "${PWD#\"$CHATTERM_WORKSPACE_PARENT\"/} $ ";
const BASH_PROMPT: &str =
    "\\[\\e[1;32m\\]${PWD#\"$CHATTERM_WORKSPACE_PARENT\"/}\\[\\e[0m\\] \\$ ";
const ZSH_PROMPT: &str = "%B%F{green}${PWD#\"$CHATTERM_WORKSPACE_PARENT\"/}%f%b %# ";
const POWERSHELL_PROMPT: &str = "function prompt { \
$p = $PWD.Path; $b = $env:CHATTERM_WORKSPACE_PARENT; \
if ($b -and $p.StartsWith($b)) { $p = $p.Substring($b.Length).TrimStart('\\') }; \
\"$p> \" }";

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// The platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// Everything needed to spawn a shell in a PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

/// Build the shell invocation for `workspace_dir`.
///
/// `user_shell` is the user's preferred shell (usually `$SHELL`); it is
/// ignored on Windows. Startup files are skipped so user rc files cannot
/// override the prompt.
pub fn shell_command(
    platform: Platform,
    user_shell: Option<&str>,
    workspace_dir: &Path,
) -> ShellCommand {
    let parent = workspace_dir
        .parent()
        .unwrap_or(workspace_dir)
        .to_string_lossy()
        .into_owned();

    let mut env = BTreeMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("COLORTERM".to_string(), "truecolor".to_string());
    env.insert(WORKSPACE_PARENT_ENV.to_string(), parent);

    let (program, args) = match platform {
        Platform::Windows => (
            "powershell.exe".to_string(),
            vec![
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-NoExit".to_string(),
                "-Command".to_string(),
                POWERSHELL_PROMPT.to_string(),
            ],
        ),
        Platform::Linux | Platform::MacOs => {
            let fallback = if platform == Platform::MacOs {
                "/bin/zsh"
            } else {
                "/bin/bash"
            };
            let program = user_shell
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(fallback)
                .to_string();
            let args = match shell_name(&program) {
                "bash" => {
                    env.insert("PS1".to_string(), BASH_PROMPT.to_string());
                    vec!["--norc".to_string(), "--noprofile".to_string()]
                }
                "zsh" => {
                    env.insert("PROMPT".to_string(), ZSH_PROMPT.to_string());
                    vec!["-f".to_string(), "-o".to_string(), "PROMPT_SUBST".to_string()]
                }
                "sh" | "dash" | "ash" | "ksh" => {
                    env.insert("PS1".to_string(), POSIX_PROMPT.to_string());
                    Vec::new()
                }
                _ => Vec::new(),
            };
            (program, args)
        }
    };

    ShellCommand {
        program,
        args,
        env,
        cwd: workspace_dir.to_path_buf(),
    }
}

fn shell_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_skips_rc_files() {
        let cmd = shell_command(Platform::Linux, Some("/usr/bin/bash"), Path::new("/ws/proj"));
        assert_eq!(cmd.program, "/usr/bin/bash");
        assert_eq!(cmd.args, vec!["--norc", "--noprofile"]);
        assert_eq!(cmd.env.get("PS1").map(String::as_str), Some(BASH_PROMPT));
        assert_eq!(cmd.env.get(WORKSPACE_PARENT_ENV).map(String::as_str), Some("/ws"));
        assert_eq!(cmd.cwd, PathBuf::from("/ws/proj"));
    }

    #[test]
    fn zsh_enables_prompt_subst() {
        let cmd = shell_command(Platform::MacOs, Some("/bin/zsh"), Path::new("/ws/proj"));
        assert_eq!(cmd.args, vec!["-f", "-o", "PROMPT_SUBST"]);
        assert!(cmd.env.contains_key("PROMPT"));
        assert!(!cmd.env.contains_key("PS1"));
    }

    #[test]
    fn platform_fallback_shells() {
        let linux = shell_command(Platform::Linux, None, Path::new("/ws/p"));
        assert_eq!(linux.program, "/bin/bash");
        let mac = shell_command(Platform::MacOs, Some("  "), Path::new("/ws/p"));
        assert_eq!(mac.program, "/bin/zsh");
    }

    #[test]
    fn windows_uses_powershell() {
        let cmd = shell_command(Platform::Windows, Some("/bin/bash"), Path::new("/ws/p"));
        assert_eq!(cmd.program, "powershell.exe");
        assert_eq!(&cmd.args[..3], &["-NoLogo", "-NoProfile", "-NoExit"]);
        assert!(cmd.args.last().unwrap().contains(WORKSPACE_PARENT_ENV));
    }

    #[test]
    fn unknown_shell_gets_env_only() {
        let cmd = shell_command(Platform::Linux, Some("/usr/bin/fish"), Path::new("/ws/p"));
        assert!(cmd.args.is_empty());
        assert!(!cmd.env.contains_key("PS1"));
        assert_eq!(cmd.env.get("TERM").map(String::as_str), Some("xterm-256color"));
    }

    #[test]
    fn prompt_references_parent_env() {
        assert!(BASH_PROMPT.contains(WORKSPACE_PARENT_ENV));
        assert!(ZSH_PROMPT.contains(WORKSPACE_PARENT_ENV));
        assert!(POSIX_PROMPT.contains(WORKSPACE_PARENT_ENV));
    }
}
