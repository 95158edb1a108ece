// Git surface over workspace exec
//
// Every operation shells out inside the workspace container through the
// WorkspaceExec seam. Paths and messages are single-quote escaped and
// passed after a `--` separator where git accepts one. Parsers skip
// malformed lines instead of failing the whole call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::spec::ExecResult;

const GIT_TIMEOUT_S: u64 = 60;

/// Exec seam: the compute client (API side) and the driver (host side)
/// both provide this per workspace.
#[async_trait]
pub trait WorkspaceExec: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<ExecResult>;
}

/// Safely escape a string for use as a single shell argument.
/// Single quotes are closed, escaped, and reopened: it's -> 'it'"'"'s'
pub fn escape_shell_arg(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\"'\"'"))
}

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: String,
    pub is_clean: bool,
    pub ahead: u32,
    pub behind: u32,
    pub staged: Vec<FileStatus>,
    pub unstaged: Vec<FileStatus>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitCommit {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitBranch {
    pub name: String,
    pub is_current: bool,
    pub is_remote: bool,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchComparison {
    pub ahead: u32,
    pub behind: u32,
    pub files: Vec<DiffEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePreview {
    pub can_merge: bool,
    pub conflicts: Vec<String>,
    pub files: Vec<DiffEntry>,
}

// ============================================================================
// Operations
// ============================================================================

pub async fn status(exec: &dyn WorkspaceExec) -> Result<GitStatus> {
    let result = exec
        .exec("git status --porcelain -b", None, GIT_TIMEOUT_S)
        .await?;
    Ok(parse_status(&result.stdout))
}

pub async fn log(exec: &dyn WorkspaceExec, limit: u32) -> Result<Vec<GitCommit>> {
    let result = exec
        .exec(
            &format!("git log --format='%H|%h|%s|%an|%aI' -n {}", limit),
            None,
            GIT_TIMEOUT_S,
        )
        .await?;
    Ok(parse_log(&result.stdout))
}

pub async fn diff(exec: &dyn WorkspaceExec, staged: bool) -> Result<Vec<DiffEntry>> {
    let flag = if staged { "--staged " } else { "" };
    let result = exec
        .exec(&format!("git diff {}--numstat", flag), None, GIT_TIMEOUT_S)
        .await?;
    Ok(parse_numstat(&result.stdout))
}

pub async fn branches(exec: &dyn WorkspaceExec) -> Result<Vec<GitBranch>> {
    let result = exec
        .exec(
            "git branch -a --format='%(refname:short)|%(objectname:short)|%(HEAD)'",
            None,
            GIT_TIMEOUT_S,
        )
        .await?;
    Ok(parse_branches(&result.stdout))
}

pub async fn stage(exec: &dyn WorkspaceExec, files: &[String]) -> Result<ExecResult> {
    let escaped: Vec<String> = files.iter().map(|f| escape_shell_arg(f)).collect();
    exec.exec(
        &format!("git add -- {}", escaped.join(" ")),
        None,
        GIT_TIMEOUT_S,
    )
    .await
}

pub async fn unstage(exec: &dyn WorkspaceExec, files: &[String]) -> Result<ExecResult> {
    let escaped: Vec<String> = files.iter().map(|f| escape_shell_arg(f)).collect();
    exec.exec(
        &format!("git reset HEAD -- {}", escaped.join(" ")),
        None,
        GIT_TIMEOUT_S,
    )
    .await
}

/// Commit staged changes; returns the new commit hash when parseable
pub async fn commit(exec: &dyn WorkspaceExec, message: &str) -> Result<Option<String>> {
    let result = exec
        .exec(
            &format!("git commit -m {}", escape_shell_arg(message)),
            None,
            GIT_TIMEOUT_S,
        )
        .await?;
    // Output looks like "[branch abc1234] message"
    Ok(result
        .stdout
        .split(']')
        .next()
        .and_then(|head| head.split_whitespace().last())
        .map(|hash| hash.to_string())
        .filter(|_| result.success()))
}

pub async fn push(
    exec: &dyn WorkspaceExec,
    remote: &str,
    branch: Option<&str>,
    force: bool,
    set_upstream: bool,
) -> Result<ExecResult> {
    let mut command = String::from("git push");
    if force {
        command.push_str(" --force");
    }
    if set_upstream {
        command.push_str(" -u");
    }
    command.push(' ');
    command.push_str(&escape_shell_arg(remote));
    if let Some(branch) = branch {
        command.push(' ');
        command.push_str(&escape_shell_arg(branch));
    }
    exec.exec(&command, None, 120).await
}

pub async fn pull(
    exec: &dyn WorkspaceExec,
    remote: &str,
    branch: Option<&str>,
) -> Result<ExecResult> {
    let mut command = format!("git pull {}", escape_shell_arg(remote));
    if let Some(branch) = branch {
        command.push(' ');
        command.push_str(&escape_shell_arg(branch));
    }
    exec.exec(&command, None, 120).await
}

pub async fn checkout(exec: &dyn WorkspaceExec, branch: &str, create: bool) -> Result<ExecResult> {
    let flag = if create { "-b " } else { "" };
    exec.exec(
        &format!("git checkout {}{}", flag, escape_shell_arg(branch)),
        None,
        GIT_TIMEOUT_S,
    )
    .await
}

/// Merge a worktree branch into a target branch
pub async fn worktree_merge(
    exec: &dyn WorkspaceExec,
    source_branch: &str,
    target_branch: &str,
    message: &str,
) -> Result<ExecResult> {
    let command = format!(
        "git checkout {target} && git merge --no-ff -m {msg} {source}",
        target = escape_shell_arg(target_branch),
        msg = escape_shell_arg(message),
        source = escape_shell_arg(source_branch),
    );
    exec.exec(&command, None, 120).await
}

/// Check whether merging a branch would conflict, leaving the tree clean
pub async fn worktree_check_conflicts(
    exec: &dyn WorkspaceExec,
    source_branch: &str,
) -> Result<MergePreview> {
    preview_merge(exec, source_branch).await
}

/// Remove a worktree and optionally its branch
pub async fn worktree_delete(
    exec: &dyn WorkspaceExec,
    worktree_path: &str,
    branch: Option<&str>,
    force: bool,
) -> Result<ExecResult> {
    let mut command = String::from("git worktree remove");
    if force {
        command.push_str(" --force");
    }
    command.push(' ');
    command.push_str(&escape_shell_arg(worktree_path));
    if let Some(branch) = branch {
        command.push_str(&format!(" && git branch -D {}", escape_shell_arg(branch)));
    }
    exec.exec(&command, None, GIT_TIMEOUT_S).await
}

/// Ahead/behind counts plus the file-level diff between two refs
pub async fn compare(
    exec: &dyn WorkspaceExec,
    base: &str,
    head: &str,
) -> Result<BranchComparison> {
    let counts = exec
        .exec(
            &format!(
                "git rev-list --left-right --count {}...{}",
                escape_shell_arg(base),
                escape_shell_arg(head)
            ),
            None,
            GIT_TIMEOUT_S,
        )
        .await?;

    let (behind, ahead) = {
        let mut parts = counts.stdout.split_whitespace();
        let left = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let right = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        (left, right)
    };

    let numstat = exec
        .exec(
            &format!(
                "git diff --numstat {}...{}",
                escape_shell_arg(base),
                escape_shell_arg(head)
            ),
            None,
            GIT_TIMEOUT_S,
        )
        .await?;

    Ok(BranchComparison {
        ahead,
        behind,
        files: parse_numstat(&numstat.stdout),
    })
}

/// Dry-run merge: attempt with --no-commit --no-ff, collect conflicts and
/// file changes, then abort explicitly so the tree is left untouched.
pub async fn preview_merge(exec: &dyn WorkspaceExec, source_branch: &str) -> Result<MergePreview> {
    let merge = exec
        .exec(
            &format!(
                "git merge --no-commit --no-ff {}",
                escape_shell_arg(source_branch)
            ),
            None,
            120,
        )
        .await?;

    let conflicts = if merge.success() {
        Vec::new()
    } else {
        let listing = exec
            .exec(
                "git diff --name-only --diff-filter=U",
                None,
                GIT_TIMEOUT_S,
            )
            .await?;
        listing
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect()
    };

    let files = {
        let numstat = exec
            .exec("git diff --cached --numstat", None, GIT_TIMEOUT_S)
            .await?;
        parse_numstat(&numstat.stdout)
    };

    // Always abort; a failed abort on an already-clean tree is harmless
    let _ = exec.exec("git merge --abort", None, GIT_TIMEOUT_S).await;

    Ok(MergePreview {
        can_merge: merge.success(),
        conflicts,
        files,
    })
}

// ============================================================================
// Parsers
// ============================================================================

fn status_char_to_name(c: char) -> &'static str {
    match c {
        'M' => "modified",
        'A' => "added",
        'D' => "deleted",
        'R' => "renamed",
        'C' => "copied",
        'U' => "unmerged",
        _ => "unknown",
    }
}

/// Parse `git status --porcelain -b` output
pub fn parse_status(output: &str) -> GitStatus {
    let mut status = GitStatus {
        branch: "main".to_string(),
        ..Default::default()
    };

    for line in output.lines() {
        if let Some(branch_info) = line.strip_prefix("## ") {
            status.branch = branch_info
                .split("...")
                .next()
                .and_then(|b| b.split_whitespace().next())
                .unwrap_or("main")
                .to_string();
            if let Some(ahead) = branch_info.split("[ahead ").nth(1) {
                status.ahead = ahead
                    .split([']', ','])
                    .next()
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
            }
            if let Some(behind) = branch_info.split("behind ").nth(1) {
                status.behind = behind
                    .split(']')
                    .next()
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
            }
            continue;
        }

        let mut chars = line.chars();
        let (Some(index), Some(worktree)) = (chars.next(), chars.next()) else {
            continue;
        };
        if line.len() < 4 {
            continue;
        }
        let path = line[3..].to_string();

        if index == '?' {
            status.untracked.push(path);
            continue;
        }
        if index != ' ' {
            status.staged.push(FileStatus {
                path: path.clone(),
                status: status_char_to_name(index).to_string(),
            });
        }
        if worktree != ' ' {
            status.unstaged.push(FileStatus {
                path,
                status: status_char_to_name(worktree).to_string(),
            });
        }
    }

    status.is_clean =
        status.staged.is_empty() && status.unstaged.is_empty() && status.untracked.is_empty();
    status
}

/// Parse `git log --format='%H|%h|%s|%an|%aI'` output
pub fn parse_log(output: &str) -> Vec<GitCommit> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.splitn(5, '|').collect();
            if parts.len() < 5 {
                return None;
            }
            Some(GitCommit {
                hash: parts[0].to_string(),
                short_hash: parts[1].to_string(),
                message: parts[2].to_string(),
                author: parts[3].to_string(),
                date: parts[4].to_string(),
            })
        })
        .collect()
}

/// Parse `git branch -a --format='%(refname:short)|%(objectname:short)|%(HEAD)'`
pub fn parse_branches(output: &str) -> Vec<GitBranch> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() < 3 {
                return None;
            }
            let name = parts[0].trim();
            if name.is_empty() {
                return None;
            }
            let is_remote = name.starts_with("remotes/") || name.starts_with("origin/");
            Some(GitBranch {
                name: name.trim_start_matches("remotes/").to_string(),
                is_current: parts[2].trim() == "*",
                is_remote,
                commit_hash: Some(parts[1].trim().to_string()).filter(|h| !h.is_empty()),
            })
        })
        .collect()
}

/// Parse `git diff --numstat` output; binary entries ("-") count as 0
pub fn parse_numstat(output: &str) -> Vec<DiffEntry> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 3 {
                return None;
            }
            Some(DiffEntry {
                path: parts[2].to_string(),
                additions: parts[0].parse().unwrap_or(0),
                deletions: parts[1].parse().unwrap_or(0),
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_shell_arg() {
        assert_eq!(escape_shell_arg("plain"), "'plain'");
        assert_eq!(escape_shell_arg("it's"), "'it'\"'\"'s'");
        assert_eq!(escape_shell_arg("a;rm -rf /"), "'a;rm -rf /'");
    }

    #[test]
    fn test_parse_status_branch_and_counts() {
        let output = "## feature/x...origin/feature/x [ahead 2, behind 1]\nM  src/main.rs\n M README.md\n?? notes.txt\n";
        let status = parse_status(output);

        assert_eq!(status.branch, "feature/x");
        assert_eq!(status.ahead, 2);
        assert_eq!(status.behind, 1);
        assert!(!status.is_clean);
        assert_eq!(status.staged.len(), 1);
        assert_eq!(status.staged[0].path, "src/main.rs");
        assert_eq!(status.staged[0].status, "modified");
        assert_eq!(status.unstaged.len(), 1);
        assert_eq!(status.unstaged[0].path, "README.md");
        assert_eq!(status.untracked, vec!["notes.txt".to_string()]);
    }

    #[test]
    fn test_parse_status_clean() {
        let status = parse_status("## main...origin/main\n");
        assert_eq!(status.branch, "main");
        assert!(status.is_clean);
        assert_eq!(status.ahead, 0);
    }

    #[test]
    fn test_parse_status_both_staged_and_unstaged() {
        let status = parse_status("## main\nMM src/lib.rs\n");
        assert_eq!(status.staged.len(), 1);
        assert_eq!(status.unstaged.len(), 1);
    }

    #[test]
    fn test_parse_log_skips_malformed() {
        let output = "abc123|abc|Fix bug|Ada|2026-07-01T10:00:00+00:00\nnot a log line\n";
        let commits = parse_log(output);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].short_hash, "abc");
        assert_eq!(commits[0].author, "Ada");
    }

    #[test]
    fn test_parse_log_message_with_pipes() {
        let output = "abc123|abc|feat: a|b|Ada surname|2026-07-01\n";
        let commits = parse_log(output);
        // splitn(5) keeps extra pipes inside the trailing field
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].message, "feat: a");
    }

    #[test]
    fn test_parse_branches() {
        let output = "main|a1b2c3d|*\nfeature/x|e4f5a6b|\nremotes/origin/main|a1b2c3d|\n";
        let branches = parse_branches(output);
        assert_eq!(branches.len(), 3);
        assert!(branches[0].is_current);
        assert!(!branches[0].is_remote);
        assert!(!branches[1].is_current);
        assert!(branches[2].is_remote);
        assert_eq!(branches[2].name, "origin/main");
    }

    #[test]
    fn test_parse_numstat() {
        let output = "10\t2\tsrc/main.rs\n-\t-\tassets/logo.png\nbroken line\n";
        let entries = parse_numstat(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].additions, 10);
        assert_eq!(entries[0].deletions, 2);
        assert_eq!(entries[1].additions, 0);
        assert_eq!(entries[1].path, "assets/logo.png");
    }

    // Scripted exec for operation-level tests
    struct ScriptedExec {
        responses: std::sync::Mutex<Vec<(String, ExecResult)>>,
        commands: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedExec {
        fn new(responses: Vec<(&str, ExecResult)>) -> Self {
            Self {
                responses: std::sync::Mutex::new(
                    responses
                        .into_iter()
                        .map(|(c, r)| (c.to_string(), r))
                        .collect(),
                ),
                commands: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    fn ok_result(stdout: &str) -> ExecResult {
        ExecResult {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[async_trait]
    impl WorkspaceExec for ScriptedExec {
        async fn exec(
            &self,
            command: &str,
            _working_dir: Option<&str>,
            _timeout_s: u64,
        ) -> Result<ExecResult> {
            self.commands.lock().unwrap().push(command.to_string());
            let mut responses = self.responses.lock().unwrap();
            if let Some(pos) = responses
                .iter()
                .position(|(prefix, _)| command.starts_with(prefix.as_str()))
            {
                Ok(responses.remove(pos).1)
            } else {
                Ok(ok_result(""))
            }
        }
    }

    #[tokio::test]
    async fn test_commit_parses_hash() {
        let exec = ScriptedExec::new(vec![(
            "git commit",
            ok_result("[main 9f8e7d6] add feature\n 1 file changed"),
        )]);
        let hash = commit(&exec, "add feature").await.unwrap();
        assert_eq!(hash.as_deref(), Some("9f8e7d6"));

        let commands = exec.commands.lock().unwrap();
        assert_eq!(commands[0], "git commit -m 'add feature'");
    }

    #[tokio::test]
    async fn test_stage_uses_separator_and_escaping() {
        let exec = ScriptedExec::new(vec![]);
        stage(
            &exec,
            &["src/main.rs".to_string(), "it's odd.txt".to_string()],
        )
        .await
        .unwrap();

        let commands = exec.commands.lock().unwrap();
        assert_eq!(commands[0], "git add -- 'src/main.rs' 'it'\"'\"'s odd.txt'");
    }

    #[tokio::test]
    async fn test_preview_merge_conflict_aborts() {
        let exec = ScriptedExec::new(vec![
            (
                "git merge --no-commit",
                ExecResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "CONFLICT (content)".to_string(),
                },
            ),
            ("git diff --name-only", ok_result("src/clash.rs\n")),
            ("git diff --cached --numstat", ok_result("3\t1\tsrc/clash.rs\n")),
        ]);

        let preview = preview_merge(&exec, "feature/x").await.unwrap();
        assert!(!preview.can_merge);
        assert_eq!(preview.conflicts, vec!["src/clash.rs".to_string()]);

        let commands = exec.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c == "git merge --abort"));
    }

    #[tokio::test]
    async fn test_compare_counts() {
        let exec = ScriptedExec::new(vec![
            ("git rev-list", ok_result("1\t3\n")),
            ("git diff --numstat", ok_result("5\t0\tsrc/new.rs\n")),
        ]);
        let cmp = compare(&exec, "main", "feature/x").await.unwrap();
        assert_eq!(cmp.behind, 1);
        assert_eq!(cmp.ahead, 3);
        assert_eq!(cmp.files.len(), 1);
    }
}
