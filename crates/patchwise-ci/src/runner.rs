//! Check execution and outcome classification.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use patchwise_core::domain::check::DIR_PLACEHOLDER;
use patchwise_core::{
    git, CheckError, CheckErrorKind, CheckOutcome, CheckSpec, Execution, OutcomeClass, PatchDiff,
    PatchReference, PatchwiseError, Repeat, Result, ReviewKind,
};
use patchwise_env::{EnvironmentHandle, MaterializedTree};
use patchwise_review::ReviewExecutor;

use crate::normalize::{normalize, parse_warning_count};

/// Output kept per stream; anything beyond is discarded.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;
/// How long to wait for output pipes to close after a kill.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Per-run facts every check invocation shares.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub patch: PatchReference,
    pub diff: PatchDiff,
    /// Value of `{jobs}`.
    pub jobs: usize,
}

impl RunContext {
    pub fn new(patch: PatchReference, diff: PatchDiff, jobs: usize) -> Self {
        Self {
            patch,
            diff,
            jobs: jobs.max(1),
        }
    }

    /// Read the patch's diff from its repository.
    pub async fn prepare(patch: PatchReference, jobs: usize) -> Result<Self> {
        let for_git = patch.clone();
        let text = tokio::task::spawn_blocking(move || git::diff(&for_git.repo_path, &for_git))
            .await
            .map_err(|e| PatchwiseError::GitError(format!("diff task failed: {e}")))??;
        Ok(Self::new(patch, PatchDiff::parse(&text), jobs))
    }

    fn placeholder_values(&self, tree: &Path) -> HashMap<&'static str, Vec<String>> {
        let mut values = HashMap::new();
        values.insert("base", vec![self.patch.base_revision.clone()]);
        values.insert("target", vec![self.patch.target_revision.clone()]);
        values.insert("tree", vec![tree.to_string_lossy().into_owned()]);
        values.insert(
            "touched_files",
            self.diff
                .files
                .iter()
                .filter(|f| !f.deleted)
                .map(|f| f.path.clone())
                .collect(),
        );
        values.insert("touched_dirs", self.diff.touched_dirs());
        values.insert("jobs", vec![self.jobs.to_string()]);
        values
    }
}

/// Substitute placeholders in `argv`. An argument consisting of exactly one
/// list placeholder expands to one argument per value; elsewhere values are
/// joined with spaces.
pub fn expand_argv(argv: &[String], values: &HashMap<&'static str, Vec<String>>) -> Vec<String> {
    let mut out = Vec::with_capacity(argv.len());
    for arg in argv {
        let whole = arg
            .strip_prefix('{')
            .and_then(|a| a.strip_suffix('}'))
            .and_then(|name| values.get(name));
        match whole {
            Some(list) if list.len() != 1 => out.extend(list.iter().cloned()),
            _ => out.push(substitute(arg, values)),
        }
    }
    out
}

fn substitute(arg: &str, values: &HashMap<&'static str, Vec<String>>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        let (before, after) = rest.split_at(open);
        out.push_str(before);
        let value = after[1..].find('}').and_then(|close| {
            let name = &after[1..1 + close];
            let shell_var = before.ends_with('$');
            (!shell_var)
                .then(|| values.get(name))
                .flatten()
                .map(|v| (v.join(" "), close + 2))
        });
        match value {
            Some((text, consumed)) => {
                out.push_str(&text);
                rest = &after[consumed..];
            }
            None => {
                out.push('{');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Map an exit status and the findings it produced to an outcome class.
///
/// `parsed` counts attributable findings; `total` also includes the
/// parse-warning finding.
pub fn classify(exit_code: i32, soft_failure_codes: &[i32], parsed: usize, total: usize) -> OutcomeClass {
    if exit_code == 0 || soft_failure_codes.contains(&exit_code) {
        if total == 0 {
            OutcomeClass::Clean
        } else {
            OutcomeClass::FindingsReported
        }
    } else if parsed > 0 {
        OutcomeClass::FindingsReported
    } else {
        OutcomeClass::ToolFailure
    }
}

enum Exit {
    Exited(i32),
    TimedOut,
    Cancelled,
}

struct Captured {
    exit: Exit,
    stdout: String,
    stderr: String,
}

/// Executes one check against a materialized tree.
#[derive(Default)]
pub struct CheckRunner {
    reviewer: Option<Arc<dyn ReviewExecutor>>,
}

impl CheckRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn ReviewExecutor>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Run `spec` in `tree`. Never fails: every problem ends up in the
    /// returned outcome.
    #[instrument(skip_all, fields(check = %spec.id))]
    pub async fn run(
        &self,
        spec: &CheckSpec,
        handle: &EnvironmentHandle,
        tree: &MaterializedTree,
        ctx: &RunContext,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CheckOutcome {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        let outcome = match &spec.execution {
            Execution::Command {
                argv,
                workdir,
                soft_failure_codes,
                repeat,
            } => {
                let workdir = match workdir {
                    Some(dir) => tree.root.join(dir),
                    None => tree.root.clone(),
                };
                let invocations = invocations(argv, *repeat, ctx, &tree.root);
                self.run_command(spec, handle, &workdir, invocations, soft_failure_codes, ctx, tree, deadline, cancel)
                    .await
            }
            Execution::Review { kind } => self.run_review(spec, *kind, tree, ctx, deadline, cancel).await,
        };

        let outcome = outcome
            .with_elapsed_ms(start.elapsed().as_millis() as u64)
            .with_tree_root(&tree.root);
        let outcome = match (outcome.class, timeout) {
            (OutcomeClass::TimedOut, Some(limit)) => outcome.with_error(CheckError::new(
                CheckErrorKind::TimedOut,
                format!("exceeded timeout of {}s", limit.as_secs()),
            )),
            _ => outcome,
        };
        debug!(class = %outcome.class, elapsed_ms = outcome.elapsed_ms, "check finished");
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command(
        &self,
        spec: &CheckSpec,
        handle: &EnvironmentHandle,
        workdir: &Path,
        invocations: Vec<Vec<String>>,
        soft_failure_codes: &[i32],
        ctx: &RunContext,
        tree: &MaterializedTree,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> CheckOutcome {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;

        for argv in invocations {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            debug!(program = %program, args = args.len(), "spawning");
            let mut command = handle.command(program, args, workdir);
            let captured = match execute(&mut command, deadline, cancel).await {
                Ok(captured) => captured,
                Err(err) => {
                    return CheckOutcome::infrastructure_failure(
                        &spec.id,
                        CheckError::new(
                            CheckErrorKind::InfrastructureFailure,
                            format!("failed to spawn `{program}`: {err}"),
                        ),
                    )
                    .with_output(stdout, stderr);
                }
            };
            stdout.push_str(&captured.stdout);
            stderr.push_str(&captured.stderr);

            match captured.exit {
                Exit::Exited(code) => {
                    let worse = exit_code == 0
                        || (soft_failure_codes.contains(&exit_code)
                            && !soft_failure_codes.contains(&code));
                    if code != 0 && worse {
                        exit_code = code;
                    }
                }
                Exit::TimedOut => {
                    return CheckOutcome::new(&spec.id, OutcomeClass::TimedOut)
                        .with_output(stdout, stderr);
                }
                Exit::Cancelled => {
                    return CheckOutcome::cancelled(&spec.id).with_output(stdout, stderr);
                }
            }
        }

        let provisional = CheckOutcome::new(&spec.id, OutcomeClass::FindingsReported)
            .with_output(stdout, stderr)
            .with_exit_code(Some(exit_code))
            .with_tree_root(&tree.root);
        let findings = normalize(spec, &provisional, &ctx.diff);
        let parsed = findings.len() - parse_warning_count(&findings);

        let class = classify(exit_code, soft_failure_codes, parsed, findings.len());
        let mut outcome = provisional;
        outcome.class = class;
        if class == OutcomeClass::ToolFailure {
            outcome = outcome.with_error(CheckError::new(
                CheckErrorKind::ToolFailure,
                format!("exited with status {exit_code}"),
            ));
        }
        outcome
    }

    async fn run_review(
        &self,
        spec: &CheckSpec,
        kind: ReviewKind,
        tree: &MaterializedTree,
        ctx: &RunContext,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> CheckOutcome {
        let Some(reviewer) = &self.reviewer else {
            return CheckOutcome::infrastructure_failure(
                &spec.id,
                CheckError::new(CheckErrorKind::BackendUnavailable, "no review backend configured"),
            );
        };

        let result = tokio::select! {
            result = reviewer.review(kind, &tree.root, &ctx.patch) => result,
            _ = until(deadline) => return CheckOutcome::new(&spec.id, OutcomeClass::TimedOut),
            _ = cancel.cancelled() => return CheckOutcome::cancelled(&spec.id),
        };

        match result {
            Ok(text) => {
                let provisional =
                    CheckOutcome::new(&spec.id, OutcomeClass::FindingsReported).with_output(text, "");
                let findings = normalize(spec, &provisional, &ctx.diff);
                let mut outcome = provisional;
                if findings.is_empty() {
                    outcome.class = OutcomeClass::Clean;
                }
                outcome
            }
            Err(err) => {
                warn!(check = %spec.id, error = %err, "review failed");
                let class = match err.kind() {
                    CheckErrorKind::ToolFailure => OutcomeClass::ToolFailure,
                    _ => OutcomeClass::InfrastructureFailure,
                };
                CheckOutcome::new(&spec.id, class).with_error(err.to_check_error())
            }
        }
    }
}

/// Expanded argument vectors to run, in order.
fn invocations(argv: &[String], repeat: Repeat, ctx: &RunContext, tree: &Path) -> Vec<Vec<String>> {
    let mut values = ctx.placeholder_values(tree);
    match repeat {
        Repeat::Once => vec![expand_argv(argv, &values)],
        Repeat::PerTouchedDirectory => {
            let mut dirs = ctx.diff.touched_dirs();
            // The root covers the whole tree, so it only runs on its own.
            if dirs.len() > 1 {
                dirs.retain(|dir| dir != ".");
            }
            if dirs.is_empty() {
                dirs.push(".".to_string());
            }
            dirs.into_iter()
                .map(|dir| {
                    values.insert(DIR_PLACEHOLDER, vec![dir]);
                    expand_argv(argv, &values)
                })
                .collect()
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Spawn `command` and wait for it, the deadline, or cancellation,
/// whichever comes first. Output read before a kill is kept.
async fn execute(
    command: &mut tokio::process::Command,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> std::io::Result<Captured> {
    let mut child = command.spawn()?;

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(collect(out, stdout_buf.clone())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(collect(err, stderr_buf.clone())));
    }

    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Exit::Exited(status.code().unwrap_or(-1)),
            Err(err) => {
                warn!(error = %err, "waiting for child failed");
                Exit::Exited(-1)
            }
        },
        _ = until(deadline) => Exit::TimedOut,
        _ = cancel.cancelled() => Exit::Cancelled,
    };

    if !matches!(exit, Exit::Exited(_)) {
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "kill failed; child already gone");
        }
        let _ = tokio::time::timeout(DRAIN_GRACE, child.wait()).await;
    }
    for mut reader in readers {
        if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
            // A grandchild still holds the pipe open.
            reader.abort();
        }
    }

    Ok(Captured {
        exit,
        stdout: take_text(&stdout_buf),
        stderr: take_text(&stderr_buf),
    })
}

async fn collect<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = buf.lock().unwrap_or_else(|e| e.into_inner());
                let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

fn take_text(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    let buf = buf.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwise_core::DiagnosticFormat;
    use patchwise_env::ExecTarget;
    use std::path::PathBuf;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn values() -> HashMap<&'static str, Vec<String>> {
        let mut v = HashMap::new();
        v.insert("base", vec!["abc".to_string()]);
        v.insert("target", vec!["def".to_string()]);
        v.insert("touched_files", args(&["a.c", "b/c.c"]));
        v.insert("touched_dirs", args(&["."]));
        v.insert("jobs", vec!["8".to_string()]);
        v
    }

    #[test]
    fn test_expand_list_placeholder_as_arguments() {
        let argv = args(&["lint", "{touched_files}", "-j{jobs}", "{base}..{target}"]);
        assert_eq!(
            expand_argv(&argv, &values()),
            args(&["lint", "a.c", "b/c.c", "-j8", "abc..def"])
        );
    }

    #[test]
    fn test_expand_inside_shell_script() {
        let argv = args(&["sh", "-c", "touch {touched_files} && echo ${HOME} {unknown}"]);
        assert_eq!(
            expand_argv(&argv, &values())[2],
            "touch a.c b/c.c && echo ${HOME} {unknown}"
        );
    }

    #[test]
    fn test_expand_empty_list_drops_argument() {
        let mut v = values();
        v.insert("touched_files", Vec::new());
        assert_eq!(expand_argv(&args(&["lint", "{touched_files}"]), &v), args(&["lint"]));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, &[], 0, 0), OutcomeClass::Clean);
        assert_eq!(classify(0, &[], 1, 1), OutcomeClass::FindingsReported);
        assert_eq!(classify(1, &[1], 2, 2), OutcomeClass::FindingsReported);
        assert_eq!(classify(1, &[1], 0, 0), OutcomeClass::Clean);
        assert_eq!(classify(2, &[1], 0, 1), OutcomeClass::ToolFailure);
        assert_eq!(classify(2, &[], 3, 3), OutcomeClass::FindingsReported);
    }

    fn host_handle(dir: &Path) -> EnvironmentHandle {
        EnvironmentHandle {
            environment_id: "base".to_string(),
            instance_id: "test".to_string(),
            scratch_dir: dir.to_path_buf(),
            digest: "host".to_string(),
            target: ExecTarget::Host,
        }
    }

    fn tree(dir: &Path) -> MaterializedTree {
        MaterializedTree::detached(dir.to_path_buf(), PathBuf::from("/nonexistent"), "def")
    }

    fn ctx() -> RunContext {
        let patch = PatchReference {
            repo_path: PathBuf::from("/nonexistent"),
            base_revision: "abc".to_string(),
            target_revision: "def".to_string(),
        };
        let diff = PatchDiff::parse(
            "diff --git a/drivers/foo.c b/drivers/foo.c\n\
             --- a/drivers/foo.c\n\
             +++ b/drivers/foo.c\n\
             @@ -41 +41 @@\n\
             -a\n\
             +b\n",
        );
        RunContext::new(patch, diff, 2)
    }

    fn shell_check(script: &str) -> CheckSpec {
        CheckSpec::command("tool", "base", args(&["sh", "-c", script]), DiagnosticFormat::Gcc)
    }

    async fn run(spec: &CheckSpec, timeout: Option<Duration>, cancel: &CancellationToken) -> CheckOutcome {
        let dir = tempfile::tempdir().unwrap();
        CheckRunner::new()
            .run(spec, &host_handle(dir.path()), &tree(dir.path()), &ctx(), timeout, cancel)
            .await
    }

    #[tokio::test]
    async fn test_clean_run() {
        let outcome = run(&shell_check("true"), None, &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::Clean);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_findings_with_nonzero_exit() {
        let spec = shell_check("echo 'drivers/foo.c:41:3: error: boom'; exit 2");
        let outcome = run(&spec, None, &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::FindingsReported);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_tool_failure_without_findings() {
        let spec = shell_check("echo 'make: *** [all] Error 1' >&2; exit 2");
        let outcome = run(&spec, None, &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::ToolFailure);
        assert_eq!(outcome.error_kind(), Some(CheckErrorKind::ToolFailure));
        assert!(outcome.stderr.contains("Error 1"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let spec = shell_check("echo 'drivers/foo.c:41:3: error: partial'; exec sleep 30");
        let outcome = run(&spec, Some(Duration::from_millis(300)), &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::TimedOut);
        assert_eq!(outcome.error_kind(), Some(CheckErrorKind::TimedOut));
        assert!(outcome.stdout.contains("partial"));
        assert!(outcome.elapsed_ms < 10_000);
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let outcome = run(&shell_check("exec sleep 30"), None, &cancel).await;
        assert_eq!(outcome.class, OutcomeClass::Cancelled);
        assert_eq!(outcome.error_kind(), Some(CheckErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_infrastructure() {
        let spec = CheckSpec::command(
            "missing",
            "base",
            args(&["patchwise-no-such-program"]),
            DiagnosticFormat::Gcc,
        );
        let outcome = run(&spec, None, &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::InfrastructureFailure);
        assert_eq!(outcome.error_kind(), Some(CheckErrorKind::InfrastructureFailure));
    }

    #[tokio::test]
    async fn test_repeat_per_directory() {
        let spec = shell_check("echo \"{dir}/foo.c:41:1: warning: in {dir}\"")
            .with_repeat(Repeat::PerTouchedDirectory);
        let outcome = run(&spec, None, &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::FindingsReported);
        assert_eq!(outcome.stdout.trim(), "drivers/foo.c:41:1: warning: in drivers");
    }

    fn ctx_with_diff(diff: &str) -> RunContext {
        let mut ctx = ctx();
        ctx.diff = PatchDiff::parse(diff);
        ctx
    }

    #[test]
    fn test_repeat_skips_root_next_to_other_dirs() {
        let ctx = ctx_with_diff(
            "diff --git a/Makefile b/Makefile\n\
             --- a/Makefile\n\
             +++ b/Makefile\n\
             @@ -1 +1 @@\n\
             -a\n\
             +b\n\
             diff --git a/drivers/foo.c b/drivers/foo.c\n\
             --- a/drivers/foo.c\n\
             +++ b/drivers/foo.c\n\
             @@ -1 +1 @@\n\
             -a\n\
             +b\n",
        );
        let argv = args(&["spatch", "M={dir}"]);
        let runs = invocations(&argv, Repeat::PerTouchedDirectory, &ctx, Path::new("/t"));
        assert_eq!(runs, vec![args(&["spatch", "M=drivers"])]);
    }

    #[tokio::test]
    async fn test_repeat_with_only_root_changes_still_runs() {
        let ctx = ctx_with_diff(
            "diff --git a/Makefile b/Makefile\n\
             --- a/Makefile\n\
             +++ b/Makefile\n\
             @@ -1 +1 @@\n\
             -a\n\
             +b\n",
        );
        let argv = args(&["spatch", "M={dir}"]);
        let runs = invocations(&argv, Repeat::PerTouchedDirectory, &ctx, Path::new("/t"));
        assert_eq!(runs, vec![args(&["spatch", "M=."])]);

        let dir = tempfile::tempdir().unwrap();
        let spec = shell_check("echo \"ran in {dir}\" >&2; exit 3")
            .with_repeat(Repeat::PerTouchedDirectory);
        let cancel = CancellationToken::new();
        let outcome = CheckRunner::new()
            .run(&spec, &host_handle(dir.path()), &tree(dir.path()), &ctx, None, &cancel)
            .await;
        assert_eq!(outcome.class, OutcomeClass::ToolFailure);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stderr.contains("ran in ."));
    }

    #[tokio::test]
    async fn test_review_without_backend() {
        let spec = CheckSpec::review("code-review", "base", ReviewKind::CodeReview);
        let outcome = run(&spec, None, &CancellationToken::new()).await;
        assert_eq!(outcome.class, OutcomeClass::InfrastructureFailure);
        assert_eq!(outcome.error_kind(), Some(CheckErrorKind::BackendUnavailable));
    }
}
